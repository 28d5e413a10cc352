use std::time::Duration;

use crate::core::element::{CommitOffset, RecordOffset, TopicPartition};

/// The consumer primitives the ingestion core relies on.
///
/// `poll` may return no records without that being an error, and `commit_sync` only
/// returns once the group's committed offsets have moved.
pub trait QueueConsumer: Send {
    /// Join the consumer group for `topic`, the group protocol hands out partitions.
    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()>;

    /// Take an explicit set of partitions, bypassing the group protocol.
    fn assign(&mut self, partitions: &[TopicPartition]) -> anyhow::Result<()>;

    /// Currently assigned partitions. Blocks up to `timeout` while the assignment is empty.
    fn assignment(&mut self, timeout: Duration) -> anyhow::Result<Vec<TopicPartition>>;

    /// Offset of the next record to be fetched, `None` while the queue does not know yet.
    fn position(&mut self, topic_partition: &TopicPartition) -> anyhow::Result<Option<i64>>;

    fn seek(&mut self, topic_partition: &TopicPartition, offset: i64) -> anyhow::Result<()>;

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Vec<RecordOffset>>;

    fn commit_sync(&mut self, offsets: &[CommitOffset]) -> anyhow::Result<()>;

    fn close(&mut self, timeout: Duration);
}

/// Opens a fresh connection for every Reader lifecycle.
pub trait ConsumerFactory: Send + Sync {
    type Consumer: QueueConsumer;

    fn create(&self, worker_id: usize) -> anyhow::Result<Self::Consumer>;
}
