use std::collections::BTreeMap;

use crate::core::element::{RecordBatch, TopicPartition};

/// Durable destination of record batches.
///
/// `persist` is synchronous: when it returns `Ok` every record of the batch must survive a
/// crash. Receiving the same (topic, partition, offset) twice must not duplicate the record.
pub trait StorageSink: Send + Sync {
    fn persist(&self, batch: RecordBatch) -> anyhow::Result<()>;

    /// Highest durable offset per partition, derived from what is already stored.
    fn last_persisted_offsets(&self) -> anyhow::Result<RecoveryOffsetTable>;

    /// Seal whatever is still open. Called once on shutdown.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Snapshot of the last durably persisted offset of each known partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryOffsetTable {
    offsets: BTreeMap<TopicPartition, i64>,
}

impl RecoveryOffsetTable {
    pub fn new() -> Self {
        RecoveryOffsetTable {
            offsets: BTreeMap::new(),
        }
    }

    /// Keeps the highest offset seen for the partition.
    pub fn update(&mut self, topic_partition: TopicPartition, offset: i64) {
        let entry = self.offsets.entry(topic_partition).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    pub fn last_persisted(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(topic_partition).map(|x| *x)
    }

    /// Where reading has to resume for the partition: right after the last durable record.
    pub fn resume_offset(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.last_persisted(topic_partition).map(|x| x + 1)
    }

    pub fn for_topic(&self, topic: &str) -> RecoveryOffsetTable {
        let offsets = self
            .offsets
            .iter()
            .filter(|(tp, _)| tp.topic.eq(topic))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        RecoveryOffsetTable { offsets }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, &i64)> {
        self.offsets.iter()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn to_json(&self) -> String {
        let snapshot: Vec<PartitionOffset> = self
            .offsets
            .iter()
            .map(|(tp, offset)| PartitionOffset {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *offset,
            })
            .collect();
        serde_json::to_string(&snapshot).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionOffset {
    topic: String,
    partition: i32,
    offset: i64,
}
