use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;

use crate::core::element::{RecordBatch, TopicPartition};
use crate::core::queue::QueueConsumer;
use crate::core::sink::StorageSink;
use crate::metrics::{BATCHES_COMMITTED, RECORDS_PERSISTED};
use crate::runtime::stop::StopSignal;
use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub polls: u64,
    pub empty_polls: u64,
    pub batches: u64,
    pub records: u64,
}

/// Drives one queue connection through poll, persist and commit cycles.
///
/// Offsets of a batch are committed only after the sink has made the batch durable.
/// The connection is released exactly once, by `close` or on drop.
pub struct Reader<C: QueueConsumer> {
    consumer: Option<C>,
    sink: Arc<dyn StorageSink>,
    poll_timeout: Duration,
    close_timeout: Duration,
    last_offsets: HashMap<TopicPartition, i64>,
    stats: ReaderStats,
}

impl<C: QueueConsumer> Reader<C> {
    pub fn new(
        consumer: C,
        sink: Arc<dyn StorageSink>,
        poll_timeout: Duration,
        close_timeout: Duration,
    ) -> Self {
        Reader {
            consumer: Some(consumer),
            sink,
            poll_timeout,
            close_timeout,
            last_offsets: HashMap::new(),
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub(crate) fn consumer(&mut self) -> Result<&mut C> {
        self.consumer
            .as_mut()
            .ok_or(Error::Queue(anyhow!("queue connection already closed")))
    }

    /// One poll cycle. Returns the number of records persisted and committed.
    pub fn read(&mut self) -> Result<usize> {
        let poll_timeout = self.poll_timeout;
        self.stats.polls += 1;

        // an empty result or a connection hiccup is retried by the caller, never fatal
        let records = match self.consumer()?.poll(poll_timeout) {
            Ok(records) => records,
            Err(e) => {
                warn!("poll failed, retrying. {}", e);
                Vec::new()
            }
        };

        let batch = match RecordBatch::new(records) {
            Some(batch) => batch,
            None => {
                self.stats.empty_polls += 1;
                debug!("records empty after poll");
                return Ok(0);
            }
        };

        self.track_offsets(&batch);

        let len = batch.len();
        let ranges = batch.describe();
        let commit_offsets = batch.commit_offsets();

        if let Err(e) = self.sink.persist(batch) {
            error!("persist failed, offsets not committed. batch: {}, error: {}", ranges, e);
            return Err(Error::Persist { ranges, source: e });
        }
        debug!("persisted {} records: {}", len, ranges);

        if let Err(e) = self.consumer()?.commit_sync(commit_offsets.as_slice()) {
            // the batch is durable, the queue will redeliver it and the sink dedups it
            error!("commit failed after persist. batch: {}, error: {}", ranges, e);
            return Err(Error::Commit { ranges, source: e });
        }

        self.stats.batches += 1;
        self.stats.records += len as u64;
        counter!(RECORDS_PERSISTED, len as u64);
        counter!(BATCHES_COMMITTED, 1);

        Ok(len)
    }

    fn track_offsets(&mut self, batch: &RecordBatch) {
        for record in batch.records() {
            let tp = record.topic_partition();
            match self.last_offsets.get(&tp) {
                Some(last) if record.offset() <= *last => {
                    warn!(
                        "redelivered record {} offset {}, last seen {}",
                        tp,
                        record.offset(),
                        last
                    );
                    continue;
                }
                Some(last) if record.offset() > *last + 1 => {
                    debug!("offset gap on {}: {} -> {}", tp, last, record.offset());
                }
                _ => {}
            }
            self.last_offsets.insert(tp, record.offset());
        }
    }

    /// Loops `read` until `stop` is observed at the top of an iteration or a cycle fails.
    pub fn run(&mut self, stop: &StopSignal) -> Result<()> {
        while !stop.is_stopped() {
            self.read()?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            consumer.close(self.close_timeout);
            info!("queue connection closed. stats: {:?}", self.stats);
        }
    }
}

impl<C: QueueConsumer> Drop for Reader<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::core::element::{RecordBatch, RecordOffset, TopicPartition};
    use crate::core::queue::QueueConsumer;
    use crate::core::sink::{RecoveryOffsetTable, StorageSink};
    use crate::queue::MemoryQueue;
    use crate::runtime::reader::Reader;
    use crate::runtime::stop::StopSignal;
    use crate::Error;

    /// Remembers every persisted record, can be told to fail.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) records: Mutex<Vec<RecordOffset>>,
        pub(crate) failures: Mutex<u32>,
    }

    impl RecordingSink {
        pub(crate) fn set_fail(&self, fail: bool) {
            self.fail_next(if fail { u32::MAX } else { 0 });
        }

        pub(crate) fn fail_next(&self, n: u32) {
            *self.failures.lock().unwrap() = n;
        }

        pub(crate) fn offsets(&self, partition: i32) -> Vec<i64> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.partition() == partition)
                .map(|r| r.offset())
                .collect()
        }
    }

    impl StorageSink for RecordingSink {
        fn persist(&self, batch: RecordBatch) -> anyhow::Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                if *failures != u32::MAX {
                    *failures -= 1;
                }
                return Err(anyhow!("disk full"));
            }
            drop(failures);
            self.records.lock().unwrap().extend(batch.into_records());
            Ok(())
        }

        fn last_persisted_offsets(&self) -> anyhow::Result<RecoveryOffsetTable> {
            let mut table = RecoveryOffsetTable::new();
            for r in self.records.lock().unwrap().iter() {
                table.update(r.topic_partition(), r.offset());
            }
            Ok(table)
        }
    }

    fn queue_with_records(partitions: usize, records: usize) -> MemoryQueue {
        let queue = MemoryQueue::new();
        queue.create_topic("events", partitions);
        for p in 0..partitions {
            for i in 0..records {
                queue.produce("events", p as i32, vec![i as u8]).unwrap();
            }
        }
        queue
    }

    fn subscribed_reader(
        queue: &MemoryQueue,
        sink: Arc<RecordingSink>,
        max_poll_records: usize,
    ) -> Reader<crate::queue::MemoryConsumer> {
        let mut consumer = queue.consumer("g1", max_poll_records);
        consumer.subscribe("events").unwrap();
        Reader::new(
            consumer,
            sink,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
    }

    #[test]
    pub fn commit_after_persist_test() {
        let queue = queue_with_records(1, 6);
        let sink = Arc::new(RecordingSink::default());
        let mut reader = subscribed_reader(&queue, sink.clone(), 4);
        let tp = TopicPartition::new("events", 0);

        assert_eq!(reader.read().unwrap(), 4);
        assert_eq!(sink.offsets(0), vec![0, 1, 2, 3]);
        assert_eq!(queue.committed("g1", &tp), Some(4));

        assert_eq!(reader.read().unwrap(), 2);
        assert_eq!(queue.committed("g1", &tp), Some(6));

        let commits: Vec<i64> = queue.commit_history("g1").iter().map(|c| c.offset).collect();
        assert_eq!(commits, vec![4, 6]);
    }

    #[test]
    pub fn no_commit_on_persist_failure_test() {
        let queue = queue_with_records(2, 3);
        let sink = Arc::new(RecordingSink::default());
        sink.set_fail(true);
        let mut reader = subscribed_reader(&queue, sink.clone(), 100);

        match reader.read() {
            Err(Error::Persist { ranges, .. }) => {
                assert_eq!(ranges, "events-0[0..=2], events-1[0..=2]")
            }
            other => panic!("expected persist failure, got {:?}", other.map(|_| ())),
        }
        assert!(queue.commit_history("g1").is_empty());
        assert_eq!(queue.committed("g1", &TopicPartition::new("events", 0)), None);
    }

    #[test]
    pub fn empty_poll_test() {
        let queue = queue_with_records(1, 2);
        let sink = Arc::new(RecordingSink::default());
        let mut reader = subscribed_reader(&queue, sink.clone(), 10);
        let tp = TopicPartition::new("events", 0);

        assert_eq!(reader.read().unwrap(), 2);
        assert_eq!(queue.committed("g1", &tp), Some(2));

        for _ in 0..3 {
            assert_eq!(reader.read().unwrap(), 0);
        }
        queue.fail_next_polls(1);
        assert_eq!(reader.read().unwrap(), 0);

        assert_eq!(queue.committed("g1", &tp), Some(2));
        assert_eq!(queue.commit_history("g1").len(), 1);
        assert_eq!(reader.stats().empty_polls, 4);

        queue.produce("events", 0, b"late".to_vec()).unwrap();
        assert_eq!(reader.read().unwrap(), 1);
        assert_eq!(queue.committed("g1", &tp), Some(3));
    }

    #[test]
    pub fn commit_failure_test() {
        let queue = queue_with_records(1, 3);
        let sink = Arc::new(RecordingSink::default());
        let mut reader = subscribed_reader(&queue, sink.clone(), 10);
        queue.fail_next_commits(1);

        assert!(matches!(reader.read(), Err(Error::Commit { .. })));
        // persisted but not committed: a later lifecycle sees these records again
        assert_eq!(sink.offsets(0), vec![0, 1, 2]);
        assert_eq!(queue.committed("g1", &TopicPartition::new("events", 0)), None);
    }

    #[test]
    pub fn ordered_commits_test() {
        let queue = queue_with_records(2, 10);
        let sink = Arc::new(RecordingSink::default());
        let mut reader = subscribed_reader(&queue, sink.clone(), 3);

        let mut total = 0;
        while total < 20 {
            total += reader.read().unwrap();
        }

        for p in 0..2 {
            assert_eq!(sink.offsets(p), (0..10).collect::<Vec<i64>>());
            let tp = TopicPartition::new("events", p);
            let commits: Vec<i64> = queue
                .commit_history("g1")
                .into_iter()
                .filter(|c| c.topic_partition == tp)
                .map(|c| c.offset)
                .collect();
            assert!(commits.windows(2).all(|w| w[0] < w[1]), "{:?}", commits);
            assert_eq!(commits.last(), Some(&10));
        }
    }

    #[test]
    pub fn stop_and_close_once_test() {
        let queue = queue_with_records(1, 2);
        let sink = Arc::new(RecordingSink::default());
        let mut reader = subscribed_reader(&queue, sink.clone(), 10);

        let stop = StopSignal::new();
        stop.stop();
        reader.run(&stop).unwrap();
        assert!(sink.offsets(0).is_empty());

        reader.close();
        drop(reader);
        assert_eq!(queue.closed_consumers(), 1);
    }

    #[test]
    pub fn close_on_failure_unwind_test() {
        let queue = queue_with_records(1, 2);
        let sink = Arc::new(RecordingSink::default());
        sink.set_fail(true);
        {
            let mut reader = subscribed_reader(&queue, sink.clone(), 10);
            assert!(reader.run(&StopSignal::new()).is_err());
        }
        assert_eq!(queue.closed_consumers(), 1);
    }
}
