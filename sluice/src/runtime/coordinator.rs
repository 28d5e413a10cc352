use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::assignment::AssignmentStrategy;
use crate::core::element::TopicPartition;
use crate::core::queue::{ConsumerFactory, QueueConsumer};
use crate::core::sink::{RecoveryOffsetTable, StorageSink};
use crate::runtime::reader::Reader;
use crate::runtime::stop::StopSignal;
use crate::utils::thread;
use crate::{Error, Result};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct ReaderOptions {
    pub poll_timeout: Duration,
    pub close_timeout: Duration,
    /// How long to block for the group to hand out partitions before seeking.
    pub assignment_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            assignment_timeout: DEFAULT_ASSIGNMENT_TIMEOUT,
        }
    }
}

/// What to do when a Reader lifecycle fails: rebuild it after a doubling backoff,
/// at most `max_restarts` consecutive times (`None` for no limit).
#[derive(Clone, Debug)]
pub struct RestartPolicy {
    pub max_restarts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    pub fn never() -> Self {
        RestartPolicy {
            max_restarts: Some(0),
            ..Default::default()
        }
    }

    pub fn allows(&self, consecutive_failures: u32) -> bool {
        match self.max_restarts {
            Some(max_restarts) => consecutive_failures <= max_restarts,
            None => true,
        }
    }

    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_restarts: Some(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Builds correctly positioned Readers for one topic and supervises them.
///
/// Every Reader lifecycle gets a fresh connection. Partitions are seeked to the offset right
/// after the last durably persisted record, but never backward of where the queue already is.
pub struct Coordinator<F: ConsumerFactory> {
    worker_id: usize,
    topic: String,
    factory: F,
    sink: Arc<dyn StorageSink>,
    recovery: RecoveryOffsetTable,
    assignment: AssignmentStrategy,
    options: ReaderOptions,
    restart_policy: RestartPolicy,
    stop: StopSignal,
}

impl<F: ConsumerFactory> Coordinator<F> {
    pub fn new(
        worker_id: usize,
        topic: &str,
        factory: F,
        sink: Arc<dyn StorageSink>,
        recovery: RecoveryOffsetTable,
        assignment: AssignmentStrategy,
        options: ReaderOptions,
    ) -> Self {
        Coordinator {
            worker_id,
            topic: topic.to_string(),
            factory,
            sink,
            recovery: recovery.for_topic(topic),
            assignment,
            options,
            restart_policy: RestartPolicy::default(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_restart_policy(mut self, restart_policy: RestartPolicy) -> Self {
        self.restart_policy = restart_policy;
        self
    }

    pub fn name(&self) -> String {
        format!("coordinator-{}-{}", self.topic, self.worker_id)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask the running loop to finish. Safe to call from any thread.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn create_reader(&self) -> Result<Reader<F::Consumer>> {
        self.create_reader_with(&self.recovery)
    }

    fn create_reader_with(&self, recovery: &RecoveryOffsetTable) -> Result<Reader<F::Consumer>> {
        let consumer = self.factory.create(self.worker_id).map_err(Error::Queue)?;

        // owned by the reader from here on, so any error below still releases the connection
        let mut reader = Reader::new(
            consumer,
            self.sink.clone(),
            self.options.poll_timeout,
            self.options.close_timeout,
        );

        let consumer = reader.consumer()?;
        let partitions = self.resolve_assignment(consumer)?;
        let seeks = seek_to_recovery(consumer, partitions.as_slice(), recovery)?;

        info!(
            "reader created. worker: {}, topic: {}, assignment: {:?}, seeks: {:?}",
            self.worker_id, self.topic, partitions, seeks
        );
        Ok(reader)
    }

    fn resolve_assignment(&self, consumer: &mut F::Consumer) -> Result<Vec<TopicPartition>> {
        let assigned = match &self.assignment {
            AssignmentStrategy::Group => consumer.subscribe(self.topic.as_str()),
            AssignmentStrategy::Static(assignor) => {
                let partitions: Vec<TopicPartition> = assignor
                    .partitions(self.worker_id)
                    .into_iter()
                    .map(|p| TopicPartition::new(self.topic.as_str(), p))
                    .collect();
                consumer.assign(partitions.as_slice())
            }
        };
        assigned.map_err(Error::Queue)?;

        let partitions = consumer
            .assignment(self.options.assignment_timeout)
            .map_err(Error::Queue)?;
        if partitions.is_empty() {
            warn!(
                "no partitions assigned to worker {} of topic {} after {:?}",
                self.worker_id, self.topic, self.options.assignment_timeout
            );
        }
        Ok(partitions)
    }

    /// Runs Reader lifecycles until stopped or the restart budget is spent.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "coordinator start. worker: {}, topic: {}, recovery offsets: {}",
            self.worker_id,
            self.topic,
            self.recovery.to_json()
        );

        let mut recovery = self.recovery.clone();
        let mut failures = 0u32;
        while !self.stop.is_stopped() {
            let (batches, result) = self.run_reader(&recovery);
            let e = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            if batches > 0 {
                failures = 0;
            }
            failures += 1;

            if !self.restart_policy.allows(failures) {
                error!(
                    "reader of worker {} topic {} failed, no restarts left. {}",
                    self.worker_id, self.topic, e
                );
                return Err(Error::RestartsExhausted {
                    restarts: failures - 1,
                    last: Box::new(e),
                });
            }

            let backoff = self.restart_policy.backoff(failures);
            warn!(
                "reader of worker {} topic {} failed, restart {} in {:?}. {}",
                self.worker_id, self.topic, failures, backoff, e
            );
            if self.stop.wait_timeout(backoff) {
                break;
            }

            recovery = match self.sink.last_persisted_offsets() {
                Ok(table) => table.for_topic(self.topic.as_str()),
                Err(e) => {
                    warn!("can't refresh recovery offsets, keep the previous ones. {}", e);
                    recovery
                }
            };
        }

        info!("coordinator stopped. worker: {}, topic: {}", self.worker_id, self.topic);
        Ok(())
    }

    fn run_reader(&self, recovery: &RecoveryOffsetTable) -> (u64, Result<()>) {
        let mut reader = match self.create_reader_with(recovery) {
            Ok(reader) => reader,
            Err(e) => return (0, Err(e)),
        };

        let result = reader.run(&self.stop);
        reader.close();
        (reader.stats().batches, result)
    }
}

impl<F> Coordinator<F>
where
    F: ConsumerFactory + 'static,
{
    /// Runs the coordinator on its own named thread.
    pub fn spawn(self) -> Result<CoordinatorHandle> {
        let name = self.name();
        let stop = self.stop_signal();
        let mut coordinator = self;
        let join = thread::spawn(name.as_str(), move || coordinator.run())?;
        Ok(CoordinatorHandle { name, stop, join })
    }
}

pub struct CoordinatorHandle {
    name: String,
    stop: StopSignal,
    join: JoinHandle<Result<()>>,
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<()> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(Error::Panicked(self.name)),
        }
    }
}

/// Moves each assigned partition found in `recovery` to right after its last durable
/// record when the queue's own position is unknown or behind it. Returns the seeks made.
pub fn seek_to_recovery<C: QueueConsumer>(
    consumer: &mut C,
    partitions: &[TopicPartition],
    recovery: &RecoveryOffsetTable,
) -> Result<Vec<(TopicPartition, i64)>> {
    let mut seeks = Vec::new();
    for tp in partitions {
        let resume_offset = match recovery.resume_offset(tp) {
            Some(offset) => offset,
            None => continue,
        };

        let position = consumer.position(tp).map_err(Error::Queue)?;
        match position {
            Some(position) if position >= resume_offset => {
                debug!(
                    "{} position {} already past persisted offset {}",
                    tp,
                    position,
                    resume_offset - 1
                );
            }
            _ => {
                consumer.seek(tp, resume_offset).map_err(Error::Queue)?;
                info!("seek {} from {:?} to {}", tp, position, resume_offset);
                seeks.push((tp.clone(), resume_offset));
            }
        }
    }
    Ok(seeks)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::core::assignment::AssignmentStrategy;
    use crate::core::element::{CommitOffset, TopicPartition};
    use crate::core::queue::QueueConsumer;
    use crate::core::sink::{RecoveryOffsetTable, StorageSink};
    use crate::queue::{MemoryConsumerFactory, MemoryQueue};
    use crate::runtime::coordinator::{
        seek_to_recovery, Coordinator, ReaderOptions, RestartPolicy,
    };
    use crate::runtime::reader::tests::RecordingSink;
    use crate::Error;

    fn options() -> ReaderOptions {
        ReaderOptions {
            poll_timeout: Duration::from_millis(5),
            close_timeout: Duration::from_millis(5),
            assignment_timeout: Duration::from_millis(5),
        }
    }

    fn fast_restarts(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts: Some(max_restarts),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
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

    fn commit(queue: &MemoryQueue, partition: i32, offset: i64) {
        let mut consumer = queue.consumer("g1", 1);
        consumer.subscribe("events").unwrap();
        consumer
            .commit_sync(&[CommitOffset {
                topic_partition: TopicPartition::new("events", partition),
                offset,
            }])
            .unwrap();
    }

    fn wait_until<P: Fn() -> bool>(predicate: P) {
        let begin = Instant::now();
        while !predicate() {
            assert!(begin.elapsed() < Duration::from_secs(10), "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    pub fn recovery_seek_test() {
        let queue = queue_with_records(3, 10);
        // the queue's committed offsets lag (p0) or lead (p1) what is on storage
        commit(&queue, 0, 2);
        commit(&queue, 1, 8);

        let mut recovery = RecoveryOffsetTable::new();
        recovery.update(TopicPartition::new("events", 0), 5);
        recovery.update(TopicPartition::new("events", 1), 3);
        recovery.update(TopicPartition::new("other", 0), 7);

        let sink = Arc::new(RecordingSink::default());
        let coordinator = Coordinator::new(
            0,
            "events",
            MemoryConsumerFactory::new(queue.clone(), "g1", 100),
            sink.clone(),
            recovery,
            AssignmentStrategy::Group,
            options(),
        );

        let mut reader = coordinator.create_reader().unwrap();
        assert_eq!(reader.read().unwrap(), 4 + 2 + 10);

        assert_eq!(sink.offsets(0), (6..10).collect::<Vec<i64>>());
        assert_eq!(sink.offsets(1), vec![8, 9]);
        assert_eq!(sink.offsets(2), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    pub fn seek_never_backward_test() {
        let queue = queue_with_records(1, 10);
        let tp = TopicPartition::new("events", 0);
        let mut consumer = queue.consumer("g1", 100);
        consumer.subscribe("events").unwrap();
        consumer.seek(&tp, 7).unwrap();

        let mut recovery = RecoveryOffsetTable::new();
        recovery.update(tp.clone(), 2);
        let seeks = seek_to_recovery(&mut consumer, &[tp.clone()], &recovery).unwrap();
        assert!(seeks.is_empty());
        assert_eq!(consumer.position(&tp).unwrap(), Some(7));

        recovery.update(tp.clone(), 6);
        let seeks = seek_to_recovery(&mut consumer, &[tp.clone()], &recovery).unwrap();
        assert!(seeks.is_empty());

        recovery.update(tp.clone(), 7);
        let seeks = seek_to_recovery(&mut consumer, &[tp.clone()], &recovery).unwrap();
        assert_eq!(seeks, vec![(tp.clone(), 8)]);
        assert_eq!(consumer.position(&tp).unwrap(), Some(8));
    }

    #[test]
    pub fn static_split_workers_test() {
        let queue = queue_with_records(4, 5);
        let sink = Arc::new(RecordingSink::default());

        let mut handles = Vec::new();
        for worker_id in 0..2 {
            let coordinator = Coordinator::new(
                worker_id,
                "events",
                MemoryConsumerFactory::new(queue.clone(), "g1", 3),
                sink.clone(),
                RecoveryOffsetTable::new(),
                AssignmentStrategy::static_split(4, 2),
                options(),
            );
            handles.push(coordinator.spawn().unwrap());
        }

        wait_until(|| sink.records.lock().unwrap().len() >= 20);
        for handle in &handles {
            handle.stop();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for p in 0..4 {
            assert_eq!(sink.offsets(p), (0..5).collect::<Vec<i64>>());
        }
        assert_eq!(queue.closed_consumers(), 2);
    }

    #[test]
    pub fn restart_after_persist_failure_test() {
        let queue = queue_with_records(2, 6);
        let sink = Arc::new(RecordingSink::default());
        sink.fail_next(1);

        let coordinator = Coordinator::new(
            0,
            "events",
            MemoryConsumerFactory::new(queue.clone(), "g1", 4),
            sink.clone(),
            RecoveryOffsetTable::new(),
            AssignmentStrategy::Group,
            options(),
        )
        .with_restart_policy(fast_restarts(3));
        let handle = coordinator.spawn().unwrap();

        wait_until(|| sink.records.lock().unwrap().len() >= 12);
        handle.stop();
        handle.join().unwrap();

        assert_eq!(sink.offsets(0), (0..6).collect::<Vec<i64>>());
        assert_eq!(sink.offsets(1), (0..6).collect::<Vec<i64>>());
        assert_eq!(queue.closed_consumers(), 2);
        assert_eq!(
            queue.committed("g1", &TopicPartition::new("events", 1)),
            Some(6)
        );
    }

    #[test]
    pub fn restart_budget_exhausted_test() {
        let queue = queue_with_records(1, 3);
        let sink = Arc::new(RecordingSink::default());
        sink.set_fail(true);

        let mut coordinator = Coordinator::new(
            0,
            "events",
            MemoryConsumerFactory::new(queue.clone(), "g1", 10),
            sink.clone(),
            RecoveryOffsetTable::new(),
            AssignmentStrategy::Group,
            options(),
        )
        .with_restart_policy(fast_restarts(2));

        match coordinator.run() {
            Err(Error::RestartsExhausted { restarts, last }) => {
                assert_eq!(restarts, 2);
                assert!(matches!(*last, Error::Persist { .. }));
            }
            other => panic!("expected exhausted restarts, got {:?}", other),
        }
        assert_eq!(queue.closed_consumers(), 3);
        assert!(queue.commit_history("g1").is_empty());
        assert!(sink.last_persisted_offsets().unwrap().is_empty());
    }

    #[test]
    pub fn backoff_test() {
        let policy = RestartPolicy {
            max_restarts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(1));
        assert!(policy.allows(1000));
        assert!(!RestartPolicy::never().allows(1));
    }
}
