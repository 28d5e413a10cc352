//! In-process queue with consumer-group offsets. Stands in for a broker in controlled
//! scenarios: tests, local runs, and static partition splits between workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::element::{CommitOffset, RecordOffset, TopicPartition};
use crate::core::queue::{ConsumerFactory, QueueConsumer};

const POLL_STEP: Duration = Duration::from_millis(2);

#[derive(Default)]
struct QueueState {
    topics: HashMap<String, Vec<Vec<Vec<u8>>>>,
    committed: HashMap<(String, TopicPartition), i64>,
    commit_history: Vec<(String, CommitOffset)>,
    failing_commits: u32,
    failing_polls: u32,
    closed_consumers: usize,
}

impl QueueState {
    fn partition_len(&self, tp: &TopicPartition) -> Option<i64> {
        self.topics
            .get(tp.topic.as_str())
            .and_then(|partitions| partitions.get(tp.partition as usize))
            .map(|records| records.len() as i64)
    }
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }

    fn state(&self) -> MutexGuard<QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state()
            .topics
            .insert(topic.to_string(), vec![Vec::new(); partitions]);
    }

    /// Appends a record and returns its offset.
    pub fn produce(&self, topic: &str, partition: i32, payload: Vec<u8>) -> anyhow::Result<i64> {
        let mut state = self.state();
        let records = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .ok_or(anyhow!("unknown partition {}-{}", topic, partition))?;
        records.push(payload);
        Ok(records.len() as i64 - 1)
    }

    pub fn committed(&self, group: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic_partition.clone()))
            .map(|x| *x)
    }

    pub fn commit_history(&self, group: &str) -> Vec<CommitOffset> {
        self.state()
            .commit_history
            .iter()
            .filter(|(g, _)| g.eq(group))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// The next `n` commits are rejected.
    pub fn fail_next_commits(&self, n: u32) {
        self.state().failing_commits = n;
    }

    /// The next `n` polls report a connection error.
    pub fn fail_next_polls(&self, n: u32) {
        self.state().failing_polls = n;
    }

    pub fn closed_consumers(&self) -> usize {
        self.state().closed_consumers
    }

    pub fn consumer(&self, group: &str, max_poll_records: usize) -> MemoryConsumer {
        MemoryConsumer {
            queue: self.clone(),
            group: group.to_string(),
            assignment: Vec::new(),
            positions: HashMap::new(),
            max_poll_records: max_poll_records.max(1),
            closed: false,
        }
    }
}

pub struct MemoryConsumer {
    queue: MemoryQueue,
    group: String,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    max_poll_records: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn check_assigned(&self, topic_partition: &TopicPartition) -> anyhow::Result<()> {
        if self.assignment.contains(topic_partition) {
            Ok(())
        } else {
            Err(anyhow!("partition {} is not assigned", topic_partition))
        }
    }

    fn current_position(&self, state: &QueueState, topic_partition: &TopicPartition) -> i64 {
        match self.positions.get(topic_partition) {
            Some(position) => *position,
            None => state
                .committed
                .get(&(self.group.clone(), topic_partition.clone()))
                .map(|x| *x)
                .unwrap_or(0),
        }
    }

    fn fetch(&mut self) -> anyhow::Result<Vec<RecordOffset>> {
        let queue = self.queue.clone();
        let mut state = queue.state();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(anyhow!("connection reset while fetching"));
        }

        let mut records = Vec::new();
        for tp in self.assignment.clone() {
            let position = self.current_position(&state, &tp);
            let partition = &state.topics[tp.topic.as_str()][tp.partition as usize];

            let mut next = position;
            while (next as usize) < partition.len() && records.len() < self.max_poll_records {
                let payload = partition[next as usize].clone();
                records.push(RecordOffset::new(tp.topic.as_str(), tp.partition, next, payload));
                next += 1;
            }
            self.positions.insert(tp, next);

            if records.len() >= self.max_poll_records {
                break;
            }
        }
        Ok(records)
    }
}

impl QueueConsumer for MemoryConsumer {
    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        let partitions = self
            .queue
            .state()
            .topics
            .get(topic)
            .map(|partitions| partitions.len())
            .ok_or(anyhow!("unknown topic {}", topic))?;
        self.assignment = (0..partitions as i32)
            .map(|p| TopicPartition::new(topic, p))
            .collect();
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> anyhow::Result<()> {
        {
            let state = self.queue.state();
            for tp in partitions {
                state
                    .partition_len(tp)
                    .ok_or(anyhow!("unknown partition {}", tp))?;
            }
        }
        self.assignment = partitions.to_vec();
        self.positions.clear();
        Ok(())
    }

    fn assignment(&mut self, _timeout: Duration) -> anyhow::Result<Vec<TopicPartition>> {
        Ok(self.assignment.clone())
    }

    fn position(&mut self, topic_partition: &TopicPartition) -> anyhow::Result<Option<i64>> {
        self.check_assigned(topic_partition)?;
        let queue = self.queue.clone();
        let state = queue.state();
        Ok(Some(self.current_position(&state, topic_partition)))
    }

    fn seek(&mut self, topic_partition: &TopicPartition, offset: i64) -> anyhow::Result<()> {
        self.check_assigned(topic_partition)?;
        self.positions.insert(topic_partition.clone(), offset);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Vec<RecordOffset>> {
        let deadline = Instant::now() + timeout;
        loop {
            let records = self.fetch()?;
            let now = Instant::now();
            if !records.is_empty() || now >= deadline {
                return Ok(records);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    fn commit_sync(&mut self, offsets: &[CommitOffset]) -> anyhow::Result<()> {
        let mut state = self.queue.state();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(anyhow!("commit rejected, group {} is rebalancing", self.group));
        }

        for commit in offsets {
            state.committed.insert(
                (self.group.clone(), commit.topic_partition.clone()),
                commit.offset,
            );
            state
                .commit_history
                .push((self.group.clone(), commit.clone()));
        }
        Ok(())
    }

    fn close(&mut self, _timeout: Duration) {
        if !self.closed {
            self.closed = true;
            self.queue.state().closed_consumers += 1;
        }
    }
}

#[derive(Clone)]
pub struct MemoryConsumerFactory {
    queue: MemoryQueue,
    group: String,
    max_poll_records: usize,
}

impl MemoryConsumerFactory {
    pub fn new(queue: MemoryQueue, group: &str, max_poll_records: usize) -> Self {
        MemoryConsumerFactory {
            queue,
            group: group.to_string(),
            max_poll_records,
        }
    }
}

impl ConsumerFactory for MemoryConsumerFactory {
    type Consumer = MemoryConsumer;

    fn create(&self, _worker_id: usize) -> anyhow::Result<MemoryConsumer> {
        Ok(self.queue.consumer(self.group.as_str(), self.max_poll_records))
    }
}
