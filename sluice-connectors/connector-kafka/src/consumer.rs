use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use sluice::core::element::{CommitOffset, RecordOffset, TopicPartition};
use sluice::core::queue::QueueConsumer;

use crate::pending::PendingRecords;

const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SEEK_ATTEMPTS: usize = 5;

/// Synchronous Kafka consumer with auto commit off. Offsets only move through
/// `commit_sync`.
pub struct KafkaQueueConsumer {
    consumer: Option<BaseConsumer>,
    max_poll_records: usize,
    request_timeout: Duration,
    /// Set when partitions were assigned by hand instead of by the group.
    manual_assignment: Option<TopicPartitionList>,
    pending: PendingRecords,
}

impl KafkaQueueConsumer {
    pub fn new(consumer: BaseConsumer, max_poll_records: usize, request_timeout: Duration) -> Self {
        KafkaQueueConsumer {
            consumer: Some(consumer),
            max_poll_records: max_poll_records.max(1),
            request_timeout,
            manual_assignment: None,
            pending: PendingRecords::new(),
        }
    }

    fn client(&self) -> anyhow::Result<&BaseConsumer> {
        self.consumer
            .as_ref()
            .ok_or_else(|| anyhow!("kafka consumer already closed"))
    }

    /// Polls at most one message into the pending buffer.
    fn fetch_one(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        let record = match self.client()?.poll(timeout) {
            Some(Ok(message)) => RecordOffset::new(
                message.topic(),
                message.partition(),
                message.offset(),
                message.payload().unwrap_or(&[]).to_vec(),
            ),
            Some(Err(e)) => return Err(anyhow!("kafka poll error. {}", e)),
            None => return Ok(false),
        };
        self.pending.push(record);
        Ok(true)
    }
}

fn raw_offset(offset: Offset) -> Option<i64> {
    match offset {
        Offset::Offset(n) => Some(n),
        _ => None,
    }
}

impl QueueConsumer for KafkaQueueConsumer {
    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.client()?.subscribe(&[topic])?;
        self.manual_assignment = None;
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> anyhow::Result<()> {
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            tpl.add_partition(tp.topic.as_str(), tp.partition);
        }
        self.client()?.assign(&tpl)?;
        self.manual_assignment = Some(tpl);
        Ok(())
    }

    fn assignment(&mut self, timeout: Duration) -> anyhow::Result<Vec<TopicPartition>> {
        let deadline = Instant::now() + timeout;
        loop {
            let tpl = self.client()?.assignment()?;
            if tpl.count() > 0 || Instant::now() >= deadline {
                let partitions = tpl
                    .elements()
                    .iter()
                    .map(|x| TopicPartition::new(x.topic(), x.partition()))
                    .collect();
                return Ok(partitions);
            }

            // the group protocol only makes progress while polling
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(ASSIGNMENT_POLL_INTERVAL);
            self.fetch_one(wait)?;
        }
    }

    fn position(&mut self, topic_partition: &TopicPartition) -> anyhow::Result<Option<i64>> {
        if let Some(offset) = self.pending.next_offset(topic_partition) {
            return Ok(Some(offset));
        }

        let client = self.client()?;
        let topic = topic_partition.topic.as_str();
        let partition = topic_partition.partition;

        let position = client
            .position()?
            .find_partition(topic, partition)
            .and_then(|x| raw_offset(x.offset()));
        if position.is_some() {
            return Ok(position);
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(topic, partition);
        let committed = client
            .committed_offsets(tpl, self.request_timeout)?
            .find_partition(topic, partition)
            .and_then(|x| raw_offset(x.offset()));
        Ok(committed)
    }

    fn seek(&mut self, topic_partition: &TopicPartition, offset: i64) -> anyhow::Result<()> {
        let topic = topic_partition.topic.as_str();
        let partition = topic_partition.partition;

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let result = self.client()?.seek(
                topic,
                partition,
                Offset::Offset(offset),
                self.request_timeout,
            );
            match result {
                Ok(()) => break Ok(()),
                Err(e) if attempt >= SEEK_ATTEMPTS => break Err(e),
                Err(e) => {
                    // a partition can't be seeked before its fetcher started
                    debug!("seek {} to {} not ready, retry. {}", topic_partition, offset, e);
                    self.fetch_one(ASSIGNMENT_POLL_INTERVAL)?;
                }
            }
        };

        if let Err(e) = result {
            let mut tpl = match self.manual_assignment.take() {
                Some(tpl) => tpl,
                None => return Err(anyhow!("seek {} to {} failed. {}", topic_partition, offset, e)),
            };
            tpl.set_partition_offset(topic, partition, Offset::Offset(offset))?;
            let assigned = self.client()?.assign(&tpl);
            self.manual_assignment = Some(tpl);
            assigned?;
        }

        let discarded = self.pending.discard(topic_partition);
        if discarded > 0 {
            debug!("drop {} buffered records of {} after seek", discarded, topic_partition);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Vec<RecordOffset>> {
        if self.pending.is_empty() && self.fetch_one(timeout)? {
            while self.pending.len() < self.max_poll_records {
                if !self.fetch_one(Duration::ZERO)? {
                    break;
                }
            }
        }
        Ok(self.pending.drain(self.max_poll_records))
    }

    fn commit_sync(&mut self, offsets: &[CommitOffset]) -> anyhow::Result<()> {
        let mut tpl = TopicPartitionList::new();
        for commit in offsets {
            tpl.add_partition_offset(
                commit.topic_partition.topic.as_str(),
                commit.topic_partition.partition,
                Offset::Offset(commit.offset),
            )?;
        }
        self.client()?.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn close(&mut self, timeout: Duration) {
        if let Some(consumer) = self.consumer.take() {
            let begin = Instant::now();
            if self.manual_assignment.take().is_some() {
                if let Err(e) = consumer.unassign() {
                    warn!("unassign kafka consumer error. {}", e);
                }
            } else {
                consumer.unsubscribe();
            }
            drop(consumer);

            let elapsed = begin.elapsed();
            if elapsed > timeout {
                warn!("kafka consumer close took {:?}, over {:?}", elapsed, timeout);
            } else {
                info!("kafka consumer closed in {:?}", elapsed);
            }
        }
    }
}
