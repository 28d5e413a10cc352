use std::collections::VecDeque;

use sluice::core::element::{RecordOffset, TopicPartition};

/// Records fetched while waiting for an assignment or a seek to settle. They are handed
/// out before anything new is polled.
#[derive(Debug, Default)]
pub struct PendingRecords {
    records: VecDeque<RecordOffset>,
}

impl PendingRecords {
    pub fn new() -> Self {
        PendingRecords::default()
    }

    pub fn push(&mut self, record: RecordOffset) {
        self.records.push_back(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn drain(&mut self, max: usize) -> Vec<RecordOffset> {
        let n = max.min(self.records.len());
        self.records.drain(..n).collect()
    }

    /// Offset of the next record `poll` would return for the partition.
    pub fn next_offset(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.records
            .iter()
            .filter(|x| x.partition() == topic_partition.partition)
            .filter(|x| x.topic() == topic_partition.topic)
            .map(|x| x.offset())
            .min()
    }

    /// Forgets everything buffered for the partition, the fetch restarts from the seek target.
    pub fn discard(&mut self, topic_partition: &TopicPartition) -> usize {
        let before = self.records.len();
        self.records.retain(|x| {
            x.partition() != topic_partition.partition || x.topic() != topic_partition.topic
        });
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use sluice::core::element::{RecordOffset, TopicPartition};

    use crate::pending::PendingRecords;

    #[test]
    pub fn pending_records_test() {
        let mut pending = PendingRecords::new();
        for offset in 3..6 {
            pending.push(RecordOffset::new("t", 0, offset, vec![]));
            pending.push(RecordOffset::new("t", 1, offset * 10, vec![]));
        }

        let p0 = TopicPartition::new("t", 0);
        let p1 = TopicPartition::new("t", 1);
        assert_eq!(pending.next_offset(&p0), Some(3));
        assert_eq!(pending.next_offset(&TopicPartition::new("u", 0)), None);

        assert_eq!(pending.discard(&p1), 3);
        assert_eq!(pending.next_offset(&p1), None);

        let records = pending.drain(2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].offset(), 4);
        assert_eq!(pending.next_offset(&p0), Some(5));
        assert_eq!(pending.len(), 1);
    }
}
