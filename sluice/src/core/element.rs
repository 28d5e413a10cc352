use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: &str, partition: i32) -> Self {
        TopicPartition {
            topic: topic.to_string(),
            partition,
        }
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One consumed record together with where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOffset {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
}

impl RecordOffset {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        RecordOffset {
            topic: topic.to_string(),
            partition,
            offset,
            payload,
        }
    }

    pub fn topic(&self) -> &str {
        self.topic.as_str()
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.as_str(), self.partition)
    }
}

/// The "next offset to read" for a partition, as handed to the queue commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitOffset {
    pub topic_partition: TopicPartition,
    pub offset: i64,
}

/// First and last offset of one partition inside a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffsetRange {
    pub topic_partition: TopicPartition,
    pub first: i64,
    pub last: i64,
}

impl Display for OffsetRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}..={}]", self.topic_partition, self.first, self.last)
    }
}

/// Records produced by one poll cycle, in the order the queue delivered them.
/// A batch is never empty.
#[derive(Clone, Debug)]
pub struct RecordBatch {
    records: Vec<RecordOffset>,
}

impl RecordBatch {
    pub fn new(records: Vec<RecordOffset>) -> Option<Self> {
        if records.is_empty() {
            None
        } else {
            Some(RecordBatch { records })
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[RecordOffset] {
        self.records.as_slice()
    }

    pub fn into_records(self) -> Vec<RecordOffset> {
        self.records
    }

    /// Per partition offset ranges, in order of first appearance.
    pub fn offset_ranges(&self) -> Vec<OffsetRange> {
        let mut ranges: Vec<OffsetRange> = Vec::new();
        let mut index: HashMap<TopicPartition, usize> = HashMap::new();
        for record in &self.records {
            let tp = record.topic_partition();
            match index.get(&tp) {
                Some(i) => {
                    let range = &mut ranges[*i];
                    range.first = range.first.min(record.offset);
                    range.last = range.last.max(record.offset);
                }
                None => {
                    index.insert(tp.clone(), ranges.len());
                    ranges.push(OffsetRange {
                        topic_partition: tp,
                        first: record.offset,
                        last: record.offset,
                    });
                }
            }
        }
        ranges
    }

    /// Offsets to commit once this batch is durable: highest offset + 1 per partition.
    pub fn commit_offsets(&self) -> Vec<CommitOffset> {
        let mut offsets: Vec<CommitOffset> = self
            .offset_ranges()
            .into_iter()
            .map(|range| CommitOffset {
                topic_partition: range.topic_partition,
                offset: range.last + 1,
            })
            .collect();
        offsets.sort_by(|a, b| a.topic_partition.cmp(&b.topic_partition));
        offsets
    }

    pub fn describe(&self) -> String {
        let ranges: Vec<String> = self.offset_ranges().iter().map(|r| r.to_string()).collect();
        ranges.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use crate::core::element::{RecordBatch, RecordOffset, TopicPartition};

    fn record(partition: i32, offset: i64) -> RecordOffset {
        RecordOffset::new("events", partition, offset, vec![offset as u8])
    }

    #[test]
    pub fn empty_batch_test() {
        assert!(RecordBatch::new(Vec::new()).is_none());
    }

    #[test]
    pub fn commit_offsets_test() {
        let batch = RecordBatch::new(vec![
            record(1, 4),
            record(0, 10),
            record(1, 5),
            record(0, 11),
            record(1, 6),
        ])
        .unwrap();

        let ranges = batch.offset_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].topic_partition, TopicPartition::new("events", 1));
        assert_eq!((ranges[0].first, ranges[0].last), (4, 6));
        assert_eq!((ranges[1].first, ranges[1].last), (10, 11));

        let commits = batch.commit_offsets();
        assert_eq!(commits[0].topic_partition.partition, 0);
        assert_eq!(commits[0].offset, 12);
        assert_eq!(commits[1].topic_partition.partition, 1);
        assert_eq!(commits[1].offset, 7);

        assert_eq!(batch.describe(), "events-1[4..=6], events-0[10..=11]");
    }
}
