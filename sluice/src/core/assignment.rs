use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Maps a worker identity to the partitions it owns.
pub trait PartitionAssignor: Send + Sync {
    fn partitions(&self, worker_id: usize) -> Vec<i32>;
}

impl<F> PartitionAssignor for F
where
    F: Fn(usize) -> Vec<i32> + Send + Sync,
{
    fn partitions(&self, worker_id: usize) -> Vec<i32> {
        self(worker_id)
    }
}

/// Round-robin split of `partition_count` partitions over `worker_count` workers.
/// Partition `p` belongs to worker `p % worker_count`, so the sets never overlap.
#[derive(Clone, Debug)]
pub struct StaticSplit {
    partition_count: i32,
    worker_count: usize,
}

impl StaticSplit {
    pub fn new(partition_count: i32, worker_count: usize) -> Self {
        StaticSplit {
            partition_count,
            worker_count: worker_count.max(1),
        }
    }
}

impl PartitionAssignor for StaticSplit {
    fn partitions(&self, worker_id: usize) -> Vec<i32> {
        (0..self.partition_count)
            .filter(|p| (*p as usize) % self.worker_count == worker_id % self.worker_count)
            .collect()
    }
}

#[derive(Clone)]
pub enum AssignmentStrategy {
    /// Subscribe and let the consumer group decide.
    Group,
    /// Fixed partition sets, chosen by worker identity.
    Static(Arc<dyn PartitionAssignor>),
}

impl AssignmentStrategy {
    pub fn static_split(partition_count: i32, worker_count: usize) -> Self {
        AssignmentStrategy::Static(Arc::new(StaticSplit::new(partition_count, worker_count)))
    }
}

impl Debug for AssignmentStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentStrategy::Group => f.write_str("Group"),
            AssignmentStrategy::Static(_) => f.write_str("Static"),
        }
    }
}
