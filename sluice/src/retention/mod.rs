//! Retention over closed durable units. Units still open for writing are never listed by a
//! `UnitStore`, which is what keeps pruning away from in-flight persists.

use std::collections::BTreeMap;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use metrics::counter;

use crate::core::element::TopicPartition;
use crate::metrics::UNITS_PRUNED;
use crate::runtime::stop::StopSignal;
use crate::utils::date_time::system_time_str;
use crate::utils::thread;
use crate::{Error, Result};

/// A closed, immutable unit of persisted records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DurableUnit {
    pub topic_partition: TopicPartition,
    /// Highest offset stored in the unit.
    pub highest_offset: i64,
    pub modified: SystemTime,
    /// Store specific handle, e.g. a file path.
    pub location: String,
}

pub trait UnitStore: Send + Sync {
    /// Every closed unit currently in the store.
    fn list_units(&self) -> anyhow::Result<Vec<DurableUnit>>;

    fn remove_unit(&self, unit: &DurableUnit) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetFloor {
    Disabled,
    /// Units whose highest offset is below the floor are removed.
    Below(i64),
    /// Remove every closed unit regardless of age or offset.
    All,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneReason {
    Expired,
    BelowFloor,
    PruneAll,
}

#[derive(Clone, Debug)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub offset_floor: OffsetFloor,
}

impl RetentionPolicy {
    pub fn disabled() -> Self {
        RetentionPolicy {
            max_age: None,
            offset_floor: OffsetFloor::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.offset_floor != OffsetFloor::Disabled
    }

    pub fn prune_reason(&self, unit: &DurableUnit, now: SystemTime) -> Option<PruneReason> {
        match self.offset_floor {
            OffsetFloor::All => return Some(PruneReason::PruneAll),
            OffsetFloor::Below(floor) if unit.highest_offset < floor => {
                return Some(PruneReason::BelowFloor)
            }
            _ => {}
        }

        if let Some(max_age) = self.max_age {
            let expired = match now.checked_sub(max_age) {
                Some(deadline) => unit.modified < deadline,
                None => false,
            };
            if expired {
                return Some(PruneReason::Expired);
            }
        }

        None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionPrune {
    pub removed: usize,
    pub kept: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PruneReport {
    pub partitions: BTreeMap<TopicPartition, PartitionPrune>,
    pub failed: usize,
}

impl PruneReport {
    pub fn removed(&self) -> usize {
        self.partitions.values().map(|x| x.removed).sum()
    }

    pub fn kept(&self) -> usize {
        self.partitions.values().map(|x| x.kept).sum()
    }
}

pub struct Pruner<S: UnitStore> {
    store: S,
    policy: RetentionPolicy,
}

impl<S: UnitStore> Pruner<S> {
    pub fn new(store: S, policy: RetentionPolicy) -> Self {
        Pruner { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// One pass over the store. A unit that fails to delete is counted and kept for the
    /// next pass, it does not abort the others.
    pub fn prune_once(&self, now: SystemTime) -> Result<PruneReport> {
        let units = self.store.list_units().map_err(Error::Storage)?;

        let mut report = PruneReport::default();
        for unit in units {
            let entry = report
                .partitions
                .entry(unit.topic_partition.clone())
                .or_default();

            let reason = match self.policy.prune_reason(&unit, now) {
                Some(reason) => reason,
                None => {
                    entry.kept += 1;
                    continue;
                }
            };

            match self.store.remove_unit(&unit) {
                Ok(()) => {
                    entry.removed += 1;
                    info!(
                        "pruned {} ({:?}), highest offset: {}, modified: {}",
                        unit.location,
                        reason,
                        unit.highest_offset,
                        system_time_str(unit.modified)
                    );
                }
                Err(e) => {
                    entry.kept += 1;
                    report.failed += 1;
                    warn!("can't prune {}. {}", unit.location, e);
                }
            }
        }

        counter!(UNITS_PRUNED, report.removed() as u64);
        Ok(report)
    }
}

impl<S> Pruner<S>
where
    S: UnitStore + 'static,
{
    /// Prunes every `interval` on a dedicated thread until `stop` is signalled.
    pub fn spawn(self, interval: Duration, stop: StopSignal) -> Result<JoinHandle<()>> {
        let join = thread::spawn("retention-pruner", move || {
            info!("pruner start. policy: {:?}, interval: {:?}", self.policy, interval);
            loop {
                match self.prune_once(SystemTime::now()) {
                    Ok(report) => debug!(
                        "prune pass done. removed: {}, kept: {}, failed: {}",
                        report.removed(),
                        report.kept(),
                        report.failed
                    ),
                    Err(e) => error!("prune pass failed. {}", e),
                }

                if stop.wait_timeout(interval) {
                    break;
                }
            }
            info!("pruner stopped");
        })?;
        Ok(join)
    }
}
