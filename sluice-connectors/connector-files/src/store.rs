use std::path::{Path, PathBuf};

use sluice::core::element::TopicPartition;
use sluice::retention::{DurableUnit, UnitStore};

use crate::unit::UnitName;

/// Lists the closed units written by a `FileStorageSink` under the same root.
/// In-progress units are invisible here.
pub struct LocalUnitStore {
    root: PathBuf,
}

impl LocalUnitStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalUnitStore {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl UnitStore for LocalUnitStore {
    fn list_units(&self) -> anyhow::Result<Vec<DurableUnit>> {
        let mut units = Vec::new();
        if !self.root.exists() {
            return Ok(units);
        }

        for topic_dir in std::fs::read_dir(self.root.as_path())? {
            let topic_dir = topic_dir?;
            if !topic_dir.file_type()?.is_dir() {
                continue;
            }
            let topic = match topic_dir.file_name().to_str() {
                Some(topic) => topic.to_string(),
                None => continue,
            };

            for entry in std::fs::read_dir(topic_dir.path())? {
                let entry = entry?;
                let name = entry.file_name().to_str().and_then(UnitName::parse);
                if let Some(UnitName::Closed {
                    partition,
                    highest_offset,
                }) = name
                {
                    units.push(DurableUnit {
                        topic_partition: TopicPartition::new(topic.as_str(), partition),
                        highest_offset,
                        modified: entry.metadata()?.modified()?,
                        location: entry.path().to_string_lossy().to_string(),
                    });
                }
            }
        }

        Ok(units)
    }

    fn remove_unit(&self, unit: &DurableUnit) -> anyhow::Result<()> {
        std::fs::remove_file(unit.location.as_str())
            .map_err(|e| anyhow!("remove unit {} failed. {}", unit.location, e))
    }
}
