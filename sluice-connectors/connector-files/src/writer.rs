use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use metrics::counter;
use sluice::core::element::{RecordBatch, RecordOffset, TopicPartition};
use sluice::core::sink::{RecoveryOffsetTable, StorageSink};
use sluice::metrics::UNITS_SEALED;

use crate::unit::{decode_frames, encode_frame, UnitName};

/// Open unit of one partition plus the offsets already written for it.
struct PartitionWriter {
    topic_partition: TopicPartition,
    dir: PathBuf,
    file: Option<File>,
    /// Bytes in the in-progress unit.
    written: u64,
    /// Highest offset in the in-progress unit, `None` while it holds nothing.
    unit_highest: Option<i64>,
    /// Highest offset written, synced or not. Records at or below it are skipped.
    high_water: Option<i64>,
    /// Highest offset known to be on disk.
    durable: Option<i64>,
    /// fsync calls made on the in-progress unit.
    syncs: u64,
}

impl PartitionWriter {
    /// Picks up where the previous process left off: the highest closed unit, and the
    /// in-progress unit with any torn tail cut off.
    fn recover(root: &Path, topic_partition: TopicPartition) -> anyhow::Result<Self> {
        let dir = root.join(topic_partition.topic.as_str());
        std::fs::create_dir_all(dir.as_path())?;

        let mut closed_highest = None;
        for entry in std::fs::read_dir(dir.as_path())? {
            let file_name = entry?.file_name();
            if let Some(UnitName::Closed {
                partition,
                highest_offset,
            }) = file_name.to_str().and_then(UnitName::parse)
            {
                if partition == topic_partition.partition {
                    closed_highest = closed_highest.max(Some(highest_offset));
                }
            }
        }

        let mut writer = PartitionWriter {
            topic_partition,
            dir,
            file: None,
            written: 0,
            unit_highest: None,
            high_water: closed_highest,
            durable: closed_highest,
            syncs: 0,
        };

        let path = writer.in_progress_path();
        if path.exists() {
            let mut data = Vec::new();
            File::open(path.as_path())?.read_to_end(&mut data)?;
            let total = data.len();
            let scan = decode_frames(Bytes::from(data));

            // frames left by a crashed process may still sit in the page cache only
            let file = OpenOptions::new().write(true).open(path.as_path())?;
            if scan.valid_len < total {
                warn!(
                    "truncate torn tail of {:?}, {} of {} bytes kept",
                    path, scan.valid_len, total
                );
                file.set_len(scan.valid_len as u64)?;
            }
            file.sync_all()?;
            writer.syncs += 1;

            writer.written = scan.valid_len as u64;
            writer.unit_highest = scan.highest_offset();
            writer.high_water = writer.high_water.max(writer.unit_highest);
            writer.durable = writer.high_water;
        }

        Ok(writer)
    }

    fn in_progress_path(&self) -> PathBuf {
        let name = UnitName::InProgress {
            partition: self.topic_partition.partition,
        };
        self.dir.join(name.file_name())
    }

    fn open_file(&mut self) -> anyhow::Result<&mut File> {
        if self.file.is_none() {
            let path = self.in_progress_path();
            let created = !path.exists();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_path())?;
            if created {
                // the new directory entry has to survive a crash too
                File::open(self.dir.as_path())?.sync_all()?;
            }
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow!("in-progress unit of {} not open", self.topic_partition))
    }

    /// Returns false when the record was already written before.
    fn append(
        &mut self,
        buffer: &mut BytesMut,
        offset: i64,
        payload: &[u8],
        max_unit_bytes: u64,
    ) -> anyhow::Result<bool> {
        if self.high_water.map(|x| offset <= x).unwrap_or(false) {
            return Ok(false);
        }

        buffer.clear();
        encode_frame(buffer, offset, payload);
        self.open_file()?.write_all(buffer.as_ref())?;

        self.written += buffer.len() as u64;
        self.unit_highest = Some(offset);
        self.high_water = Some(offset);

        if self.written >= max_unit_bytes {
            self.seal()?;
        }
        Ok(true)
    }

    /// Appends the records of this partition in order, then syncs once if anything new
    /// was written.
    fn write(&mut self, records: &[&RecordOffset], max_unit_bytes: u64) -> anyhow::Result<()> {
        let mut buffer = BytesMut::new();
        let mut appended = false;
        for record in records {
            let offset = record.offset();
            let fresh = self
                .append(&mut buffer, offset, record.payload(), max_unit_bytes)
                .map_err(|e| e.context(format!("write {} offset {}", self.topic_partition, offset)))?;
            if fresh {
                appended = true;
            } else {
                debug!("skip {} offset {}, already persisted", self.topic_partition, offset);
            }
        }

        if appended {
            self.sync()
                .map_err(|e| e.context(format!("sync {}", self.topic_partition)))?;
        }
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_data()?;
            self.syncs += 1;
        }
        self.durable = self.high_water;
        Ok(())
    }

    /// Closes the in-progress unit under its final name. A unit is never written again
    /// once it carries its highest offset in the name.
    fn seal(&mut self) -> anyhow::Result<()> {
        let highest_offset = match self.unit_highest {
            Some(offset) => offset,
            None => return Ok(()),
        };

        if let Some(file) = self.file.take() {
            file.sync_all()?;
            self.syncs += 1;
        }

        let from = self.in_progress_path();
        let name = UnitName::Closed {
            partition: self.topic_partition.partition,
            highest_offset,
        };
        let to = self.dir.join(name.file_name());
        std::fs::rename(from.as_path(), to.as_path())?;
        File::open(self.dir.as_path())?.sync_all()?;

        debug!(
            "sealed unit {:?}, {} bytes, {} syncs",
            to, self.written, self.syncs
        );
        counter!(UNITS_SEALED, 1);

        self.written = 0;
        self.unit_highest = None;
        self.syncs = 0;
        self.durable = self.high_water;
        Ok(())
    }
}

type SharedWriter = Arc<Mutex<PartitionWriter>>;

/// A `StorageSink` writing each partition into a chain of write-once files under
/// `<root>/<topic>/`. Partitions are locked one by one, so readers of different
/// partitions never wait on each other.
pub struct FileStorageSink {
    root: PathBuf,
    max_unit_bytes: u64,
    writers: DashMap<TopicPartition, SharedWriter>,
}

impl FileStorageSink {
    /// Opens the store, recovering every partition already present under `root`.
    pub fn open<P: AsRef<Path>>(root: P, max_unit_bytes: u64) -> anyhow::Result<Self> {
        if max_unit_bytes == 0 {
            return Err(anyhow!("unit size threshold must be positive"));
        }

        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.as_path())?;

        let writers = DashMap::new();
        for topic_partition in scan_partitions(root.as_path())? {
            let writer = PartitionWriter::recover(root.as_path(), topic_partition.clone())?;
            writers.insert(topic_partition, Arc::new(Mutex::new(writer)));
        }
        info!("open file store {:?}, {} partitions", root, writers.len());

        Ok(FileStorageSink {
            root,
            max_unit_bytes,
            writers,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn writer(&self, topic_partition: &TopicPartition) -> anyhow::Result<SharedWriter> {
        let entry = self
            .writers
            .entry(topic_partition.clone())
            .or_try_insert_with(|| {
                PartitionWriter::recover(self.root.as_path(), topic_partition.clone())
                    .map(|x| Arc::new(Mutex::new(x)))
            })?;
        Ok(entry.value().clone())
    }

    /// Snapshot of the writers, so no map shard stays locked while a writer is.
    fn all_writers(&self) -> Vec<(TopicPartition, SharedWriter)> {
        self.writers
            .iter()
            .map(|x| (x.key().clone(), x.value().clone()))
            .collect()
    }

    fn persist_partition(
        &self,
        topic_partition: &TopicPartition,
        records: &[&RecordOffset],
    ) -> anyhow::Result<()> {
        let writer = self.writer(topic_partition)?;
        let result = match writer.lock() {
            Ok(mut writer) => writer.write(records, self.max_unit_bytes),
            Err(_) => Err(anyhow!("writer of {} poisoned", topic_partition)),
        };

        if result.is_err() {
            // rebuilt from disk on the next attempt
            self.writers.remove(topic_partition);
        }
        result
    }
}

impl StorageSink for FileStorageSink {
    fn persist(&self, batch: RecordBatch) -> anyhow::Result<()> {
        let mut partitions: BTreeMap<TopicPartition, Vec<&RecordOffset>> = BTreeMap::new();
        for record in batch.records() {
            partitions
                .entry(record.topic_partition())
                .or_default()
                .push(record);
        }

        for (topic_partition, records) in partitions {
            self.persist_partition(&topic_partition, records.as_slice())?;
        }
        Ok(())
    }

    fn last_persisted_offsets(&self) -> anyhow::Result<RecoveryOffsetTable> {
        let mut table = RecoveryOffsetTable::new();
        for (topic_partition, writer) in self.all_writers() {
            let durable = writer
                .lock()
                .map_err(|_| anyhow!("writer of {} poisoned", topic_partition))?
                .durable;
            if let Some(offset) = durable {
                table.update(topic_partition, offset);
            }
        }
        Ok(table)
    }

    /// Seals every open unit. Persisting afterwards starts new units.
    fn close(&self) -> anyhow::Result<()> {
        let mut failure = None;
        for (topic_partition, writer) in self.all_writers() {
            let sealed = match writer.lock() {
                Ok(mut writer) => writer.seal(),
                Err(_) => Err(anyhow!("writer of {} poisoned", topic_partition)),
            };
            if let Err(e) = sealed {
                error!("seal unit of {} failed. {}", topic_partition, e);
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Every `<topic>/<partition>` that has at least one unit under `root`.
fn scan_partitions(root: &Path) -> anyhow::Result<BTreeSet<TopicPartition>> {
    let mut partitions = BTreeSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let topic = match entry.file_name().to_str() {
            Some(topic) => topic.to_string(),
            None => continue,
        };

        for unit in std::fs::read_dir(entry.path())? {
            let unit = unit?;
            if let Some(name) = unit.file_name().to_str().and_then(UnitName::parse) {
                partitions.insert(TopicPartition::new(topic.as_str(), name.partition()));
            }
        }
    }
    Ok(partitions)
}
