use std::convert::TryFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::assignment::AssignmentStrategy;
use crate::core::properties::Properties;
use crate::retention::{OffsetFloor, RetentionPolicy};
use crate::runtime::coordinator::{ReaderOptions, RestartPolicy};
use crate::{Error, Result};

pub const TOPICS: &str = "topics";
pub const STORAGE_PATH: &str = "storage.path";
pub const QUEUE_TYPE: &str = "queue.type";
pub const KAFKA: &str = "kafka";
pub const MEMORY_PARTITIONS: &str = "memory.partitions";
pub const WORKERS: &str = "workers";
pub const ASSIGNMENT: &str = "assignment";
pub const STATIC_PARTITIONS: &str = "static.partitions";
pub const UNIT_MAX_BYTES: &str = "unit.max.bytes";
pub const POLL_TIMEOUT: &str = "poll.timeout.ms";
pub const CLOSE_TIMEOUT: &str = "close.timeout.ms";
pub const ASSIGNMENT_TIMEOUT: &str = "assignment.timeout.ms";
pub const MAX_POLL_RECORDS: &str = "max.poll.records";
pub const RETENTION_MAX_AGE: &str = "retention.max.age.ms";
pub const PRUNE_OFFSET_FLOOR: &str = "prune.offset.floor";
pub const PRUNE_ALL: &str = "prune.all";
pub const PRUNE_INTERVAL: &str = "prune.interval.ms";
pub const RESTART_MAX: &str = "restart.max";
pub const RESTART_BACKOFF: &str = "restart.backoff.ms";
pub const RESTART_BACKOFF_MAX: &str = "restart.backoff.max.ms";
pub const LOG_LEVEL: &str = "log.level";
pub const LOG_FILE: &str = "log.file";
pub const METRICS_ADDRESS: &str = "metrics.address";

pub const DEFAULT_UNIT_MAX_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueType {
    Kafka,
    /// In-process queue, for local runs and tests.
    Memory,
}

/// Validated process configuration. Any missing required setting is reported
/// by name before anything gets started.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub topics: Vec<String>,
    pub storage_path: PathBuf,
    pub queue_type: QueueType,
    /// Opaque queue client settings, everything under `kafka.`.
    pub queue_properties: Properties,
    /// Partitions per topic of the in-process queue.
    pub memory_partitions: usize,
    pub workers: usize,
    pub assignment: AssignmentStrategy,
    pub unit_max_bytes: u64,
    pub max_poll_records: usize,
    pub reader_options: ReaderOptions,
    pub restart_policy: RestartPolicy,
    pub retention: RetentionPolicy,
    pub prune_interval: Duration,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Prometheus exporter listen address, no exporter when unset.
    pub metrics_address: Option<SocketAddr>,
}

fn required(properties: &Properties, key: &str) -> Result<String> {
    match properties.get_string(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(Error::ConfigMissing(key.to_string())),
    }
}

fn optional<T, F>(properties: &Properties, key: &str, get: F) -> Result<Option<T>>
where
    F: Fn(&Properties, &str) -> anyhow::Result<T>,
{
    if properties.contains(key) {
        get(properties, key)
            .map(Some)
            .map_err(|e| Error::invalid(key, e))
    } else {
        Ok(None)
    }
}

impl TryFrom<Properties> for IngestConfig {
    type Error = Error;

    fn try_from(properties: Properties) -> Result<Self> {
        let topics: Vec<String> = required(&properties, TOPICS)?
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(Error::ConfigMissing(TOPICS.to_string()));
        }

        let storage_path = PathBuf::from(required(&properties, STORAGE_PATH)?);

        let queue_type = match properties.get_string(QUEUE_TYPE) {
            Ok(value) => match value.as_str() {
                "kafka" => QueueType::Kafka,
                "memory" => QueueType::Memory,
                _ => return Err(Error::invalid(QUEUE_TYPE, "expected `kafka` or `memory`")),
            },
            Err(_) => QueueType::Kafka,
        };

        let queue_properties = properties.to_sub_properties(KAFKA);
        if queue_type == QueueType::Kafka {
            required(&queue_properties, "bootstrap.servers")
                .map_err(|_| Error::ConfigMissing(format!("{}.bootstrap.servers", KAFKA)))?;
            required(&queue_properties, "group.id")
                .map_err(|_| Error::ConfigMissing(format!("{}.group.id", KAFKA)))?;
        }

        let memory_partitions =
            optional(&properties, MEMORY_PARTITIONS, Properties::get_usize)?.unwrap_or(1);

        let workers = optional(&properties, WORKERS, Properties::get_usize)?.unwrap_or(1);
        if workers == 0 {
            return Err(Error::invalid(WORKERS, "must be at least 1"));
        }

        let assignment = match properties.get_string(ASSIGNMENT) {
            Ok(value) if value.eq("static") => {
                let partitions = optional(&properties, STATIC_PARTITIONS, Properties::get_i32)?
                    .ok_or(Error::ConfigMissing(STATIC_PARTITIONS.to_string()))?;
                AssignmentStrategy::static_split(partitions, workers)
            }
            Ok(value) if !value.eq("group") => {
                return Err(Error::invalid(ASSIGNMENT, "expected `group` or `static`"))
            }
            _ => AssignmentStrategy::Group,
        };

        let unit_max_bytes = optional(&properties, UNIT_MAX_BYTES, Properties::get_u64)?
            .unwrap_or(DEFAULT_UNIT_MAX_BYTES);
        if unit_max_bytes == 0 {
            return Err(Error::invalid(UNIT_MAX_BYTES, "must be positive"));
        }

        let max_poll_records = optional(&properties, MAX_POLL_RECORDS, Properties::get_usize)?
            .unwrap_or(DEFAULT_MAX_POLL_RECORDS);

        let defaults = ReaderOptions::default();
        let reader_options = ReaderOptions {
            poll_timeout: optional(&properties, POLL_TIMEOUT, Properties::get_duration)?
                .unwrap_or(defaults.poll_timeout),
            close_timeout: optional(&properties, CLOSE_TIMEOUT, Properties::get_duration)?
                .unwrap_or(defaults.close_timeout),
            assignment_timeout: optional(&properties, ASSIGNMENT_TIMEOUT, Properties::get_duration)?
                .unwrap_or(defaults.assignment_timeout),
        };

        let defaults = RestartPolicy::default();
        let max_restarts = match properties.get_string(RESTART_MAX) {
            Ok(value) if value.eq("unlimited") => None,
            Ok(_) => optional(&properties, RESTART_MAX, Properties::get_u32)?,
            Err(_) => defaults.max_restarts,
        };
        let restart_policy = RestartPolicy {
            max_restarts,
            initial_backoff: optional(&properties, RESTART_BACKOFF, Properties::get_duration)?
                .unwrap_or(defaults.initial_backoff),
            max_backoff: optional(&properties, RESTART_BACKOFF_MAX, Properties::get_duration)?
                .unwrap_or(defaults.max_backoff),
        };

        let prune_all = optional(&properties, PRUNE_ALL, Properties::get_bool)?.unwrap_or(false);
        let offset_floor = if prune_all {
            OffsetFloor::All
        } else {
            match optional(&properties, PRUNE_OFFSET_FLOOR, Properties::get_i64)? {
                Some(floor) => OffsetFloor::Below(floor),
                None => OffsetFloor::Disabled,
            }
        };
        let retention = RetentionPolicy {
            max_age: optional(&properties, RETENTION_MAX_AGE, Properties::get_duration)?,
            offset_floor,
        };
        let prune_interval = optional(&properties, PRUNE_INTERVAL, Properties::get_duration)?
            .unwrap_or(DEFAULT_PRUNE_INTERVAL);

        let log_level = properties
            .get_string(LOG_LEVEL)
            .unwrap_or("INFO".to_string());
        let log_file = properties.get_string(LOG_FILE).ok().map(PathBuf::from);
        let metrics_address = optional(&properties, METRICS_ADDRESS, |p, key| {
            let value = p.get_string(key)?;
            value
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| anyhow!("`{}` is not a socket address. {}", value, e))
        })?;

        Ok(IngestConfig {
            topics,
            storage_path,
            queue_type,
            queue_properties,
            memory_partitions,
            workers,
            assignment,
            unit_max_bytes,
            max_poll_records,
            reader_options,
            restart_policy,
            retention,
            prune_interval,
            log_level,
            log_file,
            metrics_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::core::assignment::AssignmentStrategy;
    use crate::core::config::{IngestConfig, QueueType};
    use crate::core::properties::Properties;
    use crate::retention::OffsetFloor;
    use crate::Error;

    const VALID: &str = r#"
topics=events, audit
storage.path=/var/lib/sluice
kafka.bootstrap.servers=localhost:9092
kafka.group.id=sluice
kafka.auto.offset.reset=earliest
workers=2
assignment=static
static.partitions=10
unit.max.bytes=3000
poll.timeout.ms=1000
retention.max.age.ms=3600000
prune.offset.floor=100
restart.max=unlimited
metrics.address=127.0.0.1:9108
"#;

    #[test]
    pub fn valid_config_test() {
        let config = IngestConfig::try_from(Properties::parse(VALID).unwrap()).unwrap();
        assert_eq!(config.topics, vec!["events", "audit"]);
        assert_eq!(config.storage_path, PathBuf::from("/var/lib/sluice"));
        assert_eq!(config.queue_type, QueueType::Kafka);
        assert_eq!(config.queue_properties.as_map().len(), 3);
        assert_eq!(config.workers, 2);
        match &config.assignment {
            AssignmentStrategy::Static(assignor) => {
                assert_eq!(assignor.partitions(1), vec![1, 3, 5, 7, 9])
            }
            AssignmentStrategy::Group => panic!("expected a static split"),
        }
        assert_eq!(config.unit_max_bytes, 3000);
        assert_eq!(config.reader_options.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.reader_options.close_timeout, Duration::from_secs(60));
        assert_eq!(config.retention.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.retention.offset_floor, OffsetFloor::Below(100));
        assert_eq!(config.restart_policy.max_restarts, None);
        assert_eq!(config.log_level, "INFO");
        assert_eq!(
            config.metrics_address,
            Some("127.0.0.1:9108".parse().unwrap())
        );
    }

    #[test]
    pub fn metrics_address_test() {
        let base = "topics=events\nstorage.path=/tmp/x\nqueue.type=memory";
        let config = IngestConfig::try_from(Properties::parse(base).unwrap()).unwrap();
        assert_eq!(config.metrics_address, None);

        let properties = Properties::parse(format!("{}\nmetrics.address=nowhere", base).as_str());
        let e = IngestConfig::try_from(properties.unwrap()).unwrap_err();
        assert!(
            e.to_string().starts_with("invalid value for `metrics.address`"),
            "{}",
            e
        );
    }

    #[test]
    pub fn missing_setting_test() {
        let properties = Properties::parse("topics=events\nkafka.group.id=g").unwrap();
        let e = IngestConfig::try_from(properties).unwrap_err();
        assert_eq!(e.to_string(), "storage.path not set");

        let properties =
            Properties::parse("topics=events\nstorage.path=/tmp/x\nkafka.group.id=g").unwrap();
        let e = IngestConfig::try_from(properties).unwrap_err();
        assert_eq!(e.to_string(), "kafka.bootstrap.servers not set");

        let properties = Properties::parse("topics= ,\nstorage.path=/tmp/x").unwrap();
        assert!(matches!(
            IngestConfig::try_from(properties),
            Err(Error::ConfigMissing(key)) if key == "topics"
        ));
    }

    #[test]
    pub fn invalid_setting_test() {
        let properties = Properties::parse(
            "topics=events\nstorage.path=/tmp/x\nqueue.type=memory\nworkers=many",
        )
        .unwrap();
        let e = IngestConfig::try_from(properties).unwrap_err();
        assert!(e.to_string().starts_with("invalid value for `workers`"), "{}", e);
    }

    #[test]
    pub fn prune_all_mode_test() {
        let properties = Properties::parse(
            "topics=events\nstorage.path=/tmp/x\nqueue.type=memory\nprune.offset.floor=5\nprune.all=true",
        )
        .unwrap();
        let config = IngestConfig::try_from(properties).unwrap();
        assert_eq!(config.queue_type, QueueType::Memory);
        assert_eq!(config.retention.offset_floor, OffsetFloor::All);
        assert!(config.retention.is_enabled());
    }
}
