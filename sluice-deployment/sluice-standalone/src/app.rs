use std::convert::TryFrom;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::anyhow;

use sluice::core::config::{IngestConfig, QueueType};
use sluice::core::queue::ConsumerFactory;
use sluice::core::sink::{RecoveryOffsetTable, StorageSink};
use sluice::queue::{MemoryConsumerFactory, MemoryQueue};
use sluice::retention::Pruner;
use sluice::runtime::{Coordinator, CoordinatorHandle, StopSignal};
use sluice_connector_files::{FileStorageSink, LocalUnitStore};
use sluice_connector_kafka::builder::MAX_POLL_RECORDS;
use sluice_connector_kafka::KafkaConsumerFactory;

const MEMORY_GROUP: &str = "sluice";

/// Everything one process runs: a coordinator per topic and worker over a shared file
/// store, plus the retention pruner when a policy is configured.
pub struct App {
    sink: Arc<FileStorageSink>,
    coordinators: Vec<CoordinatorHandle>,
    pruner: Option<(StopSignal, JoinHandle<()>)>,
    memory_queue: Option<MemoryQueue>,
}

impl App {
    pub fn start(config: IngestConfig) -> anyhow::Result<Self> {
        let sink = Arc::new(FileStorageSink::open(
            config.storage_path.as_path(),
            config.unit_max_bytes,
        )?);
        let recovery = sink.last_persisted_offsets()?;
        info!("recovery offsets: {}", recovery.to_json());

        let mut memory_queue = None;
        let coordinators = match config.queue_type {
            QueueType::Kafka => {
                let mut properties = config.queue_properties.clone();
                if !properties.contains(MAX_POLL_RECORDS) {
                    properties.set_usize(MAX_POLL_RECORDS, config.max_poll_records);
                }
                let factory = KafkaConsumerFactory::try_from(properties)?;
                spawn_coordinators(&config, factory, sink.clone(), &recovery)?
            }
            QueueType::Memory => {
                let queue = MemoryQueue::new();
                for topic in &config.topics {
                    queue.create_topic(topic.as_str(), config.memory_partitions);
                }
                let factory =
                    MemoryConsumerFactory::new(queue.clone(), MEMORY_GROUP, config.max_poll_records);
                memory_queue = Some(queue);
                spawn_coordinators(&config, factory, sink.clone(), &recovery)?
            }
        };

        let pruner = if config.retention.is_enabled() {
            let stop = StopSignal::new();
            let pruner = Pruner::new(
                LocalUnitStore::new(config.storage_path.as_path()),
                config.retention.clone(),
            );
            let join = pruner.spawn(config.prune_interval, stop.clone())?;
            Some((stop, join))
        } else {
            info!("retention disabled");
            None
        };

        Ok(App {
            sink,
            coordinators,
            pruner,
            memory_queue,
        })
    }

    /// The in-process queue when running with `queue.type=memory`.
    pub fn memory_queue(&self) -> Option<&MemoryQueue> {
        self.memory_queue.as_ref()
    }

    pub fn sink(&self) -> &FileStorageSink {
        self.sink.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.coordinators.iter().all(|x| x.is_finished())
    }

    /// Stops every coordinator and the pruner, then seals the open units. Returns the
    /// first failure after everything has been shut down.
    pub fn shutdown(self) -> anyhow::Result<()> {
        for coordinator in &self.coordinators {
            coordinator.stop();
        }

        let mut failure: Option<anyhow::Error> = None;
        for coordinator in self.coordinators {
            let name = coordinator.name().to_string();
            match coordinator.join() {
                Ok(()) => info!("{} joined", name),
                Err(e) => {
                    error!("{} failed. {}", name, e);
                    failure.get_or_insert(e.into());
                }
            }
        }

        if let Some((stop, join)) = self.pruner {
            stop.stop();
            if join.join().is_err() {
                failure.get_or_insert(anyhow!("retention pruner panicked"));
            }
        }

        if let Err(e) = self.sink.close() {
            error!("close storage failed. {}", e);
            failure.get_or_insert(e);
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!("shutdown complete");
                Ok(())
            }
        }
    }
}

fn spawn_coordinators<F>(
    config: &IngestConfig,
    factory: F,
    sink: Arc<FileStorageSink>,
    recovery: &RecoveryOffsetTable,
) -> anyhow::Result<Vec<CoordinatorHandle>>
where
    F: ConsumerFactory + Clone + 'static,
{
    let mut handles = Vec::new();
    for topic in &config.topics {
        for worker_id in 0..config.workers {
            let coordinator = Coordinator::new(
                worker_id,
                topic.as_str(),
                factory.clone(),
                sink.clone(),
                recovery.clone(),
                config.assignment.clone(),
                config.reader_options.clone(),
            )
            .with_restart_policy(config.restart_policy.clone());

            let handle = coordinator.spawn()?;
            info!("{} started", handle.name());
            handles.push(handle);
        }
    }
    Ok(handles)
}
