use std::convert::TryFrom;
use std::time::Duration;

use rdkafka::consumer::BaseConsumer;
use rdkafka::ClientConfig;
use sluice::core::properties::Properties;
use sluice::core::queue::ConsumerFactory;
use sluice::Error;

use crate::consumer::KafkaQueueConsumer;
use crate::{
    AUTO_OFFSET_RESET, BOOTSTRAP_SERVERS, CLIENT_ID, DEFAULT_MAX_POLL_RECORDS, ENABLE_AUTO_COMMIT,
    GROUP_ID,
};

pub const MAX_POLL_RECORDS: &str = "max.poll.records";
pub const REQUEST_TIMEOUT: &str = "request.timeout.ms";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds one Kafka consumer per Reader lifecycle. Every key is passed to the client
/// untouched, except that auto commit is always turned off.
#[derive(Clone, Debug)]
pub struct KafkaConsumerFactory {
    client_config: ClientConfig,
    group_id: String,
    max_poll_records: usize,
    request_timeout: Duration,
}

impl KafkaConsumerFactory {
    pub fn new(client_config: ClientConfig, max_poll_records: usize) -> anyhow::Result<Self> {
        for key in [BOOTSTRAP_SERVERS, GROUP_ID] {
            client_config
                .get(key)
                .ok_or(anyhow!("`{}` not found in kafka consumer config", key))?;
        }

        let mut client_config = client_config;
        client_config.set(ENABLE_AUTO_COMMIT, "false");
        if client_config.get(AUTO_OFFSET_RESET).is_none() {
            client_config.set(AUTO_OFFSET_RESET, "earliest");
        }
        let group_id = client_config.get(GROUP_ID).unwrap_or_default().to_string();

        Ok(KafkaConsumerFactory {
            client_config,
            group_id,
            max_poll_records,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }
}

impl TryFrom<Properties> for KafkaConsumerFactory {
    type Error = Error;

    /// Reads the `kafka.` sub properties.
    fn try_from(properties: Properties) -> Result<Self, Self::Error> {
        let mut client_config = ClientConfig::new();
        for (key, val) in properties.as_map() {
            if key.eq(MAX_POLL_RECORDS) {
                continue;
            }
            client_config.set(key.as_str(), val.as_str());
        }

        for key in [BOOTSTRAP_SERVERS, GROUP_ID] {
            if client_config.get(key).is_none() {
                return Err(Error::ConfigMissing(format!("kafka.{}", key)));
            }
        }

        let max_poll_records = if properties.contains(MAX_POLL_RECORDS) {
            properties
                .get_usize(MAX_POLL_RECORDS)
                .map_err(|e| Error::invalid(format!("kafka.{}", MAX_POLL_RECORDS), e))?
        } else {
            DEFAULT_MAX_POLL_RECORDS
        };

        let mut factory =
            KafkaConsumerFactory::new(client_config, max_poll_records).map_err(Error::Queue)?;
        if properties.contains(REQUEST_TIMEOUT) {
            let timeout = properties
                .get_duration(REQUEST_TIMEOUT)
                .map_err(|e| Error::invalid(format!("kafka.{}", REQUEST_TIMEOUT), e))?;
            factory = factory.request_timeout(timeout);
        }
        Ok(factory)
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    type Consumer = KafkaQueueConsumer;

    fn create(&self, worker_id: usize) -> anyhow::Result<Self::Consumer> {
        let mut client_config = self.client_config.clone();
        if client_config.get(CLIENT_ID).is_none() {
            client_config.set(CLIENT_ID, format!("sluice-{}-{}", self.group_id, worker_id));
        }

        let consumer: BaseConsumer = client_config.create()?;
        info!("create kafka consumer. config: {:?}", client_config);

        Ok(KafkaQueueConsumer::new(
            consumer,
            self.max_poll_records,
            self.request_timeout,
        ))
    }
}
