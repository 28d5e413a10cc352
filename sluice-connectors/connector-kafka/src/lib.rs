#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod builder;
pub mod consumer;
pub mod pending;

pub use builder::KafkaConsumerFactory;
pub use consumer::KafkaQueueConsumer;

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const GROUP_ID: &str = "group.id";
pub const CLIENT_ID: &str = "client.id";
pub const ENABLE_AUTO_COMMIT: &str = "enable.auto.commit";
pub const AUTO_OFFSET_RESET: &str = "auto.offset.reset";

pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
