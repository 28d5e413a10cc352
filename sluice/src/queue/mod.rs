pub mod memory;

pub use memory::{MemoryConsumer, MemoryConsumerFactory, MemoryQueue};
