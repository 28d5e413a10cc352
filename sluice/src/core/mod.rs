pub mod assignment;
pub mod config;
pub mod element;
pub mod error;
pub mod properties;
pub mod queue;
pub mod sink;
