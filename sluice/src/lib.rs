#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod core;
pub mod metrics;
pub mod queue;
pub mod retention;
pub mod runtime;
pub mod utils;

pub use crate::core::error::{Error, Result};
