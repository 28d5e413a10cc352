#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod store;
pub mod unit;
pub mod writer;

pub use store::LocalUnitStore;
pub use writer::FileStorageSink;
