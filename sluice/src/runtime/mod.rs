pub mod coordinator;
pub mod logger;
pub mod reader;
pub mod stop;

pub use coordinator::{Coordinator, CoordinatorHandle, ReaderOptions, RestartPolicy};
pub use reader::{Reader, ReaderStats};
pub use stop::StopSignal;
