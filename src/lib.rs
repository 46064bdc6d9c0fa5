pub mod apply;
pub mod config;
pub mod conflict;
pub mod error;
pub mod memory;
pub mod replayer;
pub mod stream;

pub use apply::HeapApplier;
pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use replayer::{ReplayStats, Replayer};
