pub mod core_types;
pub mod snapshot;

pub mod config;
pub mod error;

pub mod backoff;
pub mod shutdown;
pub mod telemetry;

pub mod registry;
pub mod selector;

pub mod executor;
pub mod transport;

pub mod diagnostics;
pub mod probe;

pub mod deploy;
pub mod watch;

pub mod utils;

pub use error::{CoreError, Result};
