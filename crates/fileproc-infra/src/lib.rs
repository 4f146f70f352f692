//! fileproc infrastructure library
//!
//! Process-level plumbing shared by fileproc binaries:
//! - Telemetry initialization (tracing subscriber)
//! - Shutdown signal handling

pub mod shutdown;
pub mod telemetry;

pub use shutdown::{cancel_on_shutdown, shutdown_signal};
pub use telemetry::{init_telemetry, DEFAULT_LOG_FILTER};
