//! fileproc core library
//!
//! Domain models, error types and configuration shared by every fileproc crate.

pub mod config;
pub mod error;
pub mod models;
pub mod task_error;

pub use config::{DispatcherConfig, LogFormat, TaskQueueConfig, WorkerConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use task_error::TaskError;
