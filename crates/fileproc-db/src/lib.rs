//! fileproc database layer
//!
//! The file record store behind the [`FileStore`] trait, with a PostgreSQL
//! repository for production and an in-memory store for tests and local runs.

pub mod error;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::{InMemoryFileStore, DEFAULT_MAX_CONFLICT_RETRIES};
pub use pool::{setup_database, MIGRATOR};
pub use postgres::FileRepository;
pub use store::FileStore;
