//! SQLite backend for the subscription registry.
//!
//! The repositories in [`repo`] are synchronous and run against any
//! [`Queryable`]: a bare `rusqlite` connection or a transaction the caller
//! opened. [`SqliteRegistry`] wraps [`tokio_rusqlite`] so async callers get a
//! connection thread, transaction handling and a statement deadline.

mod encode;

pub mod error;
pub mod queryable;
pub mod registry;
pub mod repo;
pub mod schema;

pub use error::{Error, Result};
pub use queryable::{Queryable, Record};
pub use registry::{RegistryConfig, SqliteRegistry, SweepReport};
pub use repo::{
  CellArrayRepo, CellTableRepo, DynSubscriptionRepo, RepoContext, open_repo,
};
pub use schema::SchemaVersion;
