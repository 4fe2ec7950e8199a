//! Durable task runtime: persistence backends plus the worker that executes
//! workflow instances.

pub mod backend;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod worker;

pub use backend::{BackendError, InstanceRecord, InstanceStatus, PersistenceBackend};
pub use memory::InMemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
pub use worker::{TaskHub, TaskHubWorker, WorkerError, WorkerOptions};
