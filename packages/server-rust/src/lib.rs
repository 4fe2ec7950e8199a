//! B2B inbound router: consumes trade documents from a queue and starts the
//! durable workflow each one routes to, with hot reload and graceful
//! shutdown.

pub mod catalog;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod drain;
pub mod lifecycle;
pub mod runtime;
pub mod transport;

pub use catalog::{Activity, ActivityCatalog, CatalogFactory};
pub use config::{ConfigSource, FileConfigSource, RouterConfig, StaticConfigSource};
pub use consumer::{ConsumerReport, ConsumerSettings, ConsumptionLoop};
pub use dispatch::{
    default_registry, DispatchError, DispatchTable, OrchestratorRegistry, SchedulingRequirement,
};
pub use drain::DrainOutcome;
pub use lifecycle::{
    DefaultComponents, LifecycleError, LifecycleManager, LifecycleState, LifecycleStatus,
    RouterComponents, ShutdownReport,
};
pub use runtime::{InMemoryBackend, PersistenceBackend};
pub use transport::{InMemoryTransport, Transport};
