//! Service lifecycle: startup ordering, hot reload and graceful shutdown.
//!
//! `Created → Starting → Running ⇄ ReloadingConfig`, then
//! `ShuttingDown → Stopped`. The consumption loop reads the active
//! [`SchedulingRequirement`] through an `ArcSwap`; a reload builds a
//! complete replacement, swaps it in with a single store and shuts the old
//! one down in the background. Transport and consumer settings are fixed
//! at startup.

pub mod health;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{ActivityCatalog, CatalogError, CatalogFactory};
use crate::config::{BackendKind, ConfigError, ConfigSource, RouterConfig, TransportKind};
use crate::consumer::{ConsumerReport, ConsumerSettings, ConsumptionLoop};
use crate::dispatch::{
    default_registry, ActiveRequirement, BindError, DocumentRouter, OrchestratorRegistry,
    RegistryError, SchedulingRequirement,
};
use crate::drain::DrainOutcome;
use crate::runtime::{BackendError, InMemoryBackend, PersistenceBackend, WorkerError, WorkerOptions};
use crate::transport::{InMemoryTransport, TlsMaterial, Transport, TransportError};

pub use health::{health_router, serve_health};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle states of the router service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    ReloadingConfig,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ReloadingConfig => "reloading_config",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Deliveries are consumed and dispatched in these states.
    #[must_use]
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Running | Self::ReloadingConfig)
    }
}

/// Lifecycle failures. Only startup failures are fatal; reload failures are
/// logged and returned to the caller for information.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("cannot {operation} while {}", .state.as_str())]
    InvalidTransition {
        state: LifecycleState,
        operation: &'static str,
    },
    #[error("delivery stream ended while the service was running")]
    StreamEnded,
}

/// Shared, read-only view of the lifecycle for health reporting.
#[derive(Clone)]
pub struct LifecycleStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    state: ArcSwap<LifecycleState>,
    generation: AtomicU64,
    active: RwLock<Option<ActiveRequirement>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    started_at: Instant,
}

impl LifecycleStatus {
    fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                state: ArcSwap::from_pointee(LifecycleState::Created),
                generation: AtomicU64::new(0),
                active: RwLock::new(None),
                transport: RwLock::new(None),
                started_at: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.inner.state.load()
    }

    /// Generation of the active scheduling requirement (0 before startup).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Dispatches running against the active requirement.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner
            .active
            .read()
            .as_ref()
            .map_or(0, |active| active.load().in_flight())
    }

    #[must_use]
    pub fn transport_connected(&self) -> bool {
        self.inner
            .transport
            .read()
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    /// Serving with a live transport connection.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_serving() && self.transport_connected()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = *self.inner.state.swap(Arc::new(state));
        if previous != state {
            info!(from = previous.as_str(), to = state.as_str(), "lifecycle transition");
        }
    }
}

impl std::fmt::Debug for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleStatus")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Collaborators the lifecycle builds the service from.
#[async_trait]
pub trait RouterComponents: Send + Sync {
    /// Opens the transport connection, including TLS setup.
    async fn connect_transport(&self, config: &RouterConfig) -> Result<Arc<dyn Transport>, TransportError>;

    /// Builds a fresh activity catalog.
    fn build_catalog(&self, config: &RouterConfig) -> Result<ActivityCatalog, CatalogError>;

    /// Builds the orchestrator registry; called again on every reload.
    fn build_registry(&self, config: &RouterConfig) -> Result<OrchestratorRegistry, RegistryError>;

    /// Provides the persistence backend for a new requirement.
    async fn provide_backend(&self, config: &RouterConfig) -> Result<Arc<dyn PersistenceBackend>, BackendError>;
}

/// Production components: catalog factory, default workflows, and the
/// transport and backend selected by configuration.
///
/// The in-memory transport and backend are created once and shared by every
/// requirement, so instances survive reloads on the memory backend too.
#[derive(Clone, Default)]
pub struct DefaultComponents {
    memory_transport: InMemoryTransport,
    memory_backend: InMemoryBackend,
}

impl DefaultComponents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport used when `transport = "memory"`.
    #[must_use]
    pub fn memory_transport(&self) -> &InMemoryTransport {
        &self.memory_transport
    }

    /// The backend used when `backend.kind = "memory"`.
    #[must_use]
    pub fn memory_backend(&self) -> &InMemoryBackend {
        &self.memory_backend
    }
}

#[async_trait]
impl RouterComponents for DefaultComponents {
    async fn connect_transport(&self, config: &RouterConfig) -> Result<Arc<dyn Transport>, TransportError> {
        let tls = TlsMaterial::from_settings(&config.tls)?;
        match config.transport {
            #[cfg(feature = "amqp")]
            TransportKind::Amqp => {
                let transport = crate::transport::AmqpTransport::connect(&config.amqp, tls.as_ref()).await?;
                Ok(Arc::new(transport))
            }
            #[cfg(not(feature = "amqp"))]
            TransportKind::Amqp => Err(TransportError::Connection(
                "built without the `amqp` feature".to_string(),
            )),
            TransportKind::Memory => {
                if tls.is_some() {
                    warn!("TLS settings are ignored by the in-memory transport");
                }
                Ok(Arc::new(self.memory_transport.clone()))
            }
        }
    }

    fn build_catalog(&self, config: &RouterConfig) -> Result<ActivityCatalog, CatalogError> {
        CatalogFactory::create(&config.activities)
    }

    fn build_registry(&self, config: &RouterConfig) -> Result<OrchestratorRegistry, RegistryError> {
        default_registry(config.orchestrator_name.as_str())
    }

    async fn provide_backend(&self, config: &RouterConfig) -> Result<Arc<dyn PersistenceBackend>, BackendError> {
        match config.backend.kind {
            BackendKind::Memory => Ok(Arc::new(self.memory_backend.clone())),
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => Ok(Arc::new(crate::runtime::PostgresBackend::connect_lazy(
                &config.backend,
            )?)),
            #[cfg(not(feature = "postgres"))]
            BackendKind::Postgres => Err(BackendError::Internal(
                "built without the `postgres` feature".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

/// What shutdown observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Totals of the consumption loop, if it was started.
    pub consumer: Option<ConsumerReport>,
    /// Drain result of the active requirement.
    pub drain: Option<DrainOutcome>,
    /// Superseded requirements still draining when shutdown gave up on them.
    pub abandoned_requirements: usize,
}

/// Owns the transport, the active requirement and the consumption loop.
pub struct LifecycleManager {
    source: Arc<dyn ConfigSource>,
    components: Arc<dyn RouterComponents>,
    status: LifecycleStatus,
    config: Option<Arc<RouterConfig>>,
    transport: Option<Arc<dyn Transport>>,
    active: Option<ActiveRequirement>,
    consumer: Option<JoinHandle<ConsumerReport>>,
    consumer_cancel: CancellationToken,
    consumer_exited: CancellationToken,
    retired: JoinSet<DrainOutcome>,
    root: CancellationToken,
    next_generation: u64,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(source: Arc<dyn ConfigSource>, components: Arc<dyn RouterComponents>) -> Self {
        Self {
            source,
            components,
            status: LifecycleStatus::new(),
            config: None,
            transport: None,
            active: None,
            consumer: None,
            consumer_cancel: CancellationToken::new(),
            consumer_exited: CancellationToken::new(),
            retired: JoinSet::new(),
            root: CancellationToken::new(),
            next_generation: 1,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.status.state()
    }

    /// Handle for health reporting; stays valid after the manager is moved.
    #[must_use]
    pub fn status(&self) -> LifecycleStatus {
        self.status.clone()
    }

    /// The configuration snapshot currently applied.
    #[must_use]
    pub fn config(&self) -> Option<&Arc<RouterConfig>> {
        self.config.as_ref()
    }

    /// The swap cell read by the consumption loop.
    #[must_use]
    pub fn active_requirement(&self) -> Option<&ActiveRequirement> {
        self.active.as_ref()
    }

    /// Builds everything and starts consuming.
    ///
    /// Nothing is consumed unless every step succeeded; on failure the
    /// pieces already built are released and the state becomes `Stopped`.
    ///
    /// # Errors
    ///
    /// Any configuration, TLS, transport, catalog, registry or binding
    /// failure. `LifecycleError::InvalidTransition` unless `Created`.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.start_from(None).await
    }

    /// Like [`start`](Self::start), but from a snapshot the caller already
    /// loaded, so startup and the caller agree on one configuration. Later
    /// reloads read the source again.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start); the snapshot is validated first.
    pub async fn start_with(&mut self, config: RouterConfig) -> Result<(), LifecycleError> {
        self.start_from(Some(config)).await
    }

    async fn start_from(&mut self, snapshot: Option<RouterConfig>) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != LifecycleState::Created {
            return Err(LifecycleError::InvalidTransition {
                state,
                operation: "start",
            });
        }
        self.status.set_state(LifecycleState::Starting);

        match self.try_start(snapshot).await {
            Ok(()) => {
                self.status.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "startup failed");
                self.abort_startup().await;
                self.status.set_state(LifecycleState::Stopped);
                Err(e)
            }
        }
    }

    async fn try_start(&mut self, snapshot: Option<RouterConfig>) -> Result<(), LifecycleError> {
        let config = match snapshot {
            Some(config) => {
                config.validate()?;
                config
            }
            None => self.source.load()?,
        };
        let config = Arc::new(config);
        info!(
            service = %config.service_name,
            transport = ?config.transport,
            backend = ?config.backend.kind,
            queue = %config.amqp.queue_name,
            "starting router"
        );

        let transport = self.components.connect_transport(&config).await?;
        self.transport = Some(Arc::clone(&transport));
        *self.status.inner.transport.write() = Some(Arc::clone(&transport));

        let requirement = self.build_requirement(&config, true).await?;
        requirement.start()?;
        let generation = requirement.generation();
        let active: ActiveRequirement = Arc::new(ArcSwap::from_pointee(requirement));
        self.active = Some(Arc::clone(&active));
        *self.status.inner.active.write() = Some(Arc::clone(&active));
        self.status.inner.generation.store(generation, Ordering::Release);

        let settings = ConsumerSettings::from_config(&config);
        let stream = transport.consume(&settings.queue).await?;
        let consumer = ConsumptionLoop::new(active, settings, self.consumer_cancel.clone());
        let exited = self.consumer_exited.clone();
        self.consumer = Some(tokio::spawn(async move {
            let report = consumer.run(stream).await;
            exited.cancel();
            report
        }));

        self.config = Some(config);
        info!(generation, "router running");
        Ok(())
    }

    async fn abort_startup(&mut self) {
        if let Some(active) = self.active.take() {
            active.load_full().shutdown(Duration::ZERO).await;
        }
        self.root.cancel();
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(error = %e, "transport close after failed startup failed");
            }
        }
        *self.status.inner.active.write() = None;
        *self.status.inner.transport.write() = None;
    }

    async fn build_requirement(
        &mut self,
        config: &RouterConfig,
        first: bool,
    ) -> Result<SchedulingRequirement, LifecycleError> {
        let catalog = self.components.build_catalog(config)?;
        let table = self.components.build_registry(config)?.build(&catalog)?;
        let router = DocumentRouter::new(
            config.routing.discriminator_map(),
            config.dispatch.unknown_document_policy,
            config.routing.fields.clone(),
        );
        let backend = self.components.provide_backend(config).await?;
        let options = WorkerOptions {
            max_concurrent_instances: config.dispatch.max_in_flight,
            max_attempts: config.activities.max_attempts,
            initial_backoff: Duration::from_millis(config.activities.initial_backoff_ms),
            resume_pending: first,
        };

        let generation = self.next_generation;
        let requirement = SchedulingRequirement::bind(
            generation,
            table,
            catalog,
            router,
            backend,
            options,
            self.root.child_token(),
        )
        .await?;
        self.next_generation += 1;
        Ok(requirement)
    }

    /// Re-reads configuration and swaps in a new requirement.
    ///
    /// Returns the new generation. On failure the previous requirement stays
    /// active and the service keeps running.
    ///
    /// # Errors
    ///
    /// The rebuild failure, or `InvalidTransition` unless `Running`.
    pub async fn reload(&mut self) -> Result<u64, LifecycleError> {
        let state = self.state();
        let Some(active) = self.active.clone().filter(|_| state == LifecycleState::Running) else {
            return Err(LifecycleError::InvalidTransition {
                state,
                operation: "reload",
            });
        };
        self.status.set_state(LifecycleState::ReloadingConfig);
        while let Some(joined) = self.retired.try_join_next() {
            log_retired(joined);
        }

        let result = self.try_reload(&active).await;
        self.status.set_state(LifecycleState::Running);
        match result {
            Ok(generation) => {
                metrics::counter!("b2b_router_reloads_total", "outcome" => "applied").increment(1);
                Ok(generation)
            }
            Err(e) => {
                metrics::counter!("b2b_router_reloads_total", "outcome" => "failed").increment(1);
                error!(
                    error = %e,
                    generation = active.load().generation(),
                    "reload failed, keeping the active configuration"
                );
                Err(e)
            }
        }
    }

    async fn try_reload(&mut self, active: &ActiveRequirement) -> Result<u64, LifecycleError> {
        let config = Arc::new(self.source.load()?);
        if let Some(current) = &self.config {
            warn_on_fixed_settings(current, &config);
        }

        let requirement = self.build_requirement(&config, false).await?;
        if let Err(e) = requirement.start() {
            requirement.shutdown(Duration::ZERO).await;
            return Err(e.into());
        }
        let generation = requirement.generation();

        let old = active.swap(Arc::new(requirement));
        self.status.inner.generation.store(generation, Ordering::Release);
        let drain_timeout = config.dispatch.drain_timeout();
        self.retired.spawn(async move { old.shutdown(drain_timeout).await });

        info!(generation, "configuration reloaded");
        self.config = Some(config);
        Ok(generation)
    }

    /// Stops consuming, drains and releases everything.
    ///
    /// Order: consumption loop (settles what it pulled), active requirement,
    /// superseded requirements, transport. Idempotent once `Stopped`.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        match self.state() {
            LifecycleState::Stopped => return ShutdownReport::default(),
            LifecycleState::Created => {
                self.status.set_state(LifecycleState::Stopped);
                return ShutdownReport::default();
            }
            _ => {}
        }
        self.status.set_state(LifecycleState::ShuttingDown);
        let drain_timeout = self
            .config
            .as_ref()
            .map_or_else(|| RouterConfig::default().dispatch.drain_timeout(), |c| c.dispatch.drain_timeout());

        self.consumer_cancel.cancel();
        let consumer = match self.consumer.take() {
            Some(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(error = %e, "consumption loop task failed");
                    None
                }
            },
            None => None,
        };

        let drain = match &self.active {
            Some(active) => Some(active.load_full().shutdown(drain_timeout).await),
            None => None,
        };

        let abandoned_requirements = self.join_retired(drain_timeout).await;
        self.root.cancel();

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(error = %e, "transport close failed");
            }
        }

        self.status.set_state(LifecycleState::Stopped);
        let report = ShutdownReport {
            consumer,
            drain,
            abandoned_requirements,
        };
        info!(?report, "router stopped");
        report
    }

    async fn join_retired(&mut self, timeout: Duration) -> usize {
        let retired = &mut self.retired;
        let joined = tokio::time::timeout(timeout, async {
            while let Some(joined) = retired.join_next().await {
                log_retired(joined);
            }
        })
        .await;
        if joined.is_ok() {
            return 0;
        }
        let remaining = self.retired.len();
        warn!(
            event = "DrainTimeout",
            remaining,
            "superseded requirements still draining, abandoning"
        );
        self.retired.abort_all();
        remaining
    }

    /// Starts if needed, then serves reload requests until `shutdown`
    /// resolves, and shuts down.
    ///
    /// Reload and shutdown run on this one task, so they never overlap. A
    /// closed reload channel only disables reloads.
    ///
    /// # Errors
    ///
    /// A startup failure, or `LifecycleError::StreamEnded` if the transport
    /// stopped delivering while running (after shutting down cleanly).
    pub async fn run<F>(mut self, mut reload_rx: mpsc::Receiver<()>, shutdown: F) -> Result<ShutdownReport, LifecycleError>
    where
        F: Future<Output = ()> + Send,
    {
        if self.state() == LifecycleState::Created {
            self.start().await?;
        }

        tokio::pin!(shutdown);
        let mut reloads_open = true;
        let stream_ended = loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break false;
                }
                () = self.consumer_exited.cancelled() => {
                    error!("delivery stream ended unexpectedly, shutting down");
                    break true;
                }
                request = reload_rx.recv(), if reloads_open => match request {
                    Some(()) => {
                        info!("reload requested");
                        // Failures are logged by reload; the service keeps running.
                        let _ = self.reload().await;
                    }
                    None => reloads_open = false,
                },
            }
        };

        let report = self.shutdown().await;
        if stream_ended {
            return Err(LifecycleError::StreamEnded);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("status", &self.status)
            .field("next_generation", &self.next_generation)
            .finish_non_exhaustive()
    }
}

fn log_retired(joined: Result<DrainOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => info!(drained = outcome.is_drained(), "superseded requirement shut down"),
        Err(e) => error!(error = %e, "superseded requirement shutdown task failed"),
    }
}

/// Transport and consumer settings are applied at startup only.
fn warn_on_fixed_settings(current: &RouterConfig, next: &RouterConfig) {
    let changed: Vec<&str> = [
        ("transport", current.transport != next.transport),
        ("amqp", current.amqp != next.amqp),
        ("tls", current.tls != next.tls),
        ("backend", current.backend != next.backend),
        ("dispatch.max_in_flight", current.dispatch.max_in_flight != next.dispatch.max_in_flight),
        ("dispatch.dispatch_timeout_ms", current.dispatch.dispatch_timeout_ms != next.dispatch.dispatch_timeout_ms),
        ("dispatch.max_redeliveries", current.dispatch.max_redeliveries != next.dispatch.max_redeliveries),
    ]
    .into_iter()
    .filter_map(|(name, differs)| differs.then_some(name))
    .collect();
    if !changed.is_empty() {
        warn!(
            sections = ?changed,
            "reload does not apply these settings; restart to change them"
        );
    }
}

#[cfg(test)]
mod tests {
    use b2b_router_core::{DeliveryHeaders, UnknownDocumentPolicy};

    use super::*;
    use crate::config::StaticConfigSource;
    use crate::transport::SettlementOutcome;

    fn memory_config() -> RouterConfig {
        let mut config = RouterConfig::default();
        config.transport = TransportKind::Memory;
        config.activities.initial_backoff_ms = 1;
        config.dispatch.drain_timeout_ms = 2_000;
        config
    }

    fn manager(config: RouterConfig) -> (LifecycleManager, StaticConfigSource, DefaultComponents) {
        let source = StaticConfigSource::new(config);
        let components = DefaultComponents::new();
        let manager = LifecycleManager::new(Arc::new(source.clone()), Arc::new(components.clone()));
        (manager, source, components)
    }

    fn headers(discriminator: &str, key: &str) -> DeliveryHeaders {
        [("x-document-type", discriminator), ("x-correlation-id", key)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn start_reaches_running_with_first_generation() {
        let (mut manager, _, _) = manager(memory_config());
        assert_eq!(manager.state(), LifecycleState::Created);

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        assert_eq!(manager.status().generation(), 1);
        assert!(manager.status().is_ready());

        manager.shutdown().await;
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(!manager.status().is_ready());
    }

    #[tokio::test]
    async fn invalid_config_fails_startup_and_stops() {
        let mut config = memory_config();
        config.orchestrator_name = String::new();
        let (mut manager, _, components) = manager(config);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(components.memory_transport().is_connected());
    }

    #[tokio::test]
    async fn binding_failure_closes_the_transport() {
        let mut config = memory_config();
        config
            .routing
            .discriminators
            .insert("ZZ".to_string(), "no-such-workflow".to_string());
        let (mut manager, _, components) = manager(config);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Bind(BindError::UnregisteredTarget(_))));
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(!components.memory_transport().is_connected());
    }

    #[tokio::test]
    async fn start_with_uses_the_given_snapshot() {
        let (mut manager, _, _) = manager(memory_config());
        let mut snapshot = memory_config();
        snapshot.service_name = "from-caller".to_string();

        manager.start_with(snapshot).await.unwrap();
        assert_eq!(manager.config().unwrap().service_name, "from-caller");
        assert_eq!(manager.state(), LifecycleState::Running);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn start_with_validates_the_snapshot() {
        let (mut manager, _, _) = manager(memory_config());
        let mut snapshot = memory_config();
        snapshot.orchestrator_name = String::new();

        let err = manager.start_with(snapshot).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
        assert_eq!(manager.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn start_twice_is_an_invalid_transition() {
        let (mut manager, _, _) = manager(memory_config());
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(LifecycleError::InvalidTransition { operation: "start", .. })
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reload_swaps_generation() {
        let (mut manager, source, _) = manager(memory_config());
        manager.start().await.unwrap();

        let mut next = memory_config();
        next.dispatch.unknown_document_policy = UnknownDocumentPolicy::Reject;
        source.set(next);
        assert_eq!(manager.reload().await.unwrap(), 2);
        assert_eq!(manager.state(), LifecycleState::Running);

        let active = manager.active_requirement().unwrap().load();
        assert_eq!(active.generation(), 2);
        assert_eq!(active.router().policy(), UnknownDocumentPolicy::Reject);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_requirement() {
        let (mut manager, source, _) = manager(memory_config());
        manager.start().await.unwrap();

        let mut broken = memory_config();
        broken.activities.max_attempts = 0;
        source.set(broken);
        assert!(manager.reload().await.is_err());
        assert_eq!(manager.state(), LifecycleState::Running);
        assert_eq!(manager.status().generation(), 1);
        assert!(!manager.active_requirement().unwrap().load().is_shutting_down());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reload_before_start_is_refused() {
        let (mut manager, _, _) = manager(memory_config());
        assert!(matches!(
            manager.reload().await,
            Err(LifecycleError::InvalidTransition { operation: "reload", .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_settles_pulled_deliveries_before_closing() {
        let (mut manager, _, components) = manager(memory_config());
        let transport = components.memory_transport().clone();
        manager.start().await.unwrap();

        let id = transport.publish("b2b-inbound", headers("SN", "K-1"), &br#"{"n":1}"#[..]);
        assert!(transport.wait_for_settlements(1, Duration::from_secs(2)).await);

        let report = manager.shutdown().await;
        assert_eq!(transport.settlements_for(id)[0].outcome, SettlementOutcome::Acked);
        assert_eq!(report.consumer.unwrap().acked, 1);
        assert_eq!(report.drain, Some(DrainOutcome::Drained));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (mut manager, _, _) = manager(memory_config());
        manager.start().await.unwrap();
        manager.shutdown().await;
        assert_eq!(manager.shutdown().await, ShutdownReport::default());
    }

    #[tokio::test]
    async fn run_serves_reloads_until_shutdown() {
        let (manager, source, _) = manager(memory_config());
        let status = manager.status();
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(manager.run(reload_rx, async {
            let _ = stop_rx.await;
        }));

        source.set(memory_config());
        reload_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while status.generation() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(()).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.drain, Some(DrainOutcome::Drained));
        assert_eq!(status.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn run_reports_a_lost_transport() {
        let (manager, _, components) = manager(memory_config());
        let status = manager.status();
        let (_reload_tx, reload_rx) = mpsc::channel(1);
        let transport = components.memory_transport().clone();

        let handle = tokio::spawn(manager.run(reload_rx, std::future::pending()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while status.state() != LifecycleState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        transport.close().await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::StreamEnded)));
    }

    #[tokio::test]
    async fn shutdown_abandons_superseded_requirements_past_drain_timeout() {
        let mut config = memory_config();
        config.dispatch.drain_timeout_ms = 50;
        let (mut manager, _, components) = manager(config);
        manager.start().await.unwrap();
        manager.retired.spawn(std::future::pending::<DrainOutcome>());

        let report = tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .unwrap();
        assert_eq!(report.abandoned_requirements, 1);
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(!components.memory_transport().is_connected());
    }

    #[test]
    fn state_labels() {
        assert_eq!(LifecycleState::ReloadingConfig.as_str(), "reloading_config");
        assert!(LifecycleState::ReloadingConfig.is_serving());
        assert!(!LifecycleState::ShuttingDown.is_serving());
    }
}
