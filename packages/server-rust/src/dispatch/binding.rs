//! Scheduling binding: the executable unit behind message dispatch.
//!
//! A [`SchedulingRequirement`] binds one [`DispatchTable`], the
//! [`ActivityCatalog`] it was built from, a [`DocumentRouter`], and a
//! [`TaskHubWorker`] on a persistence backend. The lifecycle manager keeps
//! exactly one requirement active and swaps in a freshly bound one on reload.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use b2b_router_core::{
    CorrelationKey, DeliveryHeaders, DiscriminatorMap, InboundMessage, InstanceId, MessageError,
    MessageFields, Resolution, UnknownDocumentPolicy, WorkflowName,
};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::DispatchTable;
use crate::catalog::ActivityCatalog;
use crate::drain::{DrainController, DrainOutcome};
use crate::runtime::{BackendError, PersistenceBackend, TaskHub, TaskHubWorker, WorkerError, WorkerOptions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Per-delivery dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no workflow registered as {0}")]
    UnknownWorkflow(WorkflowName),
    #[error("scheduling requirement is shutting down")]
    ShuttingDown,
    #[error("persistence backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("payload could not be parsed: {0}")]
    PayloadParse(String),
    #[error("message has no correlation key")]
    MissingCorrelationKey,
    #[error("internal dispatch error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Redelivering the same message can never succeed.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::UnknownWorkflow(_) | Self::PayloadParse(_) | Self::MissingCorrelationKey
        )
    }

    /// Redelivering the same message later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown | Self::BackendUnavailable(_) | Self::Timeout { .. }
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownWorkflow(_) => "unknown_workflow",
            Self::ShuttingDown => "shutting_down",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::PayloadParse(_) => "payload_parse",
            Self::MissingCorrelationKey => "missing_correlation_key",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<MessageError> for DispatchError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::PayloadParse(reason) => Self::PayloadParse(reason),
            MessageError::MissingCorrelationKey => Self::MissingCorrelationKey,
        }
    }
}

/// Failure binding a new requirement. Fatal at startup, abandons a reload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("discriminator mapping targets unregistered workflow {0}")]
    UnregisteredTarget(WorkflowName),
    #[error("backend initialization failed: {0}")]
    Backend(#[from] BackendError),
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub instance_id: InstanceId,
    pub workflow: WorkflowName,
    /// The correlation key was already used; no new instance was created.
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// DocumentRouter
// ---------------------------------------------------------------------------

/// Resolves a message's discriminator to a workflow name.
#[derive(Debug, Clone, Default)]
pub struct DocumentRouter {
    map: DiscriminatorMap,
    policy: UnknownDocumentPolicy,
    fields: MessageFields,
}

impl DocumentRouter {
    #[must_use]
    pub fn new(map: DiscriminatorMap, policy: UnknownDocumentPolicy, fields: MessageFields) -> Self {
        Self { map, policy, fields }
    }

    #[must_use]
    pub fn fields(&self) -> &MessageFields {
        &self.fields
    }

    #[must_use]
    pub fn policy(&self) -> UnknownDocumentPolicy {
        self.policy
    }

    /// Chooses the workflow for `discriminator`.
    ///
    /// Order: explicit mapping, then a discriminator that already names a
    /// registered workflow, then the unknown-document policy. An absent or
    /// blank discriminator always selects the primary.
    #[must_use]
    pub fn route(&self, discriminator: Option<&str>, table: &DispatchTable) -> WorkflowName {
        match self.map.resolve(discriminator) {
            Resolution::Mapped(workflow) => workflow,
            Resolution::Absent => table.primary().clone(),
            Resolution::Unmapped(raw) if table.contains(&raw) => WorkflowName::new(raw),
            Resolution::Unmapped(raw) => match self.policy {
                UnknownDocumentPolicy::RouteToPrimary => {
                    debug!(discriminator = %raw, "unmapped discriminator, routing to primary");
                    table.primary().clone()
                }
                UnknownDocumentPolicy::Reject => WorkflowName::new(raw),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulingRequirement
// ---------------------------------------------------------------------------

/// Dispatch table, catalog, router and runtime worker bound together.
pub struct SchedulingRequirement {
    generation: u64,
    table: Arc<DispatchTable>,
    catalog: ActivityCatalog,
    router: DocumentRouter,
    worker: TaskHubWorker,
    backend: Arc<dyn PersistenceBackend>,
    cancel: CancellationToken,
    dispatches: DrainController,
}

impl SchedulingRequirement {
    /// Registers every workflow and activity with a fresh task hub and
    /// creates its worker on `backend`. The worker stays idle until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// - `BindError::UnregisteredTarget` if the router maps a discriminator
    ///   to a workflow missing from `table`.
    /// - `BindError::Backend` if the backend fails to initialize.
    pub async fn bind(
        generation: u64,
        table: DispatchTable,
        catalog: ActivityCatalog,
        router: DocumentRouter,
        backend: Arc<dyn PersistenceBackend>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Result<Self, BindError> {
        if let Some(target) = router.map.targets().into_iter().find(|t| !table.contains(t.as_str())) {
            return Err(BindError::UnregisteredTarget(target.clone()));
        }
        backend.initialize().await?;

        let mut hub = TaskHub::new();
        for (name, definition) in table.iter() {
            hub.register_orchestrator(name.clone(), Arc::clone(definition));
        }
        for (name, activity) in catalog.iter() {
            hub.register_activity(name.clone(), Arc::clone(activity));
        }
        let worker = hub.create_worker(Arc::clone(&backend), options);

        info!(
            generation,
            workflows = table.len(),
            activities = catalog.len(),
            primary = %table.primary(),
            "scheduling requirement bound"
        );
        Ok(Self {
            generation,
            table: Arc::new(table),
            catalog,
            router,
            worker,
            backend,
            cancel,
            dispatches: DrainController::new(),
        })
    }

    /// Starts the runtime worker without blocking.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` on a second call.
    pub fn start(&self) -> Result<(), WorkerError> {
        self.worker.run(self.cancel.clone())
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    #[must_use]
    pub fn catalog(&self) -> &ActivityCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn router(&self) -> &DocumentRouter {
        &self.router
    }

    #[must_use]
    pub fn worker(&self) -> &TaskHubWorker {
        &self.worker
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.dispatches.is_draining()
    }

    /// Dispatch calls currently executing.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.dispatches.in_flight_count()
    }

    /// Chooses the workflow for `discriminator`.
    #[must_use]
    pub fn route(&self, discriminator: Option<&str>) -> WorkflowName {
        self.router.route(discriminator, &self.table)
    }

    /// Parses a raw delivery, routes it and dispatches it.
    ///
    /// # Errors
    ///
    /// `PayloadParse` or `MissingCorrelationKey` for malformed messages,
    /// otherwise as [`dispatch`](Self::dispatch).
    pub async fn handle(&self, headers: &DeliveryHeaders, payload: &[u8]) -> Result<Dispatched, DispatchError> {
        let message = InboundMessage::parse(headers, payload, &self.router.fields)?;
        let workflow = self.route(message.discriminator.as_deref());
        self.dispatch(&workflow, &message.correlation_key, message.payload).await
    }

    /// Starts an instance of `workflow` keyed by `correlation_key`.
    ///
    /// A correlation key that was already used is reported as a duplicate
    /// success, not an error.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` once [`shutdown`](Self::shutdown) has begun.
    /// - `UnknownWorkflow` if `workflow` is not in the dispatch table.
    /// - `MissingCorrelationKey` for a blank key.
    /// - `BackendUnavailable` if the backend cannot be reached.
    pub async fn dispatch(
        &self,
        workflow: &WorkflowName,
        correlation_key: &CorrelationKey,
        payload: Value,
    ) -> Result<Dispatched, DispatchError> {
        let _guard = self.dispatches.try_enter().ok_or(DispatchError::ShuttingDown)?;
        if !self.table.contains(workflow.as_str()) {
            return Err(DispatchError::UnknownWorkflow(workflow.clone()));
        }
        if correlation_key.is_blank() {
            return Err(DispatchError::MissingCorrelationKey);
        }

        match self
            .worker
            .start_new_instance(workflow, correlation_key, payload)
            .await
        {
            Ok(instance_id) => {
                debug!(%instance_id, %workflow, generation = self.generation, "instance started");
                Ok(Dispatched {
                    instance_id,
                    workflow: workflow.clone(),
                    duplicate: false,
                })
            }
            Err(WorkerError::Backend(BackendError::InstanceAlreadyExists(instance_id))) => {
                info!(%instance_id, %workflow, "duplicate delivery, instance already exists");
                Ok(Dispatched {
                    instance_id,
                    workflow: workflow.clone(),
                    duplicate: true,
                })
            }
            Err(WorkerError::Backend(BackendError::Unavailable(reason))) => {
                Err(DispatchError::BackendUnavailable(reason))
            }
            Err(WorkerError::ShuttingDown) => Err(DispatchError::ShuttingDown),
            Err(WorkerError::UnknownOrchestrator(name)) => Err(DispatchError::UnknownWorkflow(name)),
            Err(other) => Err(DispatchError::Internal(other.to_string())),
        }
    }

    /// Stops accepting dispatches, waits for running ones, drains the worker
    /// and releases the backend, all within `timeout`.
    ///
    /// Exceeding the timeout logs a `DrainTimeout` warning and still
    /// completes.
    pub async fn shutdown(&self, timeout: Duration) -> DrainOutcome {
        let deadline = Instant::now() + timeout;
        self.dispatches.begin_drain();

        let dispatch_outcome = self.dispatches.wait_for_drain(timeout).await;
        let worker_outcome = self
            .worker
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;
        self.cancel.cancel();

        let close_budget = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(close_budget, self.backend.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(generation = self.generation, error = %e, "backend close failed"),
            Err(_) => warn!(generation = self.generation, "backend close timed out"),
        }

        let outcome = match (dispatch_outcome, worker_outcome) {
            (DrainOutcome::Drained, DrainOutcome::Drained) => DrainOutcome::Drained,
            (a, b) => DrainOutcome::TimedOut {
                remaining: remaining(a) + remaining(b),
            },
        };
        if let DrainOutcome::TimedOut { remaining } = outcome {
            warn!(
                event = "DrainTimeout",
                generation = self.generation,
                remaining,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "drain timed out, shutting down anyway"
            );
        } else {
            info!(generation = self.generation, "scheduling requirement shut down");
        }
        outcome
    }
}

fn remaining(outcome: DrainOutcome) -> u64 {
    match outcome {
        DrainOutcome::Drained => 0,
        DrainOutcome::TimedOut { remaining } => remaining,
    }
}

impl fmt::Debug for SchedulingRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingRequirement")
            .field("generation", &self.generation)
            .field("primary", self.table.primary())
            .field("workflows", &self.table.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::catalog::test_support::echo_catalog;
    use crate::dispatch::workflows::default_registry;
    use crate::runtime::InMemoryBackend;

    pub const PRIMARY: &str = "b2b-inbound-orchestrator";

    /// A started requirement over echo activities and the default workflows.
    pub async fn started_requirement(
        generation: u64,
        backend: InMemoryBackend,
        policy: UnknownDocumentPolicy,
    ) -> SchedulingRequirement {
        let catalog = echo_catalog();
        let table = default_registry(PRIMARY).unwrap().build(&catalog).unwrap();
        let router = DocumentRouter::new(DiscriminatorMap::default(), policy, MessageFields::default());
        let requirement = SchedulingRequirement::bind(
            generation,
            table,
            catalog,
            router,
            Arc::new(backend),
            WorkerOptions {
                initial_backoff: Duration::from_millis(1),
                ..WorkerOptions::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        requirement.start().unwrap();
        requirement
    }
}
