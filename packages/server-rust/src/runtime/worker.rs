//! Task hub and worker: executes registered workflows against a backend.
//!
//! A [`TaskHub`] collects orchestrator definitions and activities, then turns
//! into a [`TaskHubWorker`] bound to one [`PersistenceBackend`]. Starting an
//! instance persists it first and queues it second, in a task of its own so
//! a caller that stops waiting cannot separate the two. An instance that was
//! persisted but never queued (a crash between the steps) is picked up by
//! `pending_instances` after a restart, or adopted by the first worker that
//! sees its correlation key again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use b2b_router_core::{ActivityName, CorrelationKey, InstanceId, WorkflowName};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backend::{BackendError, InstanceRecord, InstanceStatus, PersistenceBackend};
use crate::catalog::{Activity, ActivityError, ActivityInput};
use crate::dispatch::registry::{WorkflowDefinition, WorkflowStep};
use crate::drain::{DrainController, DrainOutcome, InFlightGuard};

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Tuning for a [`TaskHubWorker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Instances executing concurrently.
    pub max_concurrent_instances: usize,
    /// Attempts per activity before a transient failure becomes permanent.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub initial_backoff: Duration,
    /// Re-queue instances left `Pending`/`Running` when the worker starts.
    pub resume_pending: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_instances: 32,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            resume_pending: false,
        }
    }
}

/// Errors starting or running instances.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("no orchestrator registered as {0}")]
    UnknownOrchestrator(WorkflowName),
    #[error("worker is shutting down")]
    ShuttingDown,
    #[error("worker is already running")]
    AlreadyRunning,
    #[error("instance start task failed: {0}")]
    StartTaskFailed(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Why an instance stopped before its last step.
#[derive(Debug, thiserror::Error)]
enum InstanceError {
    #[error("activity {activity} is not registered")]
    MissingActivity { activity: ActivityName },
    #[error("sub-workflow {0} is not registered")]
    MissingSubWorkflow(WorkflowName),
    #[error("activity {activity} failed after {attempts} attempt(s): {source}")]
    Activity {
        activity: ActivityName,
        attempts: u32,
        source: ActivityError,
    },
}

// ---------------------------------------------------------------------------
// TaskHub
// ---------------------------------------------------------------------------

/// Registration surface of the runtime.
#[derive(Default)]
pub struct TaskHub {
    orchestrators: HashMap<WorkflowName, Arc<WorkflowDefinition>>,
    activities: HashMap<ActivityName, Arc<dyn Activity>>,
}

impl TaskHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an orchestrator definition.
    pub fn register_orchestrator(&mut self, name: WorkflowName, definition: Arc<WorkflowDefinition>) {
        self.orchestrators.insert(name, definition);
    }

    /// Registers (or replaces) an activity implementation.
    pub fn register_activity(&mut self, name: ActivityName, activity: Arc<dyn Activity>) {
        self.activities.insert(name, activity);
    }

    /// Binds the registrations to `backend`. The worker is idle until
    /// [`TaskHubWorker::run`] is called.
    #[must_use]
    pub fn create_worker(
        self,
        backend: Arc<dyn PersistenceBackend>,
        options: WorkerOptions,
    ) -> TaskHubWorker {
        let (tx, rx) = mpsc::unbounded_channel();
        TaskHubWorker {
            inner: Arc::new(WorkerInner {
                semaphore: Arc::new(Semaphore::new(options.max_concurrent_instances.max(1))),
                orchestrators: self.orchestrators,
                activities: self.activities,
                backend,
                options,
                drain: DrainController::new(),
                tracked: DashSet::new(),
            }),
            jobs: tx,
            pending_rx: Mutex::new(Some(rx)),
            running: Mutex::new(None),
        }
    }
}

impl fmt::Debug for TaskHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHub")
            .field("orchestrators", &self.orchestrators.len())
            .field("activities", &self.activities.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TaskHubWorker
// ---------------------------------------------------------------------------

struct Job {
    instance_id: InstanceId,
    workflow: Arc<WorkflowDefinition>,
    input: Arc<Value>,
    _guard: InFlightGuard,
}

struct WorkerInner {
    orchestrators: HashMap<WorkflowName, Arc<WorkflowDefinition>>,
    activities: HashMap<ActivityName, Arc<dyn Activity>>,
    backend: Arc<dyn PersistenceBackend>,
    options: WorkerOptions,
    semaphore: Arc<Semaphore>,
    drain: DrainController,
    /// Instances queued or executing on this worker.
    tracked: DashSet<InstanceId>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Executes workflow instances in the background.
pub struct TaskHubWorker {
    inner: Arc<WorkerInner>,
    jobs: mpsc::UnboundedSender<Job>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    running: Mutex<Option<Running>>,
}

impl TaskHubWorker {
    /// Spawns the execution loop and returns immediately.
    ///
    /// The loop stops taking queued instances once `cancel` fires or
    /// [`shutdown`](Self::shutdown) is called, finishing those already queued.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` on a second call, or
    /// `WorkerError::ShuttingDown` after shutdown.
    pub fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        if self.inner.drain.is_draining() {
            return Err(WorkerError::ShuttingDown);
        }
        let rx = self.pending_rx.lock().take().ok_or(WorkerError::AlreadyRunning)?;

        if self.inner.options.resume_pending {
            self.spawn_resume();
        }

        let handle = tokio::spawn(execution_loop(Arc::clone(&self.inner), rx, cancel.clone()));
        *self.running.lock() = Some(Running { cancel, handle });
        info!(
            orchestrators = self.inner.orchestrators.len(),
            activities = self.inner.activities.len(),
            "task hub worker started"
        );
        Ok(())
    }

    /// Persists a new instance of `workflow` keyed by `correlation_key` and
    /// queues it for execution. The correlation key becomes the instance id.
    ///
    /// Persisting and queueing run in a spawned task: dropping the returned
    /// future (a dispatch timeout, an aborted consumer task) never leaves an
    /// instance persisted but unqueued.
    ///
    /// When the key is taken by a `Pending` instance no worker is executing,
    /// that instance is queued here before the duplicate is reported.
    ///
    /// # Errors
    ///
    /// - `UnknownOrchestrator` if `workflow` is not registered.
    /// - `ShuttingDown` once shutdown has begun.
    /// - `Backend(InstanceAlreadyExists)` if the key was already used.
    /// - `Backend(Unavailable)` if the backend cannot be reached.
    pub async fn start_new_instance(
        &self,
        workflow: &WorkflowName,
        correlation_key: &CorrelationKey,
        input: Value,
    ) -> Result<InstanceId, WorkerError> {
        let definition = self
            .inner
            .orchestrators
            .get(workflow)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownOrchestrator(workflow.clone()))?;
        let guard = self.inner.drain.try_enter().ok_or(WorkerError::ShuttingDown)?;

        let inner = Arc::clone(&self.inner);
        let jobs = self.jobs.clone();
        let instance_id = correlation_key.to_instance_id();
        let task = tokio::spawn(async move {
            let input = Arc::new(input);
            let record = InstanceRecord::pending(
                instance_id.clone(),
                definition.name().clone(),
                input.as_ref().clone(),
            );
            // Claimed before the create so a concurrent duplicate does not
            // adopt an instance this task is about to queue.
            let claimed = inner.tracked.insert(instance_id.clone());
            match inner.backend.create_instance(record).await {
                Ok(()) => {}
                Err(BackendError::InstanceAlreadyExists(existing)) => {
                    if claimed {
                        inner.tracked.remove(&existing);
                        adopt_if_orphaned(&inner, &jobs, &existing, guard).await;
                    }
                    return Err(BackendError::InstanceAlreadyExists(existing).into());
                }
                Err(e) => {
                    if claimed {
                        inner.tracked.remove(&instance_id);
                    }
                    return Err(e.into());
                }
            }

            enqueue(
                &inner,
                &jobs,
                Job {
                    instance_id: instance_id.clone(),
                    workflow: definition,
                    input,
                    _guard: guard,
                },
            )?;
            Ok::<_, WorkerError>(instance_id)
        });

        let instance_id = task
            .await
            .map_err(|e| WorkerError::StartTaskFailed(e.to_string()))??;
        debug!(%instance_id, %workflow, "instance queued");
        Ok(instance_id)
    }

    /// Instances accepted and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.drain.in_flight_count()
    }

    /// The backend this worker persists to.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.inner.backend
    }

    /// Stops accepting instances and waits up to `timeout` for accepted ones
    /// to finish. Instances still executing after the timeout are aborted and
    /// stay resumable in the backend.
    pub async fn shutdown(&self, timeout: Duration) -> DrainOutcome {
        self.inner.drain.begin_drain();
        let running = self.running.lock().take();
        // Never started: queued jobs are dropped with the receiver and stay
        // pending in the backend.
        drop(self.pending_rx.lock().take());

        let Some(Running { cancel, handle }) = running else {
            return self.inner.drain.wait_for_drain(Duration::ZERO).await;
        };
        cancel.cancel();

        let outcome = self.inner.drain.wait_for_drain(timeout).await;
        if outcome.is_drained() {
            if let Err(e) = handle.await {
                error!(error = %e, "task hub execution loop panicked");
            }
        } else {
            handle.abort();
        }
        info!(?outcome, "task hub worker stopped");
        outcome
    }

    fn spawn_resume(&self) {
        let inner = Arc::clone(&self.inner);
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let pending = match inner.backend.pending_instances().await {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "could not list pending instances");
                    return;
                }
            };
            let mut resumed = 0_usize;
            for record in pending {
                let Some(definition) = inner.orchestrators.get(&record.workflow).cloned() else {
                    warn!(
                        instance_id = %record.instance_id,
                        workflow = %record.workflow,
                        "pending instance references an unregistered workflow"
                    );
                    continue;
                };
                if inner.tracked.contains(&record.instance_id) {
                    continue;
                }
                let Some(guard) = inner.drain.try_enter() else {
                    break;
                };
                let job = Job {
                    instance_id: record.instance_id,
                    workflow: definition,
                    input: Arc::new(record.input),
                    _guard: guard,
                };
                if enqueue(&inner, &jobs, job).is_err() {
                    break;
                }
                resumed += 1;
            }
            if resumed > 0 {
                info!(resumed, "resumed pending instances");
            }
        });
    }
}

impl fmt::Debug for TaskHubWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHubWorker")
            .field("orchestrators", &self.inner.orchestrators.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Queues `job` and marks its instance as tracked by this worker.
fn enqueue(
    inner: &WorkerInner,
    jobs: &mpsc::UnboundedSender<Job>,
    job: Job,
) -> Result<(), WorkerError> {
    let instance_id = job.instance_id.clone();
    inner.tracked.insert(instance_id.clone());
    if jobs.send(job).is_err() {
        inner.tracked.remove(&instance_id);
        return Err(WorkerError::ShuttingDown);
    }
    Ok(())
}

/// Queues an existing `Pending` instance that no job on this worker covers.
/// Failures are logged; the caller still reports the duplicate.
async fn adopt_if_orphaned(
    inner: &WorkerInner,
    jobs: &mpsc::UnboundedSender<Job>,
    instance_id: &InstanceId,
    guard: InFlightGuard,
) {
    if !inner.tracked.insert(instance_id.clone()) {
        return;
    }
    let record = match inner.backend.load_instance(instance_id).await {
        Ok(Some(record)) if record.status == InstanceStatus::Pending => record,
        Ok(_) => {
            inner.tracked.remove(instance_id);
            return;
        }
        Err(e) => {
            inner.tracked.remove(instance_id);
            warn!(%instance_id, error = %e, "could not inspect existing instance");
            return;
        }
    };
    let Some(definition) = inner.orchestrators.get(&record.workflow).cloned() else {
        inner.tracked.remove(instance_id);
        warn!(
            %instance_id,
            workflow = %record.workflow,
            "pending instance references an unregistered workflow"
        );
        return;
    };
    let job = Job {
        instance_id: record.instance_id,
        workflow: definition,
        input: Arc::new(record.input),
        _guard: guard,
    };
    if enqueue(inner, jobs, job).is_ok() {
        info!(%instance_id, "adopted pending instance left unqueued");
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

async fn execution_loop(
    inner: Arc<WorkerInner>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    let mut closing = false;
    loop {
        tokio::select! {
            () = cancel.cancelled(), if !closing => {
                // Refuse new sends but keep receiving what is already queued.
                rx.close();
                closing = true;
            }
            job = rx.recv() => match job {
                Some(job) => {
                    tasks.spawn(execute_instance(Arc::clone(&inner), job));
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "instance task panicked");
                }
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "instance task panicked");
        }
    }
}

async fn execute_instance(inner: Arc<WorkerInner>, job: Job) {
    let Ok(_permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
        return;
    };
    let instance_id = job.instance_id.clone();
    let workflow = job.workflow.name().clone();

    if let Err(e) = inner
        .backend
        .update_status(&instance_id, InstanceStatus::Running, None)
        .await
    {
        warn!(%instance_id, error = %e, "could not mark instance running");
    }

    let (status, failure) = match run_steps(&inner, &job).await {
        Ok(()) => {
            info!(%instance_id, %workflow, "instance completed");
            (InstanceStatus::Completed, None)
        }
        Err(e) => {
            warn!(%instance_id, %workflow, error = %e, "instance failed");
            (InstanceStatus::Failed, Some(e.to_string()))
        }
    };
    metrics::counter!(
        "b2b_router_instances_total",
        "workflow" => workflow.to_string(),
        "status" => status.as_str()
    )
    .increment(1);

    if let Err(e) = inner.backend.update_status(&instance_id, status, failure).await {
        warn!(%instance_id, error = %e, "could not record final instance status");
    }
    inner.tracked.remove(&instance_id);
}

/// Walks the step list depth-first; sub-workflows run inline.
async fn run_steps(inner: &WorkerInner, job: &Job) -> Result<(), InstanceError> {
    let mut stack: Vec<(Arc<WorkflowDefinition>, usize)> = vec![(Arc::clone(&job.workflow), 0)];
    while let Some((definition, index)) = stack.pop() {
        let Some(step) = definition.steps().get(index).cloned() else {
            continue;
        };
        stack.push((Arc::clone(&definition), index + 1));
        match step {
            WorkflowStep::Activity(activity) => {
                run_activity(inner, job, definition.name(), &activity).await?;
            }
            WorkflowStep::SubWorkflow(sub) => {
                let child = inner
                    .orchestrators
                    .get(&sub)
                    .cloned()
                    .ok_or(InstanceError::MissingSubWorkflow(sub))?;
                stack.push((child, 0));
            }
        }
    }
    Ok(())
}

async fn run_activity(
    inner: &WorkerInner,
    job: &Job,
    workflow: &WorkflowName,
    name: &ActivityName,
) -> Result<Value, InstanceError> {
    let activity = inner
        .activities
        .get(name)
        .cloned()
        .ok_or_else(|| InstanceError::MissingActivity {
            activity: name.clone(),
        })?;

    let max_attempts = inner.options.max_attempts.max(1);
    let mut backoff = inner.options.initial_backoff;
    let mut attempt = 1;
    loop {
        let input = ActivityInput {
            instance_id: job.instance_id.clone(),
            workflow: workflow.clone(),
            document: Arc::clone(&job.input),
            attempt,
        };
        match activity.execute(input).await {
            Ok(output) => return Ok(output),
            Err(ActivityError::Transient(reason)) if attempt < max_attempts => {
                warn!(
                    instance_id = %job.instance_id,
                    activity = %name,
                    attempt,
                    %reason,
                    "transient activity failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(source) => {
                return Err(InstanceError::Activity {
                    activity: name.clone(),
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}
