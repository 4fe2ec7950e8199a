//! Persistence contract for workflow instances.

use std::fmt;

use async_trait::async_trait;
use b2b_router_core::{InstanceId, WorkflowName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a persisted workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A worker is executing its steps.
    Running,
    /// All steps finished.
    Completed,
    /// A step failed permanently.
    Failed,
}

impl InstanceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stored label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `true` for instances a restarted worker should pick up again.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub workflow: WorkflowName,
    pub input: Value,
    pub status: InstanceStatus,
    /// Failure reason, set when `status` is `Failed`.
    pub error: Option<String>,
}

impl InstanceRecord {
    /// A fresh `Pending` record.
    #[must_use]
    pub fn pending(instance_id: InstanceId, workflow: WorkflowName, input: Value) -> Self {
        Self {
            instance_id,
            workflow,
            input,
            status: InstanceStatus::Pending,
            error: None,
        }
    }
}

/// Errors returned by a [`PersistenceBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The store cannot be reached right now; retrying later may succeed.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
    /// An instance with this id was already created.
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(InstanceId),
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("persistence backend error: {0}")]
    Internal(String),
}

impl BackendError {
    /// `true` when the failure may clear on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable storage for workflow instances.
///
/// `create_instance` is the idempotency point: a second create for the same
/// id must fail with [`BackendError::InstanceAlreadyExists`] and leave the
/// existing record untouched.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Prepares the store (schema, tables). Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the store cannot be reached.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Persists a new instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceAlreadyExists` if the id is taken.
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), BackendError>;

    /// Records a status transition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), BackendError>;

    /// Loads one instance.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` or `Internal` on store failures.
    async fn load_instance(&self, instance_id: &InstanceId)
        -> Result<Option<InstanceRecord>, BackendError>;

    /// Instances left `Pending` or `Running`, e.g. by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` or `Internal` on store failures.
    async fn pending_instances(&self) -> Result<Vec<InstanceRecord>, BackendError>;

    /// Releases connections held by this handle.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if resources could not be released cleanly.
    async fn close(&self) -> Result<(), BackendError>;
}
