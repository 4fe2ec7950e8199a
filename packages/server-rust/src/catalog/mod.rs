//! Activity catalog: named, reusable units of work referenced by workflows.
//!
//! The catalog is built once per configuration snapshot and is immutable
//! afterwards. Workflows hold activity *names*; the runtime resolves them
//! against the catalog bound into the active scheduling requirement, so a
//! reload can replace the catalog wholesale.

pub mod activities;
pub mod factory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use b2b_router_core::{ActivityName, InstanceId, WorkflowName};
use serde_json::Value;

pub use activities::{CallPartnerApi, RecordOutcome, ValidateDocument};
pub use factory::CatalogFactory;

/// Names of the activities the default catalog registers.
pub mod activity_names {
    pub const VALIDATE_DOCUMENT: &str = "validate-document";
    pub const CALL_PARTNER_API: &str = "call-partner-api";
    pub const RECORD_OUTCOME: &str = "record-outcome";
}

// ---------------------------------------------------------------------------
// Activity trait
// ---------------------------------------------------------------------------

/// Input handed to an activity execution.
#[derive(Debug, Clone)]
pub struct ActivityInput {
    /// Instance the activity runs for.
    pub instance_id: InstanceId,
    /// Workflow (or sub-workflow) whose step invoked the activity.
    pub workflow: WorkflowName,
    /// The inbound document, shared by all steps of the instance.
    pub document: Arc<Value>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Failure of an activity execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    /// May succeed if retried (timeouts, 5xx, connection resets).
    #[error("transient activity failure: {0}")]
    Transient(String),
    /// Will not succeed on retry.
    #[error("activity failed: {0}")]
    Failed(String),
}

/// A single, typically side-effecting, unit of work.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Runs the activity once.
    async fn execute(&self, input: ActivityInput) -> Result<Value, ActivityError>;
}

// ---------------------------------------------------------------------------
// ActivityCatalog
// ---------------------------------------------------------------------------

/// Errors assembling a catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("activity registered twice: {0}")]
    DuplicateActivityName(ActivityName),
    #[error("invalid activity configuration for {name}: {reason}")]
    InvalidConfiguration { name: ActivityName, reason: String },
}

/// Immutable mapping from activity name to implementation.
#[derive(Clone, Default)]
pub struct ActivityCatalog {
    activities: HashMap<ActivityName, Arc<dyn Activity>>,
}

impl ActivityCatalog {
    #[must_use]
    pub fn builder() -> ActivityCatalogBuilder {
        ActivityCatalogBuilder::default()
    }

    /// Looks up an activity by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&ActivityName> {
        let mut names: Vec<_> = self.activities.keys().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Iterates over `(name, activity)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&ActivityName, &Arc<dyn Activity>)> {
        self.activities.iter()
    }
}

impl fmt::Debug for ActivityCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityCatalog")
            .field("activities", &self.names())
            .finish()
    }
}

/// Collects activities; rejects duplicate names at build time.
#[derive(Default)]
pub struct ActivityCatalogBuilder {
    activities: HashMap<ActivityName, Arc<dyn Activity>>,
    duplicates: Vec<ActivityName>,
}

impl ActivityCatalogBuilder {
    /// Adds an activity under `name`.
    #[must_use]
    pub fn register(mut self, name: impl Into<ActivityName>, activity: Arc<dyn Activity>) -> Self {
        let name = name.into();
        if self.activities.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.activities.insert(name, activity);
        }
        self
    }

    /// Finishes the catalog.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::DuplicateActivityName` for the first name that
    /// was registered more than once.
    pub fn build(mut self) -> Result<ActivityCatalog, CatalogError> {
        if !self.duplicates.is_empty() {
            return Err(CatalogError::DuplicateActivityName(self.duplicates.swap_remove(0)));
        }
        Ok(ActivityCatalog {
            activities: self.activities,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{echo_catalog, EchoActivity};
    use super::*;

    #[test]
    fn builder_registers_and_looks_up() {
        let catalog = echo_catalog();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.contains(activity_names::CALL_PARTNER_API));
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn duplicate_activity_names_fail_build() {
        let err = ActivityCatalog::builder()
            .register("a", Arc::new(EchoActivity::new("1")))
            .register("a", Arc::new(EchoActivity::new("2")))
            .build()
            .unwrap_err();
        assert_eq!(err, CatalogError::DuplicateActivityName("a".into()));
    }

    #[test]
    fn names_are_sorted() {
        let catalog = echo_catalog();
        let names: Vec<&str> = catalog.names().into_iter().map(ActivityName::as_str).collect();
        assert_eq!(names, vec!["call-partner-api", "record-outcome", "validate-document"]);
    }

    #[tokio::test]
    async fn looked_up_activity_executes() {
        let catalog = echo_catalog();
        let activity = catalog.get(activity_names::RECORD_OUTCOME).unwrap();
        let out = activity
            .execute(ActivityInput {
                instance_id: "i-1".into(),
                workflow: "wf".into(),
                document: Arc::new(Value::Null),
                attempt: 1,
            })
            .await
            .unwrap();
        assert_eq!(out, Value::String("record".to_string()));
    }
}
