//! In-process [`PersistenceBackend`].
//!
//! Clones share one store, so a backend handed to successive scheduling
//! requirements keeps duplicate detection across reloads. Nothing survives
//! the process.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use b2b_router_core::InstanceId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::backend::{BackendError, InstanceRecord, InstanceStatus, PersistenceBackend};

/// `DashMap`-backed instance store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    instances: Arc<DashMap<InstanceId, InstanceRecord>>,
    unavailable_for: Arc<AtomicU32>,
    create_delay_ms: Arc<AtomicU64>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `create_instance` fail with
    /// [`BackendError::Unavailable`].
    pub fn fail_next_creates(&self, count: u32) {
        self.unavailable_for.store(count, Ordering::SeqCst);
    }

    /// Makes every successful `create_instance` return only after `delay`.
    /// The record is stored before the wait, like a commit whose
    /// acknowledgement is slow.
    pub fn delay_creates(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Snapshot of one instance's status.
    #[must_use]
    pub fn status_of(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.instances.get(instance_id).map(|r| r.status)
    }

    fn take_injected_failure(&self) -> bool {
        self.unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_instance(&self, record: InstanceRecord) -> Result<(), BackendError> {
        if self.take_injected_failure() {
            return Err(BackendError::Unavailable("injected outage".to_string()));
        }
        match self.instances.entry(record.instance_id.clone()) {
            Entry::Occupied(_) => return Err(BackendError::InstanceAlreadyExists(record.instance_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        instance_id: &InstanceId,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        let mut record = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| BackendError::NotFound(instance_id.clone()))?;
        record.status = status;
        record.error = error;
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, BackendError> {
        Ok(self.instances.get(instance_id).map(|r| r.clone()))
    }

    async fn pending_instances(&self) -> Result<Vec<InstanceRecord>, BackendError> {
        Ok(self
            .instances
            .iter()
            .filter(|r| r.status.is_resumable())
            .map(|r| r.clone())
            .collect())
    }

    async fn close(&self) -> Result<(), BackendError> {
        debug!(instances = self.instances.len(), "in-memory backend handle released");
        Ok(())
    }
}
