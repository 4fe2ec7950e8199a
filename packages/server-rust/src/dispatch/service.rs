//! `tower::Service` that dispatches deliveries through the active requirement.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwap;
use b2b_router_core::DeliveryHeaders;
use bytes::Bytes;
use tower::Service;
use tracing::debug;

use super::binding::{DispatchError, Dispatched, SchedulingRequirement};

/// Handle to the currently active scheduling requirement.
///
/// Replaced with a single pointer swap; readers never see a half-built value.
pub type ActiveRequirement = Arc<ArcSwap<SchedulingRequirement>>;

/// One delivery handed to the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Transport-assigned tag, for logging.
    pub delivery_tag: u64,
    /// Times the transport delivered this message before.
    pub redelivery_count: u32,
    pub headers: DeliveryHeaders,
    pub payload: Bytes,
    /// Upper bound for this dispatch attempt.
    pub timeout: Duration,
}

/// Dispatches through whichever requirement is active when the call starts.
///
/// A requirement that began shutting down after it was loaded means a reload
/// swapped it out; the call is retried once against the new active one.
#[derive(Clone)]
pub struct DispatchService {
    active: ActiveRequirement,
}

impl DispatchService {
    #[must_use]
    pub fn new(active: ActiveRequirement) -> Self {
        Self { active }
    }
}

impl Service<DispatchRequest> for DispatchService {
    type Response = Dispatched;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let active = Arc::clone(&self.active);
        Box::pin(async move {
            let requirement = active.load_full();
            let result = requirement.handle(&req.headers, &req.payload).await;
            if !matches!(result, Err(DispatchError::ShuttingDown)) {
                return result;
            }
            let current = active.load_full();
            if Arc::ptr_eq(&current, &requirement) {
                return result;
            }
            debug!(
                delivery_tag = req.delivery_tag,
                from = requirement.generation(),
                to = current.generation(),
                "requirement swapped mid-dispatch, retrying"
            );
            current.handle(&req.headers, &req.payload).await
        })
    }
}

#[cfg(test)]
mod tests {
    use b2b_router_core::UnknownDocumentPolicy;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::binding::test_support::started_requirement;
    use crate::runtime::InMemoryBackend;

    fn request(key: &str) -> DispatchRequest {
        let mut headers = DeliveryHeaders::new();
        headers.insert("x-document-type", "SN");
        headers.insert("x-correlation-id", key);
        DispatchRequest {
            delivery_tag: 1,
            redelivery_count: 0,
            headers,
            payload: Bytes::from_static(br#"{"sn": 1}"#),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn dispatches_through_active_requirement() {
        let req = started_requirement(1, InMemoryBackend::new(), UnknownDocumentPolicy::default()).await;
        let active: ActiveRequirement = Arc::new(ArcSwap::from_pointee(req));
        let out = DispatchService::new(active).oneshot(request("K-1")).await.unwrap();
        assert_eq!(out.instance_id.as_str(), "K-1");
    }

    #[tokio::test]
    async fn dispatch_after_swap_uses_new_requirement() {
        let backend = InMemoryBackend::new();
        let old = Arc::new(started_requirement(1, backend.clone(), UnknownDocumentPolicy::default()).await);
        let active: ActiveRequirement = Arc::new(ArcSwap::new(Arc::clone(&old)));
        let service = DispatchService::new(Arc::clone(&active));

        let new = started_requirement(2, backend, UnknownDocumentPolicy::default()).await;
        active.store(Arc::new(new));
        old.shutdown(Duration::from_secs(1)).await;

        let out = service.oneshot(request("K-2")).await.unwrap();
        assert_eq!(out.instance_id.as_str(), "K-2");
        assert_eq!(active.load().generation(), 2);
    }

    #[tokio::test]
    async fn shutting_down_without_swap_is_returned() {
        let req = Arc::new(started_requirement(1, InMemoryBackend::new(), UnknownDocumentPolicy::default()).await);
        let active: ActiveRequirement = Arc::new(ArcSwap::new(Arc::clone(&req)));
        req.shutdown(Duration::from_secs(1)).await;
        let err = DispatchService::new(active).oneshot(request("K-3")).await.unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
    }
}
