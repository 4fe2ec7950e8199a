//! Composes the dispatch middleware around [`DispatchService`].

use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::dispatch::service::{ActiveRequirement, DispatchService};

/// The full per-delivery stack, outermost first.
pub type DispatchPipeline = MetricsService<TimeoutService<DispatchService>>;

/// Wraps the dispatch service with its middleware.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer`: span, counters and latency, timeouts included
/// 2. `TimeoutLayer`: per-delivery dispatch timeout
#[must_use]
pub fn build_dispatch_pipeline(active: ActiveRequirement) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer)
        .service(DispatchService::new(active))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use arc_swap::ArcSwap;
    use b2b_router_core::{DeliveryHeaders, UnknownDocumentPolicy};
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::binding::test_support::started_requirement;
    use crate::dispatch::binding::DispatchError;
    use crate::dispatch::service::DispatchRequest;
    use crate::runtime::InMemoryBackend;

    fn request(discriminator: &str, key: &str) -> DispatchRequest {
        let mut headers = DeliveryHeaders::new();
        headers.insert("x-document-type", discriminator);
        headers.insert("x-correlation-id", key);
        DispatchRequest {
            delivery_tag: 9,
            redelivery_count: 0,
            headers,
            payload: Bytes::from_static(br#"{"doc": true}"#),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let req = started_requirement(1, InMemoryBackend::new(), UnknownDocumentPolicy::Reject).await;
        let active = Arc::new(ArcSwap::from_pointee(req));

        let out = build_dispatch_pipeline(Arc::clone(&active))
            .oneshot(request("NF", "NF-1"))
            .await
            .unwrap();
        assert_eq!(out.workflow.as_str(), "nf-sub-orchestrator");

        let err = build_dispatch_pipeline(active)
            .oneshot(request("UNKNOWN_TYPE", "X-1"))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::UnknownWorkflow("UNKNOWN_TYPE".into()));
    }
}
