//! Dispatch instrumentation: a tracing span per delivery plus counters and a
//! latency histogram from the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::dispatch::binding::{DispatchError, Dispatched};
use crate::dispatch::service::DispatchRequest;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records duration and outcome of each dispatch.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<DispatchRequest> for MetricsService<S>
where
    S: Service<DispatchRequest, Response = Dispatched, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Dispatched;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let span = info_span!(
            "dispatch",
            delivery_tag = req.delivery_tag,
            redelivery_count = req.redelivery_count,
            workflow = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(d) if d.duplicate => "duplicate",
                    Ok(_) => "dispatched",
                    Err(e) => e.kind(),
                };
                let span = tracing::Span::current();
                span.record("outcome", outcome);
                if let Ok(d) = &result {
                    span.record("workflow", d.workflow.as_str());
                }

                ::metrics::counter!("b2b_router_dispatch_total", "outcome" => outcome).increment(1);
                ::metrics::histogram!("b2b_router_dispatch_duration_seconds").record(elapsed.as_secs_f64());

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::debug!(duration_ms, outcome, "dispatch complete");
                result
            }
            .instrument(span),
        )
    }
}
