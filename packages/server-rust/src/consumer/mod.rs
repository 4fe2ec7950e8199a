//! Message consumption loop.
//!
//! Pulls deliveries in transport order and processes each on its own task
//! through the dispatch pipeline, at most `max_in_flight` at a time. Every
//! delivery is settled exactly once according to [`classify`]. Cancellation
//! stops pulling; deliveries already pulled are given up to the drain timeout
//! to settle.

pub mod redelivery;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::dispatch::{
    build_dispatch_pipeline, classify, ActiveRequirement, DispatchPipeline, DispatchRequest,
    Disposition,
};
use crate::transport::{DeliveryStream, InboundDelivery};

pub use redelivery::RedeliveryTracker;

/// Consumer settings, fixed for the life of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: String,
    pub max_in_flight: usize,
    pub dispatch_timeout: Duration,
    pub max_redeliveries: u32,
    pub drain_timeout: Duration,
}

impl ConsumerSettings {
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            queue: config.amqp.queue_name.clone(),
            max_in_flight: config.dispatch.max_in_flight.max(1),
            dispatch_timeout: config.dispatch.dispatch_timeout(),
            max_redeliveries: config.dispatch.max_redeliveries,
            drain_timeout: config.dispatch.drain_timeout(),
        }
    }
}

/// Totals reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub poisoned: u64,
    /// Settlements the transport refused.
    pub settle_failures: u64,
    /// Deliveries still unsettled when the drain timeout elapsed.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    poisoned: AtomicU64,
    settle_failures: AtomicU64,
}

impl Counters {
    fn report(&self, abandoned: u64) -> ConsumerReport {
        ConsumerReport {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            abandoned,
        }
    }
}

/// The long-lived consumption task.
pub struct ConsumptionLoop {
    pipeline: DispatchPipeline,
    settings: ConsumerSettings,
    cancel: CancellationToken,
}

impl ConsumptionLoop {
    #[must_use]
    pub fn new(active: ActiveRequirement, settings: ConsumerSettings, cancel: CancellationToken) -> Self {
        Self {
            pipeline: build_dispatch_pipeline(active),
            settings,
            cancel,
        }
    }

    /// Runs until `stream` ends or the loop is cancelled, then drains.
    pub async fn run(self, mut stream: DeliveryStream) -> ConsumerReport {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let counters = Arc::new(Counters::default());
        let tracker = Arc::new(RedeliveryTracker::default());
        let mut tasks = JoinSet::new();
        info!(
            queue = %self.settings.queue,
            max_in_flight = self.settings.max_in_flight,
            "consumption loop started"
        );

        loop {
            // Take a slot before pulling so the loop never holds a delivery it
            // cannot start.
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            match next {
                Some(Ok(delivery)) => {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    tasks.spawn(process(
                        self.pipeline.clone(),
                        delivery,
                        self.settings.clone(),
                        Arc::clone(&counters),
                        Arc::clone(&tracker),
                        permit,
                    ));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "transport yielded an error");
                }
                None => {
                    info!("delivery stream ended");
                    break;
                }
            }
        }
        drop(stream);

        let pending = tasks.len();
        debug!(pending, "consumption loop draining");
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        let abandoned = match drained {
            Ok(()) => 0,
            Err(_) => {
                let remaining = u64::try_from(tasks.len()).unwrap_or(u64::MAX);
                warn!(
                    event = "DrainTimeout",
                    remaining,
                    "deliveries still in flight at drain timeout, abandoning"
                );
                tasks.abort_all();
                remaining
            }
        };

        let report = counters.report(abandoned);
        info!(?report, "consumption loop stopped");
        report
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "delivery task panicked");
        }
    }
}

async fn process(
    pipeline: DispatchPipeline,
    delivery: InboundDelivery,
    settings: ConsumerSettings,
    counters: Arc<Counters>,
    tracker: Arc<RedeliveryTracker>,
    _permit: OwnedSemaphorePermit,
) {
    let delivery_tag = delivery.delivery_tag();
    let attempt = tracker.observe(&delivery);
    let redelivery_count = attempt.redelivery_count;
    let request = DispatchRequest {
        delivery_tag,
        redelivery_count,
        headers: delivery.headers().clone(),
        payload: delivery.payload().clone(),
        timeout: settings.dispatch_timeout,
    };

    let result = pipeline.oneshot(request).await;
    let disposition = classify(&result, redelivery_count, settings.max_redeliveries);

    if let Err(e) = &result {
        match disposition {
            Disposition::Reject => warn!(
                delivery_tag,
                error = %e,
                "malformed delivery rejected without requeue"
            ),
            Disposition::Requeue => warn!(
                delivery_tag,
                redelivery_count,
                error = %e,
                "transient dispatch failure, requeueing"
            ),
            Disposition::Poison => error!(
                event = "PoisonMessage",
                delivery_tag,
                redelivery_count,
                max_redeliveries = settings.max_redeliveries,
                error = %e,
                "redelivery ceiling reached, rejecting"
            ),
            Disposition::Ack => {}
        }
    }

    let settled = match disposition {
        Disposition::Ack => delivery.ack().await,
        other => delivery.reject(other.requeue()).await,
    };
    tracker.settled(&attempt, disposition);

    let counter = match disposition {
        Disposition::Ack => &counters.acked,
        Disposition::Reject => &counters.rejected,
        Disposition::Requeue => &counters.requeued,
        Disposition::Poison => &counters.poisoned,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("b2b_router_deliveries_total", "disposition" => disposition.as_str()).increment(1);
    if disposition == Disposition::Poison {
        metrics::counter!("b2b_router_poison_messages_total").increment(1);
    }

    if let Err(e) = settled {
        counters.settle_failures.fetch_add(1, Ordering::Relaxed);
        warn!(delivery_tag, error = %e, "could not settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwap;
    use b2b_router_core::{DeliveryHeaders, UnknownDocumentPolicy};

    use super::*;
    use crate::dispatch::binding::test_support::started_requirement;
    use crate::runtime::InMemoryBackend;
    use crate::transport::{InMemoryTransport, SettlementOutcome, Transport};

    const QUEUE: &str = "b2b-inbound";

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            queue: QUEUE.to_string(),
            max_in_flight: 4,
            dispatch_timeout: Duration::from_secs(1),
            max_redeliveries: 2,
            drain_timeout: Duration::from_secs(2),
        }
    }

    fn headers(discriminator: &str, key: &str) -> DeliveryHeaders {
        [("x-document-type", discriminator), ("x-correlation-id", key)]
            .into_iter()
            .collect()
    }

    async fn active(backend: InMemoryBackend, policy: UnknownDocumentPolicy) -> ActiveRequirement {
        Arc::new(ArcSwap::from_pointee(started_requirement(1, backend, policy).await))
    }

    #[tokio::test]
    async fn acks_dispatched_and_rejects_malformed() {
        let transport = InMemoryTransport::new();
        let ok = transport.publish(QUEUE, headers("SN", "K-1"), &br#"{"a":1}"#[..]);
        let bad = transport.publish(QUEUE, headers("SN", "K-2"), &b"{broken"[..]);

        let cancel = CancellationToken::new();
        let consumer = ConsumptionLoop::new(
            active(InMemoryBackend::new(), UnknownDocumentPolicy::default()).await,
            settings(),
            cancel.clone(),
        );
        let stream = transport.consume(QUEUE).await.unwrap();
        let handle = tokio::spawn(consumer.run(stream));

        assert!(transport.wait_for_settlements(2, Duration::from_secs(2)).await);
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(transport.settlements_for(ok)[0].outcome, SettlementOutcome::Acked);
        assert_eq!(transport.settlements_for(bad)[0].outcome, SettlementOutcome::Rejected);
        assert_eq!(report.received, 2);
        assert_eq!(report.acked, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn persistent_outage_becomes_poison_after_ceiling() {
        let transport = InMemoryTransport::new();
        let id = transport.publish(QUEUE, headers("SN", "K-1"), &br#"{"a":1}"#[..]);
        let backend = InMemoryBackend::new();
        backend.fail_next_creates(10);

        let cancel = CancellationToken::new();
        let consumer = ConsumptionLoop::new(
            active(backend, UnknownDocumentPolicy::default()).await,
            settings(),
            cancel.clone(),
        );
        let handle = tokio::spawn(consumer.run(transport.consume(QUEUE).await.unwrap()));

        assert!(transport.wait_for_settlements(3, Duration::from_secs(2)).await);
        cancel.cancel();
        let report = handle.await.unwrap();

        let outcomes: Vec<_> = transport.settlements_for(id).into_iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                SettlementOutcome::Requeued,
                SettlementOutcome::Requeued,
                SettlementOutcome::Rejected
            ]
        );
        assert_eq!(report.poisoned, 1);
    }

    #[tokio::test]
    async fn flag_only_redeliveries_still_reach_the_ceiling() {
        let transport = InMemoryTransport::new();
        transport.report_flag_only(true);
        let id = transport.publish(QUEUE, headers("SN", "K-1"), &br#"{"a":1}"#[..]);
        let backend = InMemoryBackend::new();
        backend.fail_next_creates(10);

        let cancel = CancellationToken::new();
        let consumer = ConsumptionLoop::new(
            active(backend, UnknownDocumentPolicy::default()).await,
            ConsumerSettings {
                max_redeliveries: 3,
                ..settings()
            },
            cancel.clone(),
        );
        let handle = tokio::spawn(consumer.run(transport.consume(QUEUE).await.unwrap()));

        assert!(transport.wait_for_settlements(4, Duration::from_secs(2)).await);
        cancel.cancel();
        let report = handle.await.unwrap();

        let outcomes: Vec<_> = transport.settlements_for(id).into_iter().map(|s| s.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                SettlementOutcome::Requeued,
                SettlementOutcome::Requeued,
                SettlementOutcome::Requeued,
                SettlementOutcome::Rejected
            ]
        );
        assert_eq!(report.poisoned, 1);
    }

    #[tokio::test]
    async fn stream_end_stops_the_loop() {
        let transport = InMemoryTransport::new();
        let consumer = ConsumptionLoop::new(
            active(InMemoryBackend::new(), UnknownDocumentPolicy::default()).await,
            settings(),
            CancellationToken::new(),
        );
        let stream = transport.consume(QUEUE).await.unwrap();
        transport.close().await.unwrap();
        let report = consumer.run(stream).await;
        assert_eq!(report, ConsumerReport::default());
    }

    #[test]
    fn settings_follow_config() {
        let mut config = RouterConfig::default();
        config.dispatch.max_in_flight = 0;
        config.amqp.queue_name = "inbound-x".to_string();
        let settings = ConsumerSettings::from_config(&config);
        assert_eq!(settings.max_in_flight, 1);
        assert_eq!(settings.queue, "inbound-x");
    }
}
