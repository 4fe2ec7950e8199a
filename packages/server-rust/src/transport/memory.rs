//! In-process [`Transport`] with broker-like redelivery.
//!
//! Each queue is a channel with one consumer. A rejection with requeue puts
//! the message back with its redelivery count incremented and a fresh
//! delivery tag. Every settlement is appended to a ledger keyed by message
//! id, which is stable across redeliveries.
//!
//! [`report_flag_only`](InMemoryTransport::report_flag_only) makes it behave
//! like a classic AMQP queue, which only flags a delivery as redelivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use b2b_router_core::DeliveryHeaders;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Acknowledger, DeliveryStream, InboundDelivery, Redelivery, Transport, TransportError};

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Acked,
    Rejected,
    Requeued,
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Stable id assigned at publish time.
    pub message_id: u64,
    pub delivery_tag: u64,
    pub redelivery_count: u32,
    pub outcome: SettlementOutcome,
}

#[derive(Debug, Clone)]
struct Envelope {
    message_id: u64,
    redelivery_count: u32,
    headers: DeliveryHeaders,
    payload: Bytes,
}

struct Queue {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct Inner {
    queues: Mutex<HashMap<String, Queue>>,
    next_message_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    ledger: Mutex<Vec<Settlement>>,
    settled: watch::Sender<usize>,
    closed: CancellationToken,
    flag_only: AtomicBool,
}

/// Channel-backed transport for tests and local runs.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                next_message_id: AtomicU64::new(1),
                next_delivery_tag: AtomicU64::new(1),
                ledger: Mutex::new(Vec::new()),
                settled,
                closed: CancellationToken::new(),
                flag_only: AtomicBool::new(false),
            }),
        }
    }

    /// Reports redeliveries as a flag plus the message id instead of an
    /// exact count.
    pub fn report_flag_only(&self, enabled: bool) {
        self.inner.flag_only.store(enabled, Ordering::SeqCst);
    }

    /// Enqueues a message and returns its message id.
    pub fn publish(&self, queue: &str, headers: DeliveryHeaders, payload: impl Into<Bytes>) -> u64 {
        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            message_id,
            redelivery_count: 0,
            headers,
            payload: payload.into(),
        };
        let mut queues = self.inner.queues.lock();
        let entry = queues.entry(queue.to_string()).or_insert_with(Queue::new);
        // The receiver lives in the map or in a consumer; a send only fails
        // after close, when the message is intentionally dropped.
        let _ = entry.tx.send(envelope);
        message_id
    }

    /// Snapshot of all settlements so far, in settlement order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.ledger.lock().clone()
    }

    /// Settlements recorded for one message, across redeliveries.
    #[must_use]
    pub fn settlements_for(&self, message_id: u64) -> Vec<Settlement> {
        self.inner
            .ledger
            .lock()
            .iter()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` settlements were recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.inner.settled.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok();
        reached
    }

    fn record(&self, settlement: Settlement) {
        let total = {
            let mut ledger = self.inner.ledger.lock();
            ledger.push(settlement);
            ledger.len()
        };
        self.inner.settled.send_replace(total);
    }

    fn deliver(&self, envelope: Envelope, requeue_tx: mpsc::UnboundedSender<Envelope>) -> InboundDelivery {
        let delivery_tag = self.inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let flag_only = self.inner.flag_only.load(Ordering::SeqCst);
        let redelivered = envelope.redelivery_count > 0;
        let message_key = envelope.message_id.to_string();
        let delivery = InboundDelivery::new(
            delivery_tag,
            envelope.redelivery_count,
            envelope.headers.clone(),
            envelope.payload.clone(),
            Box::new(MemoryAcker {
                transport: self.clone(),
                envelope,
                requeue_tx,
            }),
        );
        if flag_only {
            delivery
                .with_redelivery(Redelivery::Flagged(redelivered))
                .with_message_key(message_key)
        } else {
            delivery
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        if self.inner.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (rx, tx) = {
            let mut queues = self.inner.queues.lock();
            let entry = queues.entry(queue.to_string()).or_insert_with(Queue::new);
            let rx = entry.rx.take().ok_or_else(|| TransportError::Consume {
                queue: queue.to_string(),
                reason: "queue already has a consumer".to_string(),
            })?;
            (rx, entry.tx.clone())
        };
        debug!(queue, "in-memory consumer attached");

        let state = (rx, tx, self.clone());
        let stream = futures_util::stream::unfold(state, |(mut rx, tx, transport)| async move {
            let closed = transport.inner.closed.clone();
            tokio::select! {
                biased;
                () = closed.cancelled() => None,
                envelope = rx.recv() => {
                    let delivery = transport.deliver(envelope?, tx.clone());
                    Some((Ok(delivery), (rx, tx, transport)))
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.closed.cancel();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }
}

struct MemoryAcker {
    transport: InMemoryTransport,
    envelope: Envelope,
    requeue_tx: mpsc::UnboundedSender<Envelope>,
}

impl MemoryAcker {
    fn settle(&self, delivery_tag: u64, outcome: SettlementOutcome) -> Result<(), TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::Closed);
        }
        self.transport.record(Settlement {
            message_id: self.envelope.message_id,
            delivery_tag,
            redelivery_count: self.envelope.redelivery_count,
            outcome,
        });
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.settle(delivery_tag, SettlementOutcome::Acked)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            return self.settle(delivery_tag, SettlementOutcome::Rejected);
        }
        self.settle(delivery_tag, SettlementOutcome::Requeued)?;
        let mut envelope = self.envelope.clone();
        envelope.redelivery_count += 1;
        self.requeue_tx.send(envelope).map_err(|_| TransportError::Settle {
            delivery_tag,
            reason: "queue consumer is gone".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    fn headers(key: &str) -> DeliveryHeaders {
        [("x-correlation-id", key)].into_iter().collect()
    }

    #[tokio::test]
    async fn published_messages_are_consumed_in_order() {
        let transport = InMemoryTransport::new();
        transport.publish("q", headers("A"), &b"{}"[..]);
        transport.publish("q", headers("B"), &b"{}"[..]);

        let mut stream = transport.consume("q").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.headers().get("x-correlation-id"), Some("A"));
        assert_eq!(second.headers().get("x-correlation-id"), Some("B"));
        assert_eq!(first.redelivery_count(), 0);
    }

    #[tokio::test]
    async fn requeue_redelivers_with_incremented_count() {
        let transport = InMemoryTransport::new();
        let id = transport.publish("q", headers("A"), &b"{}"[..]);
        let mut stream = transport.consume("q").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let first_tag = first.delivery_tag();
        first.reject(true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.redelivery_count(), 1);
        assert_ne!(again.delivery_tag(), first_tag);
        again.ack().await.unwrap();

        let outcomes: Vec<_> = transport.settlements_for(id).into_iter().map(|s| s.outcome).collect();
        assert_eq!(outcomes, vec![SettlementOutcome::Requeued, SettlementOutcome::Acked]);
    }

    #[tokio::test]
    async fn flag_only_mode_caps_reported_count() {
        let transport = InMemoryTransport::new();
        transport.report_flag_only(true);
        let id = transport.publish("q", headers("A"), &b"{}"[..]);
        let mut stream = transport.consume("q").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.redelivery(), Redelivery::Flagged(false));
        first.reject(true).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        second.reject(true).await.unwrap();
        let third = stream.next().await.unwrap().unwrap();

        assert_eq!(third.redelivery(), Redelivery::Flagged(true));
        assert_eq!(third.redelivery_count(), 1);
        assert_eq!(third.message_key(), Some(id.to_string().as_str()));
    }

    #[tokio::test]
    async fn reject_without_requeue_is_final() {
        let transport = InMemoryTransport::new();
        let id = transport.publish("q", headers("A"), &b"{}"[..]);
        let mut stream = transport.consume("q").await.unwrap();
        stream.next().await.unwrap().unwrap().reject(false).await.unwrap();

        assert_eq!(transport.settlements_for(id)[0].outcome, SettlementOutcome::Rejected);
        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err(), "rejected message must not come back");
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let transport = InMemoryTransport::new();
        let mut stream = transport.consume("q").await.unwrap();
        transport.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn second_consumer_is_refused() {
        let transport = InMemoryTransport::new();
        let _stream = transport.consume("q").await.unwrap();
        assert!(matches!(
            transport.consume("q").await,
            Err(TransportError::Consume { .. })
        ));
    }

    #[tokio::test]
    async fn settling_after_close_fails() {
        let transport = InMemoryTransport::new();
        transport.publish("q", headers("A"), &b"{}"[..]);
        let mut stream = transport.consume("q").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        transport.close().await.unwrap();
        assert_eq!(delivery.ack().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn wait_for_settlements_wakes_on_ack() {
        let transport = InMemoryTransport::new();
        transport.publish("q", headers("A"), &b"{}"[..]);
        let mut stream = transport.consume("q").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.wait_for_settlements(1, Duration::from_secs(2)).await })
        };
        delivery.ack().await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
