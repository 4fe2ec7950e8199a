//! Attempt counting for transports that only flag redeliveries.
//!
//! A classic AMQP queue marks a repeat delivery as `redelivered` without
//! saying how many times it came back, so the redelivery ceiling could never
//! be reached from the flag alone. The tracker counts attempts per message
//! key in a bounded `DashMap` and forgets a key once its message is settled
//! for good.

use std::hash::{DefaultHasher, Hash, Hasher};

use dashmap::DashMap;
use tracing::debug;

use crate::dispatch::Disposition;
use crate::transport::{InboundDelivery, Redelivery};

/// Keys tracked before arbitrary entries start being evicted.
pub const DEFAULT_TRACKING_CAPACITY: usize = 10_000;

/// Redelivery count of one delivery and the key it is tracked under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub redelivery_count: u32,
    key: Option<String>,
}

/// Per-message attempt counter.
#[derive(Debug)]
pub struct RedeliveryTracker {
    attempts: DashMap<String, u32>,
    capacity: usize,
}

impl RedeliveryTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            attempts: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Redelivery count to classify `delivery` with.
    ///
    /// Exact counts pass through. For a flagged delivery the count is the
    /// number of redeliveries this process has seen for its key, and at least
    /// 1 when the transport flagged it.
    pub fn observe(&self, delivery: &InboundDelivery) -> Attempt {
        match delivery.redelivery() {
            Redelivery::Counted(n) => Attempt {
                redelivery_count: n,
                key: None,
            },
            Redelivery::Flagged(redelivered) => {
                let key = tracking_key(delivery);
                let redelivery_count = if redelivered {
                    self.bump(&key)
                } else {
                    self.attempts.remove(&key);
                    0
                };
                Attempt {
                    redelivery_count,
                    key: Some(key),
                }
            }
        }
    }

    /// Forgets the key unless the message is coming back.
    pub fn settled(&self, attempt: &Attempt, disposition: Disposition) {
        if disposition == Disposition::Requeue {
            return;
        }
        if let Some(key) = &attempt.key {
            self.attempts.remove(key);
        }
    }

    /// Keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn bump(&self, key: &str) -> u32 {
        if !self.attempts.contains_key(key) && self.attempts.len() >= self.capacity {
            let victim = self.attempts.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                debug!(key = %victim, "redelivery tracker full, evicting");
                self.attempts.remove(&victim);
            }
        }
        let mut count = self.attempts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKING_CAPACITY)
    }
}

/// The transport's message key, or a digest of headers and payload.
fn tracking_key(delivery: &InboundDelivery) -> String {
    if let Some(key) = delivery.message_key() {
        return key.to_string();
    }
    let mut hasher = DefaultHasher::new();
    for header in delivery.headers().iter() {
        header.hash(&mut hasher);
    }
    delivery.payload().hash(&mut hasher);
    format!("digest:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use b2b_router_core::DeliveryHeaders;
    use bytes::Bytes;

    use super::*;
    use crate::transport::{Acknowledger, TransportError};

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            Ok(())
        }

        async fn reject(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn flagged(key: Option<&str>, redelivered: bool) -> InboundDelivery {
        let delivery = InboundDelivery::new(
            1,
            u32::from(redelivered),
            DeliveryHeaders::new(),
            Bytes::from_static(br#"{"a":1}"#),
            Box::new(NoopAcker),
        )
        .with_redelivery(Redelivery::Flagged(redelivered));
        match key {
            Some(key) => delivery.with_message_key(key),
            None => delivery,
        }
    }

    #[test]
    fn exact_counts_pass_through_untracked() {
        let tracker = RedeliveryTracker::default();
        let delivery = InboundDelivery::new(1, 4, DeliveryHeaders::new(), Bytes::new(), Box::new(NoopAcker));
        assert_eq!(tracker.observe(&delivery).redelivery_count, 4);
        assert!(tracker.is_empty());
    }

    #[test]
    fn flagged_redeliveries_keep_counting() {
        let tracker = RedeliveryTracker::default();
        assert_eq!(tracker.observe(&flagged(Some("m-1"), false)).redelivery_count, 0);
        assert_eq!(tracker.observe(&flagged(Some("m-1"), true)).redelivery_count, 1);
        assert_eq!(tracker.observe(&flagged(Some("m-1"), true)).redelivery_count, 2);
        assert_eq!(tracker.observe(&flagged(Some("m-1"), true)).redelivery_count, 3);
        assert_eq!(tracker.observe(&flagged(Some("m-2"), true)).redelivery_count, 1);
    }

    #[test]
    fn first_delivery_resets_a_reused_key() {
        let tracker = RedeliveryTracker::default();
        tracker.observe(&flagged(Some("m-1"), true));
        tracker.observe(&flagged(Some("m-1"), true));
        assert_eq!(tracker.observe(&flagged(Some("m-1"), false)).redelivery_count, 0);
        assert_eq!(tracker.observe(&flagged(Some("m-1"), true)).redelivery_count, 1);
    }

    #[test]
    fn final_settlement_forgets_the_key() {
        let tracker = RedeliveryTracker::default();
        let attempt = tracker.observe(&flagged(Some("m-1"), true));
        tracker.settled(&attempt, Disposition::Requeue);
        assert_eq!(tracker.len(), 1);
        tracker.settled(&attempt, Disposition::Poison);
        assert!(tracker.is_empty());
    }

    #[test]
    fn keyless_deliveries_are_tracked_by_content() {
        let tracker = RedeliveryTracker::default();
        tracker.observe(&flagged(None, true));
        assert_eq!(tracker.observe(&flagged(None, true)).redelivery_count, 2);
    }

    #[test]
    fn capacity_bounds_the_map() {
        let tracker = RedeliveryTracker::new(2);
        for key in ["a", "b", "c", "d"] {
            tracker.observe(&flagged(Some(key), true));
        }
        assert_eq!(tracker.len(), 2);
    }
}
