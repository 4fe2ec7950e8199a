//! Delivery settlement: maps a dispatch result to what the transport is told.

use super::binding::{DispatchError, Dispatched};

/// How a delivery is settled with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dispatched (or recognised as a duplicate); remove from the queue.
    Ack,
    /// Malformed; reject without requeue.
    Reject,
    /// Transient failure; reject with requeue for another attempt.
    Requeue,
    /// Transient failure past the redelivery ceiling; reject without requeue
    /// and raise a poison-message event.
    Poison,
}

impl Disposition {
    /// Value of the transport's `requeue` flag for a rejection.
    #[must_use]
    pub fn requeue(self) -> bool {
        matches!(self, Self::Requeue)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject => "reject",
            Self::Requeue => "requeue",
            Self::Poison => "poison",
        }
    }
}

/// Settles a dispatch result.
///
/// `redelivery_count` is how many times the transport already delivered this
/// message before (0 on first delivery). A retryable failure whose
/// redelivery count has reached `max_redeliveries` is poison. Errors that are
/// neither malformed nor transient are retried under the same ceiling.
#[must_use]
pub fn classify(
    result: &Result<Dispatched, DispatchError>,
    redelivery_count: u32,
    max_redeliveries: u32,
) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) if e.is_malformed() => Disposition::Reject,
        Err(_) if redelivery_count >= max_redeliveries => Disposition::Poison,
        Err(_) => Disposition::Requeue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> Result<Dispatched, DispatchError> {
        Ok(Dispatched {
            instance_id: "K".into(),
            workflow: "wf".into(),
            duplicate: false,
        })
    }

    #[test]
    fn success_and_duplicates_ack() {
        assert_eq!(classify(&ok(), 0, 5), Disposition::Ack);
        let duplicate = Ok(Dispatched {
            instance_id: "K".into(),
            workflow: "wf".into(),
            duplicate: true,
        });
        assert_eq!(classify(&duplicate, 3, 5), Disposition::Ack);
    }

    #[test]
    fn malformed_input_is_rejected_without_requeue() {
        for err in [
            DispatchError::UnknownWorkflow("X".into()),
            DispatchError::PayloadParse("eof".into()),
            DispatchError::MissingCorrelationKey,
        ] {
            let d = classify(&Err(err), 0, 5);
            assert_eq!(d, Disposition::Reject);
            assert!(!d.requeue());
        }
    }

    #[test]
    fn transient_failures_requeue_until_ceiling() {
        let err = || Err(DispatchError::BackendUnavailable("down".into()));
        assert_eq!(classify(&err(), 0, 2), Disposition::Requeue);
        assert_eq!(classify(&err(), 1, 2), Disposition::Requeue);
        assert_eq!(classify(&err(), 2, 2), Disposition::Poison);
        assert!(!Disposition::Poison.requeue());

        let timeout = Err(DispatchError::Timeout { timeout_ms: 10 });
        assert_eq!(classify(&timeout, 0, 2), Disposition::Requeue);
    }

    #[test]
    fn malformed_never_becomes_poison() {
        let err = Err(DispatchError::MissingCorrelationKey);
        assert_eq!(classify(&err, 100, 2), Disposition::Reject);
    }

    #[test]
    fn internal_errors_are_retried_under_ceiling() {
        let err = || Err(DispatchError::Internal("db".into()));
        assert_eq!(classify(&err(), 0, 1), Disposition::Requeue);
        assert_eq!(classify(&err(), 1, 1), Disposition::Poison);
    }
}
