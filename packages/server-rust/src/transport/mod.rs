//! Queue transport: where inbound deliveries come from and how they are
//! settled.
//!
//! An [`InboundDelivery`] is settled by value: [`ack`](InboundDelivery::ack)
//! and [`reject`](InboundDelivery::reject) consume it, so no delivery can be
//! acknowledged twice or both acknowledged and rejected.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod tls;

use std::fmt;

use async_trait::async_trait;
use b2b_router_core::DeliveryHeaders;
use bytes::Bytes;
use futures_util::stream::BoxStream;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::{InMemoryTransport, Settlement, SettlementOutcome};
pub use tls::TlsMaterial;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection failed: {0}")]
    Connection(String),
    #[error("TLS configuration invalid: {0}")]
    Tls(String),
    #[error("could not consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },
    #[error("could not settle delivery {delivery_tag}: {reason}")]
    Settle { delivery_tag: u64, reason: String },
    #[error("transport is closed")]
    Closed,
}

/// Unbounded sequence of deliveries; ends when the transport closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, TransportError>>;

/// A queue connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts consuming `queue`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Consume` if the queue cannot be consumed.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError>;

    /// Closes the connection; open delivery streams end.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` if the close handshake fails.
    async fn close(&self) -> Result<(), TransportError>;

    /// `true` while the connection is usable.
    fn is_connected(&self) -> bool;
}

/// Settles deliveries on behalf of a transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

/// What the transport knows about earlier deliveries of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Exact number of earlier deliveries, e.g. from `x-delivery-count`.
    Counted(u32),
    /// Only whether the message was delivered before.
    Flagged(bool),
}

impl Redelivery {
    /// Earlier deliveries known for certain.
    #[must_use]
    pub fn known_count(self) -> u32 {
        match self {
            Self::Counted(n) => n,
            Self::Flagged(redelivered) => u32::from(redelivered),
        }
    }
}

/// One message pulled from the transport, owned until settled.
pub struct InboundDelivery {
    delivery_tag: u64,
    redelivery: Redelivery,
    message_key: Option<String>,
    headers: DeliveryHeaders,
    payload: Bytes,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    /// A delivery whose earlier deliveries are counted exactly.
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        redelivery_count: u32,
        headers: DeliveryHeaders,
        payload: Bytes,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivery: Redelivery::Counted(redelivery_count),
            message_key: None,
            headers,
            payload,
            acker,
        }
    }

    #[must_use]
    pub fn with_redelivery(mut self, redelivery: Redelivery) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Identity that stays the same across redeliveries of this message.
    #[must_use]
    pub fn with_message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Times this message was delivered before (0 on first delivery), as far
    /// as the transport knows. A flag-only transport never reports more
    /// than 1.
    #[must_use]
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery.known_count()
    }

    #[must_use]
    pub fn redelivery(&self) -> Redelivery {
        self.redelivery
    }

    #[must_use]
    pub fn message_key(&self) -> Option<&str> {
        self.message_key.as_deref()
    }

    #[must_use]
    pub fn headers(&self) -> &DeliveryHeaders {
        &self.headers
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Removes the message from the queue.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Settle` or `Closed` if the transport refused.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Rejects the message, optionally asking the broker to redeliver it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Settle` or `Closed` if the transport refused.
    pub async fn reject(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivery", &self.redelivery)
            .field("message_key", &self.message_key)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}
