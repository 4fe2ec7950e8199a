//! AMQP 0.9.1 [`Transport`] on `lapin`.
//!
//! One connection and one channel per transport. Prefetch bounds how many
//! unsettled deliveries the broker pushes. The redelivery count comes from
//! the quorum-queue `x-delivery-count` header when present. Classic queues
//! only set the `redelivered` flag; those deliveries are reported as
//! [`Redelivery::Flagged`] with the message id (or correlation id) as their
//! key so the consumer can count attempts itself.

use async_trait::async_trait;
use b2b_router_core::message::{DEFAULT_CORRELATION_HEADER, DEFAULT_DISCRIMINATOR_HEADER};
use b2b_router_core::DeliveryHeaders;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{info, warn};

use super::tls::TlsMaterial;
use super::{Acknowledger, DeliveryStream, InboundDelivery, Redelivery, Transport, TransportError};
use crate::config::AmqpSettings;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Broker connection plus a consuming channel.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    consumer_tag: String,
}

impl AmqpTransport {
    /// Connects, opens a channel and applies the prefetch limit.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` if the broker is unreachable, the
    /// TLS handshake fails or the channel cannot be configured.
    pub async fn connect(settings: &AmqpSettings, tls: Option<&TlsMaterial>) -> Result<Self, TransportError> {
        let properties =
            ConnectionProperties::default().with_connection_name(settings.connection_name.clone().into());

        let connection = match tls {
            Some(material) => {
                let tls_config = OwnedTLSConfig {
                    identity: None,
                    cert_chain: Some(material.ca_chain_pem().to_string()),
                };
                Connection::connect_with_config(&settings.url, properties, tls_config).await
            }
            None => Connection::connect(&settings.url, properties).await,
        }
        .map_err(|e| TransportError::Connection(format!("AMQP connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("AMQP channel creation failed: {e}")))?;
        channel
            .basic_qos(settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("failed to set prefetch: {e}")))?;

        let consumer_tag = settings
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", settings.connection_name, uuid::Uuid::new_v4()));

        info!(
            connection_name = %settings.connection_name,
            prefetch = settings.prefetch_count,
            tls = tls.is_some(),
            "AMQP transport connected"
        );
        Ok(Self {
            connection,
            channel,
            consumer_tag,
        })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        info!(queue, consumer_tag = %self.consumer_tag, "AMQP consumer started");

        let stream = consumer.map(|result| {
            result
                .map(into_inbound)
                .map_err(|e| TransportError::Connection(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "router shutting down")
            .await
            .map_err(|e| TransportError::Connection(format!("AMQP close failed: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    let mut headers = DeliveryHeaders::new();
    let mut delivery_count = None;

    if let Some(table) = delivery.properties.headers() {
        for (name, value) in table.inner() {
            if name.as_str().eq_ignore_ascii_case(DELIVERY_COUNT_HEADER) {
                delivery_count = header_number(value);
            }
            if let Some(text) = header_text(value) {
                headers.insert(name.as_str(), text);
            }
        }
    }
    if let Some(correlation_id) = delivery.properties.correlation_id() {
        headers.insert_if_absent(DEFAULT_CORRELATION_HEADER, correlation_id.as_str());
    }
    if let Some(kind) = delivery.properties.kind() {
        headers.insert_if_absent(DEFAULT_DISCRIMINATOR_HEADER, kind.as_str());
    }

    let redelivery = match delivery_count {
        Some(count) => Redelivery::Counted(u32::try_from(count).unwrap_or(u32::MAX)),
        None => Redelivery::Flagged(delivery.redelivered),
    };
    let message_key = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .or_else(|| headers.get(DEFAULT_CORRELATION_HEADER).map(str::to_string));

    let inbound = InboundDelivery::new(
        delivery.delivery_tag,
        redelivery.known_count(),
        headers,
        Bytes::from(delivery.data),
        Box::new(AmqpAcker(delivery.acker)),
    )
    .with_redelivery(redelivery);
    match message_key {
        Some(key) => inbound.with_message_key(key),
        None => inbound,
    }
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        other => header_number(other).map(|n| n.to_string()),
    }
}

fn header_number(value: &AMQPValue) -> Option<i64> {
    match *value {
        AMQPValue::ShortShortInt(n) => Some(i64::from(n)),
        AMQPValue::ShortShortUInt(n) => Some(i64::from(n)),
        AMQPValue::ShortInt(n) => Some(i64::from(n)),
        AMQPValue::ShortUInt(n) => Some(i64::from(n)),
        AMQPValue::LongInt(n) => Some(i64::from(n)),
        AMQPValue::LongUInt(n) => Some(i64::from(n)),
        AMQPValue::LongLongInt(n) => Some(n),
        _ => None,
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(drop)
            .map_err(|e| TransportError::Settle {
                delivery_tag,
                reason: format!("ack failed: {e}"),
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        if !requeue {
            warn!(delivery_tag, "rejecting delivery without requeue");
        }
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(drop)
            .map_err(|e| TransportError::Settle {
                delivery_tag,
                reason: format!("reject failed: {e}"),
            })
    }
}
