//! AMQP (RabbitMQ) broker implementation.
//!
//! Connections come from a `deadpool-lapin` pool; each `open_channel` call
//! creates a fresh channel with publisher confirms enabled, so `publish`
//! returns only after the broker has taken responsibility for the message.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use tracing::{debug, info, warn};

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerError, ConsumeOptions, Delivery, DeliveryStream,
    Envelope, ExchangeKind, QueueHandle, QueueOptions, Result,
};

/// Reply code for a normal channel shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Map a lapin error, keeping connection-level faults distinguishable.
fn lapin_error(e: lapin::Error, wrap: fn(String) -> BrokerError, context: &str) -> BrokerError {
    match &e {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Connection(format!("{}: {}", context, e))
        }
        lapin::Error::InvalidChannelState(_) => BrokerError::Channel(format!("{}: {}", context, e)),
        _ => wrap(format!("{}: {}", context, e)),
    }
}

/// AMQP broker backed by a connection pool.
pub struct AmqpBroker {
    pool: Pool,
}

impl AmqpBroker {
    /// Connect to the broker and verify the connection.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(pool_size, "Connected to AMQP");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| lapin_error(e, BrokerError::Channel, "Failed to create channel"))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| lapin_error(e, BrokerError::Channel, "Failed to enable confirms"))?;

        debug!(channel = channel.id(), "Opened AMQP channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        info!("AMQP connection pool closed");
        Ok(())
    }
}

/// A lapin channel. Dropping it schedules a close on the current runtime.
pub struct AmqpChannel {
    channel: Channel,
}

/// AMQP `delivery-mode` value that asks the broker to write the message to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Build AMQP properties from an envelope.
fn envelope_properties(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if envelope.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(content_type) = &envelope.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    properties
}

/// Rebuild an envelope from AMQP properties and body.
fn envelope_from_parts(properties: &BasicProperties, data: Vec<u8>) -> Envelope {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    Envelope {
        payload: Bytes::from(data),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        content_type: text(properties.content_type()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| lapin_error(e, BrokerError::Declare, "Failed to declare queue"))?;

        debug!(queue = %queue.name().as_str(), ?options, "Declared queue");
        Ok(QueueHandle::new(queue.name().as_str()))
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| lapin_error(e, BrokerError::Declare, "Failed to declare exchange"))
    }

    async fn bind_queue(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue.name(),
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| lapin_error(e, BrokerError::Declare, "Failed to bind queue"))?;

        info!(
            queue = %queue.name(),
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| lapin_error(e, BrokerError::Channel, "Failed to set QoS"))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        let properties = envelope_properties(&envelope);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties,
            )
            .await
            .map_err(|e| lapin_error(e, BrokerError::Publish, "Failed to publish"))?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(BrokerError::Publish(
                "Broker refused the message".to_string(),
            )),
            Ok(_) => {
                debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
                Ok(())
            }
            Err(e) => Err(lapin_error(
                e,
                BrokerError::Publish,
                "Publish confirmation failed",
            )),
        }
    }

    async fn consume(
        &self,
        queue: &QueueHandle,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer_tag = format!("courier-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue.name(),
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| lapin_error(e, BrokerError::Consume, "Failed to start consumer"))?;
        debug!(queue = %queue.name(), consumer_tag = %consumer_tag, "Started consumer");

        let auto_ack = options.auto_ack;
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => {
                let envelope = envelope_from_parts(&delivery.properties, delivery.data);
                let acker: Option<Box<dyn Acknowledger>> = if auto_ack {
                    None
                } else {
                    Some(Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }))
                };
                Ok(Delivery::new(envelope, delivery.redelivered, acker))
            }
            Err(e) => Err(lapin_error(e, BrokerError::Consume, "Consumer delivery error")),
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| lapin_error(e, BrokerError::Channel, "Failed to close channel"))
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
                        debug!(error = %e, "Channel close on drop failed");
                    }
                });
            }
            Err(_) => warn!("AMQP channel dropped outside a runtime; left open"),
        }
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| lapin_error(e, BrokerError::Ack, "Failed to ack message"))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| lapin_error(e, BrokerError::Ack, "Failed to reject message"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_carry_correlation_fields() {
        let envelope = Envelope::text(10)
            .with_correlation_id("K7pQ")
            .with_reply_to("amq.gen-abc");

        let properties = envelope_properties(&envelope);
        let rebuilt = envelope_from_parts(&properties, b"10".to_vec());

        assert_eq!(rebuilt, envelope);
    }

    #[test]
    fn test_missing_properties_stay_empty() {
        let rebuilt = envelope_from_parts(&BasicProperties::default(), b"hello".to_vec());

        assert_eq!(rebuilt.correlation_id, None);
        assert_eq!(rebuilt.reply_to, None);
        assert!(!rebuilt.persistent);
        assert_eq!(&rebuilt.payload[..], b"hello");
    }

    #[test]
    fn test_persistent_envelope_sets_delivery_mode() {
        let envelope = Envelope::new("disk full").persistent();

        let properties = envelope_properties(&envelope);

        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(envelope_from_parts(&properties, b"disk full".to_vec()), envelope);
        assert_eq!(*envelope_properties(&Envelope::text(1)).delivery_mode(), None);
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(
            to_lapin_kind(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
    }
}
