// src/rabbitmq/amqp_client.rs
//
// Broker seams used by the channel pool and the dispatcher, and their lapin
// implementations.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection};

use super::errors::{BrokerError, Result};
use crate::message::{Acknowledge, HeaderValue, InboundMessage, ResponseFrame};

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// A connection that can open channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel>;
}

/// A channel multiplexed over a [`BrokerConnection`].
///
/// Clones share the same underlying channel; `publish` may be called from
/// many tasks at once.
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Declare a durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start consuming. With `auto_ack` deliveries carry no acker.
    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool)
        -> Result<DeliveryStream>;

    async fn publish(&self, exchange: &str, frame: &ResponseFrame) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub struct AmqpConnection {
    connection: Connection,
}

impl AmqpConnection {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(0, "Worker shutting down")
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to create channel: {}", e)))?;
        Ok(AmqpChannel { channel })
    }
}

#[derive(Clone)]
pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::QueueError(format!("Failed to declare queue: {}", e)))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeError(format!("Failed to create consumer: {}", e)))?;

        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|delivery| inbound_message(delivery, auto_ack))
                    .map_err(|e| BrokerError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn publish(&self, exchange: &str, frame: &ResponseFrame) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert("code".into(), AMQPValue::LongInt(frame.code()));
        if let Some(name) = frame.name() {
            headers.insert("name".into(), AMQPValue::LongString(name.to_string().into()));
        }

        let properties = BasicProperties::default()
            .with_correlation_id(frame.correlation_id.clone().into())
            .with_content_type(frame.content_type().into())
            .with_headers(headers);

        self.channel
            .basic_publish(
                exchange,
                &frame.routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &frame.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(0, "Closing worker channel")
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }
}

fn inbound_message(delivery: Delivery, auto_ack: bool) -> InboundMessage {
    let Delivery {
        data,
        properties,
        acker,
        ..
    } = delivery;

    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();

    let headers = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), header_value(value)))
                .collect()
        })
        .unwrap_or_default();

    let acker: Option<Arc<dyn Acknowledge>> = if auto_ack {
        None
    } else {
        Some(Arc::new(LapinAcker(acker)))
    };

    InboundMessage {
        body: data,
        correlation_id,
        headers,
        acker,
    }
}

fn header_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::LongString(text) => {
            HeaderValue::Text(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::ShortString(text) => HeaderValue::Text(text.as_str().to_string()),
        AMQPValue::Boolean(flag) => HeaderValue::Bool(*flag),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        _ => HeaderValue::Other,
    }
}
