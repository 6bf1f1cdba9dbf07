// src/rabbitmq/mod.rs
// RabbitMQ request/response layer

pub mod amqp_client;
pub mod channel_manager;
pub mod connection;
pub mod errors;
pub mod publisher;
pub mod request_response;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, AmqpConnection, BrokerChannel, BrokerConnection, DeliveryStream};
pub use channel_manager::{
    AckMode, ChannelPool, FixedBackoff, PoolSettings, RetryStrategy, SlotHandle, SlotState,
    wait_all_closed,
};
pub use connection::{ConnectionManager, ConnectionSettings, TlsMode};
pub use errors::{BrokerError, Result};
pub use publisher::ResponsePublisher;
pub use request_response::Dispatcher;
