// src/rabbitmq/errors.rs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ queue error: {0}")]
    QueueError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("TLS configuration error: {0}")]
    TlsError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, BrokerError>;
