//! RabbitMQ request/response worker for time-series commands.
//!
//! Callers publish a JSON command carrying a correlation id and a
//! `responseRoutingKey` header. The worker consumes the command on one of
//! several channels, hands it to a [`handler::CommandHandler`] and publishes a
//! correlated [`message::ResponseFrame`] to the `<queue>.response` exchange.

pub mod env;
pub mod handler;
pub mod message;
pub mod rabbitmq;
pub mod timeseries;
