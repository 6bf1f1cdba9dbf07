// src/handler.rs
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::message::ErrorKind;

/// Failure returned by a [`CommandHandler`]; its message becomes the response body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CommandError {
    kind: ErrorKind,
    message: String,
}

impl CommandError {
    /// A command that could not be carried out (`DATA_HANDLE_ERR`).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DataHandle,
            message: message.into(),
        }
    }

    /// A failure inside the worker itself (`BASE_INTERNAL_ERROR`).
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BaseInternal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Business logic invoked for every decoded request.
///
/// Returning `Ok(None)` answers the caller with `"OK"`. Implementations may
/// block for as long as they need; each message runs on its own task.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Output: Serialize + Send + 'static;

    async fn handle(&self, command: Value) -> Result<Option<Self::Output>, CommandError>;
}
