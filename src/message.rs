// src/message.rs
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::rabbitmq::errors::Result;

/// Header carrying the routing key the caller listens on.
pub const RESPONSE_ROUTING_KEY_HEADER: &str = "responseRoutingKey";

/// Body published for a successful command that produced no result.
pub const OK_BODY: &str = "OK";

/// Error kinds reported to callers in the `name` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BaseInternal,
    DataParse,
    DataHandle,
    DataEncode,
}

impl ErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::BaseInternal => "BASE_INTERNAL_ERROR",
            ErrorKind::DataParse => "DATA_PARSE_ERR",
            ErrorKind::DataHandle => "DATA_HANDLE_ERR",
            ErrorKind::DataEncode => "DATA_ENCODE_ERR",
        }
    }

    /// Non-zero code placed in the `code` response header.
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::BaseInternal => 1,
            ErrorKind::DataParse => 2,
            ErrorKind::DataHandle => 3,
            ErrorKind::DataEncode => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Broker-agnostic view of a message header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Other,
}

/// Acknowledges a delivery once it has been dispatched.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A delivered request, alive for the duration of one dispatch.
#[derive(Clone, Default)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub headers: BTreeMap<String, HeaderValue>,
    /// Present only when the channel consumes with manual acknowledgement.
    pub acker: Option<Arc<dyn Acknowledge>>,
}

impl InboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    pub fn with_response_routing_key(self, routing_key: impl Into<String>) -> Self {
        self.with_header(
            RESPONSE_ROUTING_KEY_HEADER,
            HeaderValue::Text(routing_key.into()),
        )
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledge>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// The `responseRoutingKey` header, when it is a non-empty string.
    pub fn response_routing_key(&self) -> Option<&str> {
        match self.headers.get(RESPONSE_ROUTING_KEY_HEADER) {
            Some(HeaderValue::Text(key)) if !key.is_empty() => Some(key),
            _ => None,
        }
    }

    /// Whether the caller expects a response frame.
    pub fn needs_answer(&self) -> bool {
        !self.correlation_id.is_empty() && self.response_routing_key().is_some()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("body_len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("headers", &self.headers)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// A correlated response, published once per answered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub routing_key: String,
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub error: Option<ErrorKind>,
}

impl ResponseFrame {
    pub fn success(
        routing_key: impl Into<String>,
        correlation_id: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            correlation_id: correlation_id.into(),
            body,
            error: None,
        }
    }

    pub fn failure(
        routing_key: impl Into<String>,
        correlation_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            correlation_id: correlation_id.into(),
            body: message.into().into_bytes(),
            error: Some(kind),
        }
    }

    /// Value of the `code` header; zero on success.
    pub fn code(&self) -> i32 {
        self.error.map_or(0, ErrorKind::code)
    }

    /// Value of the `name` header; only set for errors.
    pub fn name(&self) -> Option<&'static str> {
        self.error.map(ErrorKind::name)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn content_type(&self) -> &'static str {
        if self.is_error() {
            "text/plain"
        } else {
            "application/json"
        }
    }
}
