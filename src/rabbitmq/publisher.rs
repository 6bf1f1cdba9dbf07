use tracing::{debug, warn};

use super::amqp_client::BrokerChannel;
use crate::message::ResponseFrame;

const PREVIEW_CHARS: usize = 256;

/// Publishes response frames to `<queue>.response`. Best effort: failures are
/// logged and the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePublisher {
    exchange: String,
}

impl ResponsePublisher {
    pub fn new(queue_name: &str) -> Self {
        Self {
            exchange: format!("{}.response", queue_name),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish<Ch: BrokerChannel>(&self, channel: &Ch, frame: &ResponseFrame) {
        match channel.publish(&self.exchange, frame).await {
            Ok(()) => debug!(
                exchange = %self.exchange,
                routing_key = %frame.routing_key,
                code = frame.code(),
                "Sent response"
            ),
            Err(err) => warn!(
                exchange = %self.exchange,
                routing_key = %frame.routing_key,
                correlation_id = %frame.correlation_id,
                body = %body_preview(&frame.body),
                error = %err,
                "Failed to publish response"
            ),
        }
    }
}

/// JSON-escaped, truncated rendering of a body for log lines.
pub fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().nth(PREVIEW_CHARS).is_some() {
        preview.push('…');
    }
    serde_json::to_string(&preview).unwrap_or_default()
}
