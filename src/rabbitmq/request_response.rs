use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info_span, warn, Instrument};

use super::amqp_client::BrokerChannel;
use super::publisher::ResponsePublisher;
use crate::handler::CommandHandler;
use crate::message::{ErrorKind, InboundMessage, ResponseFrame, OK_BODY};

const PARSE_ERROR_MESSAGE: &str = "cannot parse request body as JSON";

/// Why a request did not produce a success body.
#[derive(Debug)]
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Runs one delivered request through the handler and answers it.
pub struct Dispatcher<H> {
    handler: Arc<H>,
    publisher: ResponsePublisher,
}

impl<H: CommandHandler> Dispatcher<H> {
    pub fn new(handler: Arc<H>, queue_name: &str) -> Self {
        Self {
            handler,
            publisher: ResponsePublisher::new(queue_name),
        }
    }

    pub fn publisher(&self) -> &ResponsePublisher {
        &self.publisher
    }

    /// Process `message`, publish its response if one was requested, then
    /// acknowledge it when the channel consumes with manual acks.
    pub async fn dispatch<Ch: BrokerChannel>(&self, channel: &Ch, message: InboundMessage) {
        let span = info_span!("dispatch", correlation_id = %message.correlation_id);
        async {
            if let Some(frame) = self.respond(&message).await {
                self.publisher.publish(channel, &frame).await;
            }
            if let Some(acker) = &message.acker {
                if let Err(err) = acker.ack().await {
                    warn!(error = %err, "Failed to acknowledge message");
                }
            }
        }
        .instrument(span)
        .await
    }

    /// The frame to publish for `message`, or `None` when the caller did not
    /// ask for an answer. The handler runs either way unless the body is not JSON.
    pub async fn respond(&self, message: &InboundMessage) -> Option<ResponseFrame> {
        let outcome = self.process(&message.body).await;

        let Some(routing_key) = message.response_routing_key().filter(|_| message.needs_answer())
        else {
            match &outcome {
                Ok(_) => debug!("No response requested, result discarded"),
                Err(failure) => warn!(
                    kind = %failure.kind,
                    error = %failure.message,
                    "No response requested, failure discarded"
                ),
            }
            return None;
        };

        let frame = match outcome {
            Ok(body) => ResponseFrame::success(routing_key, &message.correlation_id, body),
            Err(failure) => ResponseFrame::failure(
                routing_key,
                &message.correlation_id,
                failure.kind,
                failure.message,
            ),
        };
        Some(frame)
    }

    async fn process(&self, body: &[u8]) -> Result<Vec<u8>, Failure> {
        let command: Value = serde_json::from_slice(body).map_err(|err| {
            debug!(error = %err, "Failed to parse request body");
            Failure::new(ErrorKind::DataParse, PARSE_ERROR_MESSAGE)
        })?;

        // A panicking handler must still be answered and acknowledged
        let result = AssertUnwindSafe(self.handler.handle(command))
            .catch_unwind()
            .await
            .map_err(|payload| {
                let message = panic_message(&*payload);
                error!(error = %message, "Command handler panicked");
                Failure::new(
                    ErrorKind::BaseInternal,
                    format!("command handler panicked: {}", message),
                )
            })?
            .map_err(|err| Failure::new(err.kind(), err.message()))?;

        encode_result(result)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A missing result and one that encodes to `null` both answer `"OK"`.
fn encode_result<T: Serialize>(result: Option<T>) -> Result<Vec<u8>, Failure> {
    let encoded = match result {
        Some(value) => serde_json::to_vec(&value).and_then(|body| {
            if body == b"null" {
                serde_json::to_vec(OK_BODY)
            } else {
                Ok(body)
            }
        }),
        None => serde_json::to_vec(OK_BODY),
    };
    encoded.map_err(|err| Failure::new(ErrorKind::DataEncode, err.to_string()))
}
