// In-memory broker used by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use timeseries_worker::handler::{CommandError, CommandHandler};
use timeseries_worker::message::{Acknowledge, InboundMessage, ResponseFrame};
use timeseries_worker::rabbitmq::{
    BrokerChannel, BrokerConnection, BrokerError, DeliveryStream, Result,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub frame: ResponseFrame,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub queue: String,
    pub tag: String,
    pub auto_ack: bool,
}

#[derive(Default)]
struct State {
    channel_failures: u32,
    open_attempts: u32,
    fail_declare: bool,
    fail_consume: bool,
    fail_publish: bool,
    declared: Vec<String>,
    prefetch: Vec<u16>,
    consumers: Vec<Consumer>,
    closed_channels: usize,
    published: Vec<Published>,
    deliveries: Vec<mpsc::UnboundedSender<Result<InboundMessage>>>,
}

/// Connection, channels and queue in one shared, inspectable state.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
    published_count: Arc<watch::Sender<usize>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            published_count: Arc::new(watch::channel(0).0),
        }
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` channel opens fail.
    pub fn failing_channel_opens(self, count: u32) -> Self {
        self.lock().channel_failures = count;
        self
    }

    pub fn failing_queue_declare(self) -> Self {
        self.lock().fail_declare = true;
        self
    }

    pub fn failing_consume(self) -> Self {
        self.lock().fail_consume = true;
        self
    }

    pub fn failing_publish(self) -> Self {
        self.lock().fail_publish = true;
        self
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    pub fn declared(&self) -> Vec<String> {
        self.lock().declared.clone()
    }

    pub fn prefetch(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    pub fn consumers(&self) -> Vec<Consumer> {
        self.lock().consumers.clone()
    }

    pub fn closed_channels(&self) -> usize {
        self.lock().closed_channels
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Push a message to the consumer of channel `index`.
    pub fn deliver(&self, index: usize, message: InboundMessage) {
        let state = self.lock();
        let sender = state
            .deliveries
            .get(index)
            .expect("no consumer on that channel");
        sender.send(Ok(message)).expect("consumer stream dropped");
    }

    pub fn deliver_error(&self, index: usize, error: BrokerError) {
        let state = self.lock();
        state.deliveries[index]
            .send(Err(error))
            .expect("consumer stream dropped");
    }

    /// End every consumer stream, as a closing connection would.
    pub fn disconnect(&self) {
        self.lock().deliveries.clear();
    }

    /// Wait until at least `count` frames were published.
    pub async fn wait_for_published(&self, count: usize) -> Vec<Published> {
        let mut rx = self.published_count.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for responses")
            .expect("publish counter dropped");
        self.published()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake broker state poisoned")
    }
}

#[async_trait]
impl BrokerConnection for FakeBroker {
    type Channel = FakeChannel;

    async fn create_channel(&self) -> Result<FakeChannel> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.channel_failures > 0 {
            state.channel_failures -= 1;
            return Err(BrokerError::ChannelError("connection hiccup".to_string()));
        }
        Ok(FakeChannel {
            broker: self.clone(),
        })
    }
}

#[derive(Clone)]
pub struct FakeChannel {
    broker: FakeBroker,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.broker.lock();
        if state.fail_declare {
            return Err(BrokerError::QueueError("access refused".to_string()));
        }
        state.declared.push(queue.to_string());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.broker.lock().prefetch.push(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, auto_ack: bool) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        if state.fail_consume {
            return Err(BrokerError::ConsumeError("consumer refused".to_string()));
        }
        state.consumers.push(Consumer {
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            auto_ack,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        state.deliveries.push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn publish(&self, exchange: &str, frame: &ResponseFrame) -> Result<()> {
        let count = {
            let mut state = self.broker.lock();
            if state.fail_publish {
                None
            } else {
                state.published.push(Published {
                    exchange: exchange.to_string(),
                    frame: frame.clone(),
                });
                Some(state.published.len())
            }
        };
        match count {
            Some(count) => {
                self.broker.published_count.send_replace(count);
                Ok(())
            }
            None => Err(BrokerError::PublishError("channel closed".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().closed_channels += 1;
        Ok(())
    }
}

/// Counts acknowledgements.
#[derive(Default)]
pub struct CountingAcker {
    pub acks: AtomicUsize,
}

impl CountingAcker {
    pub fn count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledge for CountingAcker {
    async fn ack(&self) -> Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler driven by the request itself:
/// `{"sleep_ms": n, "reply": v}` answers `v` after `n` ms,
/// `{"fail": "msg"}` fails with `msg`, `{"panic": "msg"}` panics with `msg`.
pub struct ScriptedHandler {
    pub calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Yield until the handler has run `count` times.
    pub async fn wait_for_calls(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for handler calls");
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    type Output = Value;

    async fn handle(&self, command: Value) -> std::result::Result<Option<Value>, CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ms) = command.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(message) = command.get("panic").and_then(Value::as_str) {
            panic!("{}", message);
        }
        if let Some(message) = command.get("fail").and_then(Value::as_str) {
            return Err(CommandError::new(message));
        }
        Ok(command.get("reply").cloned())
    }
}
