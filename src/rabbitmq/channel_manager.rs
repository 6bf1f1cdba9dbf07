use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{BrokerChannel, BrokerConnection, DeliveryStream};
use super::errors::Result;
use super::request_response::Dispatcher;
use crate::handler::CommandHandler;

pub const DEFAULT_QUEUE_NAME: &str = "timeseries";
pub const DEFAULT_CHANNEL_COUNT: usize = 10;
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;
pub const DEFAULT_CHANNEL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// When a delivery is acknowledged to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Broker-side auto-ack. A crash mid-dispatch loses the message.
    #[default]
    OnDelivery,
    /// Manual ack once the response has been published or dropped.
    AfterDispatch,
}

#[derive(Debug, Error)]
#[error("unknown ack mode {0:?}, expected \"on_delivery\" or \"after_dispatch\"")]
pub struct ParseAckModeError(String);

impl FromStr for AckMode {
    type Err = ParseAckModeError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on_delivery" | "auto" => Ok(AckMode::OnDelivery),
            "after_dispatch" | "manual" => Ok(AckMode::AfterDispatch),
            _ => Err(ParseAckModeError(value.to_string())),
        }
    }
}

/// Decides whether and when a failed channel open is retried.
pub trait RetryStrategy: Send + Sync + 'static {
    /// Delay before retry number `attempt` (starting at 1), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// The same delay between every attempt, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_RETRY_DELAY)
    }
}

impl RetryStrategy for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub queue_name: String,
    pub channel_count: usize,
    pub ack_mode: AckMode,
    /// Only applied with [`AckMode::AfterDispatch`].
    pub prefetch_count: u16,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            channel_count: DEFAULT_CHANNEL_COUNT,
            ack_mode: AckMode::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

/// Lifecycle of one pool slot. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Created,
    ChannelOpen,
    QueueDeclared,
    Consuming,
    Closed,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlotState::Created => "created",
            SlotState::ChannelOpen => "channel_open",
            SlotState::QueueDeclared => "queue_declared",
            SlotState::Consuming => "consuming",
            SlotState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Observes and controls a running slot.
pub struct SlotHandle {
    index: usize,
    state: watch::Receiver<SlotState>,
    task: JoinHandle<()>,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        *self.state.borrow()
    }

    /// Wait until the slot reaches `target`. Returns the last known state if
    /// the slot stopped before getting there.
    pub async fn wait_for(&mut self, target: SlotState) -> SlotState {
        let reached = self
            .state
            .wait_for(|state| *state == target)
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| *self.state.borrow())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Resolves once every slot has reached [`SlotState::Closed`], i.e. nothing
/// is consuming any more. Closed slots are never reopened.
pub async fn wait_all_closed(slots: &mut [SlotHandle]) {
    for slot in slots.iter_mut() {
        slot.wait_for(SlotState::Closed).await;
    }
}

/// Opens `channel_count` independent consumers over one shared connection.
pub struct ChannelPool<C: BrokerConnection> {
    connection: Arc<C>,
    settings: PoolSettings,
    retry: Arc<dyn RetryStrategy>,
    retries: Arc<AtomicU64>,
}

impl<C: BrokerConnection> ChannelPool<C> {
    pub fn new(connection: Arc<C>, settings: PoolSettings) -> Self {
        Self {
            connection,
            settings,
            retry: Arc::new(FixedBackoff::default()),
            retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_retry_strategy(mut self, strategy: impl RetryStrategy) -> Self {
        self.retry = Arc::new(strategy);
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Channel-open retries scheduled across all slots so far.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Spawn one task per slot. Slots come up independently; a slot that
    /// cannot declare its queue or start consuming is closed for good.
    pub fn start<H: CommandHandler>(&self, dispatcher: Arc<Dispatcher<H>>) -> Vec<SlotHandle> {
        info!(
            queue = %self.settings.queue_name,
            channels = self.settings.channel_count,
            ack_mode = ?self.settings.ack_mode,
            "Starting channel pool"
        );

        (0..self.settings.channel_count)
            .map(|index| {
                let (state_tx, state_rx) = watch::channel(SlotState::Created);
                let slot = Slot {
                    index,
                    connection: Arc::clone(&self.connection),
                    settings: self.settings.clone(),
                    retry: Arc::clone(&self.retry),
                    retries: Arc::clone(&self.retries),
                    dispatcher: Arc::clone(&dispatcher),
                    state: state_tx,
                };
                SlotHandle {
                    index,
                    state: state_rx,
                    task: tokio::spawn(slot.run()),
                }
            })
            .collect()
    }
}

struct Slot<C: BrokerConnection, H: CommandHandler> {
    index: usize,
    connection: Arc<C>,
    settings: PoolSettings,
    retry: Arc<dyn RetryStrategy>,
    retries: Arc<AtomicU64>,
    dispatcher: Arc<Dispatcher<H>>,
    state: watch::Sender<SlotState>,
}

impl<C: BrokerConnection, H: CommandHandler> Slot<C, H> {
    async fn run(self) {
        let Some(channel) = self.open_channel().await else {
            self.set_state(SlotState::Closed);
            return;
        };
        self.set_state(SlotState::ChannelOpen);

        if let Err(err) = channel.declare_queue(&self.settings.queue_name).await {
            error!(
                slot = self.index,
                queue = %self.settings.queue_name,
                error = %err,
                "Failed to declare queue, abandoning slot"
            );
            self.shut(&channel).await;
            return;
        }
        self.set_state(SlotState::QueueDeclared);

        let deliveries = match self.start_consuming(&channel).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(
                    slot = self.index,
                    queue = %self.settings.queue_name,
                    error = %err,
                    "Failed to start consuming, abandoning slot"
                );
                self.shut(&channel).await;
                return;
            }
        };
        self.set_state(SlotState::Consuming);
        info!(slot = self.index, queue = %self.settings.queue_name, "Slot consuming");

        self.receive(channel, deliveries).await;
        self.set_state(SlotState::Closed);
    }

    async fn open_channel(&self) -> Option<C::Channel> {
        let mut attempt: u32 = 0;
        loop {
            match self.connection.create_channel().await {
                Ok(channel) => {
                    debug!(slot = self.index, "Channel opened");
                    return Some(channel);
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        error!(
                            slot = self.index,
                            attempt,
                            error = %err,
                            "Giving up opening channel"
                        );
                        return None;
                    };
                    let retries_total = self.retries.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        slot = self.index,
                        attempt,
                        retries_total,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Failed to open channel, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn start_consuming(&self, channel: &C::Channel) -> Result<DeliveryStream> {
        let auto_ack = self.settings.ack_mode == AckMode::OnDelivery;
        if !auto_ack {
            channel.set_prefetch(self.settings.prefetch_count).await?;
        }

        let id = Uuid::new_v4().simple().to_string();
        let consumer_tag = format!(
            "{}-worker-{}-{}",
            self.settings.queue_name,
            self.index,
            id.get(..8).unwrap_or(&id)
        );
        channel
            .consume(&self.settings.queue_name, &consumer_tag, auto_ack)
            .await
    }

    async fn receive(&self, channel: C::Channel, mut deliveries: DeliveryStream) {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(message) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(&channel, message).await;
                    });
                }
                Err(err) => {
                    error!(slot = self.index, error = %err, "Error receiving delivery");
                }
            }
        }
        warn!(slot = self.index, "Delivery stream ended, slot closed");
    }

    async fn shut(&self, channel: &C::Channel) {
        if let Err(err) = channel.close().await {
            warn!(slot = self.index, error = %err, "Failed to close channel");
        }
        self.set_state(SlotState::Closed);
    }

    fn set_state(&self, state: SlotState) {
        debug!(slot = self.index, %state, "Slot state changed");
        self.state.send_replace(state);
    }
}
