use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use timeseries_worker::rabbitmq::{
    wait_all_closed, AckMode, BrokerError, ChannelPool, Dispatcher, FixedBackoff, PoolSettings,
    SlotHandle, SlotState,
};

use crate::support::{FakeBroker, ScriptedHandler};

fn settings(channel_count: usize, ack_mode: AckMode) -> PoolSettings {
    PoolSettings {
        channel_count,
        ack_mode,
        prefetch_count: 5,
        ..PoolSettings::default()
    }
}

fn start(pool: &ChannelPool<FakeBroker>) -> Vec<SlotHandle> {
    let dispatcher = Arc::new(Dispatcher::new(ScriptedHandler::new(), "timeseries"));
    pool.start(dispatcher)
}

#[tokio::test(start_paused = true)]
async fn test_channel_open_is_retried_until_it_succeeds() {
    let broker = FakeBroker::new().failing_channel_opens(2);
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(1, AckMode::OnDelivery))
        .with_retry_strategy(FixedBackoff::new(Duration::from_secs(3)));

    let started = Instant::now();
    let mut slots = start(&pool);

    assert_eq!(slots[0].wait_for(SlotState::Consuming).await, SlotState::Consuming);
    assert!(started.elapsed() >= Duration::from_secs(6));
    assert_eq!(pool.retry_count(), 2);
    assert_eq!(broker.open_attempts(), 3);
    assert_eq!(broker.declared(), vec!["timeseries".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_backoff_gives_up() {
    let broker = FakeBroker::new().failing_channel_opens(10);
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(1, AckMode::OnDelivery))
        .with_retry_strategy(FixedBackoff::new(Duration::from_secs(1)).with_max_attempts(2));

    let mut slots = start(&pool);

    assert_eq!(slots[0].wait_for(SlotState::Closed).await, SlotState::Closed);
    assert_eq!(broker.open_attempts(), 3);
    assert_eq!(pool.retry_count(), 2);
    assert!(broker.consumers().is_empty());
}

#[tokio::test]
async fn test_declare_failure_closes_slot_without_retry() {
    let broker = FakeBroker::new().failing_queue_declare();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(2, AckMode::OnDelivery));

    let mut slots = start(&pool);
    for slot in &mut slots {
        assert_eq!(slot.wait_for(SlotState::Closed).await, SlotState::Closed);
    }

    assert_eq!(broker.closed_channels(), 2);
    assert_eq!(broker.open_attempts(), 2);
    assert_eq!(pool.retry_count(), 0);
    assert!(broker.consumers().is_empty());
}

#[tokio::test]
async fn test_consume_failure_closes_slot() {
    let broker = FakeBroker::new().failing_consume();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(1, AckMode::OnDelivery));

    let mut slots = start(&pool);

    assert_eq!(slots[0].wait_for(SlotState::Closed).await, SlotState::Closed);
    assert_eq!(broker.declared().len(), 1);
    assert_eq!(broker.closed_channels(), 1);
}

#[tokio::test]
async fn test_auto_ack_consumers_skip_prefetch() {
    let broker = FakeBroker::new();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(3, AckMode::OnDelivery));

    let mut slots = start(&pool);
    for slot in &mut slots {
        slot.wait_for(SlotState::Consuming).await;
    }

    let consumers = broker.consumers();
    assert_eq!(consumers.len(), 3);
    assert!(consumers.iter().all(|c| c.auto_ack && c.queue == "timeseries"));
    assert!(broker.prefetch().is_empty());
}

#[tokio::test]
async fn test_manual_ack_consumers_set_prefetch() {
    let broker = FakeBroker::new();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(2, AckMode::AfterDispatch));

    let mut slots = start(&pool);
    for slot in &mut slots {
        slot.wait_for(SlotState::Consuming).await;
    }

    assert_eq!(broker.prefetch(), vec![5, 5]);
    assert!(broker.consumers().iter().all(|c| !c.auto_ack));
}

#[tokio::test]
async fn test_consumer_tags_are_unique_per_slot() {
    let broker = FakeBroker::new();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(1, AckMode::OnDelivery));

    let mut slots = start(&pool);
    slots[0].wait_for(SlotState::Consuming).await;

    let consumers = broker.consumers();
    let tag = &consumers[0].tag;
    assert!(tag.starts_with("timeseries-worker-0-"), "unexpected tag {}", tag);
    assert_eq!(tag.len(), "timeseries-worker-0-".len() + 8);
}

#[tokio::test]
async fn test_slot_closes_when_deliveries_end() {
    let broker = FakeBroker::new();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(1, AckMode::OnDelivery));

    let mut slots = start(&pool);
    slots[0].wait_for(SlotState::Consuming).await;

    broker.deliver_error(0, BrokerError::ConsumeError("frame error".to_string()));
    broker.disconnect();

    assert_eq!(slots[0].wait_for(SlotState::Closed).await, SlotState::Closed);
    assert_eq!(pool.retry_count(), 0);
}

#[tokio::test]
async fn test_wait_all_closed_resolves_when_no_slot_consumes() {
    let broker = FakeBroker::new().failing_queue_declare();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(3, AckMode::OnDelivery));

    let mut slots = start(&pool);
    tokio::time::timeout(Duration::from_secs(5), wait_all_closed(&mut slots))
        .await
        .expect("slots never closed");

    assert!(slots.iter().all(|slot| slot.state() == SlotState::Closed));
}

#[tokio::test]
async fn test_wait_all_closed_waits_for_consuming_slots() {
    let broker = FakeBroker::new();
    let pool = ChannelPool::new(Arc::new(broker.clone()), settings(2, AckMode::OnDelivery));

    let mut slots = start(&pool);
    for slot in &mut slots {
        slot.wait_for(SlotState::Consuming).await;
    }
    let pending = tokio::time::timeout(Duration::from_millis(50), wait_all_closed(&mut slots)).await;
    assert!(pending.is_err());

    broker.disconnect();
    tokio::time::timeout(Duration::from_secs(5), wait_all_closed(&mut slots))
        .await
        .expect("slots never closed after disconnect");
}
