use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use interlink::{
    BusSettings, ConnectionState, Envelope, HandlerError, MemoryBroker, MessageHandler,
    PeerIdentity, PubSubBus, ReconnectPolicy,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(5);
const CHANNEL: &str = "fleet:prod:broadcast";

fn settings() -> BusSettings {
    BusSettings::new()
        .worker_pool_size(2)
        .subscribe_retry_delay(Duration::from_millis(5))
        .reconnect_policy(ReconnectPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            3,
        ))
}

fn bus(broker: &MemoryBroker, server_id: &str) -> PubSubBus {
    PubSubBus::new(PeerIdentity::new("prod", server_id).unwrap(), broker.clone(), settings())
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn MessageHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = Arc::new(move |_: &str, envelope: &Envelope| -> Result<(), HandlerError> {
        sink.lock().push(format!("{}:{}", envelope.origin_id(), envelope.payload()));
        Ok(())
    });
    (seen, handler)
}

fn envelope(environment: &str, origin: &str, payload: &str) -> Envelope {
    Envelope::new(environment, origin, "player.join", payload).unwrap()
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_before_start_is_applied() {
    let broker = MemoryBroker::new();
    let node = bus(&broker, "paper-1");
    let (seen, handler) = recorder();
    node.subscribe(CHANNEL, handler).unwrap();
    assert_eq!(broker.active_subscriptions(CHANNEL), 0);

    node.start().unwrap();
    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);
    assert_eq!(broker.active_subscriptions(CHANNEL), 1);

    broker.publish(CHANNEL, &envelope("prod", "proxy", "a").to_bytes().unwrap());
    assert!(eventually(|| seen.lock().len() == 1).await);
    assert_eq!(seen.lock()[0], "proxy:a");
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peers_exchange_and_origin_is_filtered() {
    let broker = MemoryBroker::new();
    let paper1 = bus(&broker, "paper-1");
    let paper2 = bus(&broker, "paper-2");
    let (seen1, handler1) = recorder();
    let (seen2, handler2) = recorder();
    paper1.subscribe(CHANNEL, handler1).unwrap();
    paper2.subscribe(CHANNEL, handler2).unwrap();
    paper1.start().unwrap();
    paper2.start().unwrap();
    assert!(paper1.wait_for_state(ConnectionState::Running, TIMEOUT).await);
    assert!(paper2.wait_for_state(ConnectionState::Running, TIMEOUT).await);

    paper1.publish(CHANNEL, &envelope("prod", "paper-1", "hi")).unwrap();
    broker.publish(CHANNEL, &envelope("staging", "paper-3", "elsewhere").to_bytes().unwrap());
    broker.publish(CHANNEL, b"not json");

    assert!(eventually(|| paper1.stats().received == 3 && paper2.stats().received == 3).await);
    assert!(eventually(|| seen2.lock().len() == 1).await);
    assert_eq!(*seen2.lock(), vec!["paper-1:hi".to_string()]);
    assert!(seen1.lock().is_empty());

    let stats = paper1.stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.filtered, 2);
    assert_eq!(stats.decode_failures, 1);
    paper1.stop();
    paper2.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_degraded_publish_is_dropped_and_counted() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let node = bus(&broker, "paper-1");
    node.start().unwrap();
    assert!(node.wait_for_state(ConnectionState::Degraded, TIMEOUT).await);

    let before = node.stats().dropped_publishes;
    node.publish(CHANNEL, &envelope("prod", "paper-1", "x")).unwrap();
    assert_eq!(node.stats().dropped_publishes, before + 1);
    assert_eq!(broker.published_count(), 0);
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resubscribes_after_broker_outage() {
    let broker = MemoryBroker::new();
    let node = bus(&broker, "paper-1");
    let (seen, handler) = recorder();
    node.subscribe(CHANNEL, handler).unwrap();
    node.start().unwrap();
    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);

    broker.set_online(false);
    assert!(node.wait_for_state(ConnectionState::Degraded, TIMEOUT).await);
    assert_eq!(broker.active_subscriptions(CHANNEL), 0);

    // added while degraded, applied on reconnect
    let (late_seen, late_handler) = recorder();
    node.subscribe("fleet:prod:node", late_handler).unwrap();

    broker.set_online(true);
    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);
    assert!(eventually(|| broker.active_subscriptions(CHANNEL) == 1).await);
    assert_eq!(broker.active_subscriptions("fleet:prod:node"), 1);

    broker.publish(CHANNEL, &envelope("prod", "proxy", "back").to_bytes().unwrap());
    broker.publish("fleet:prod:node", &envelope("prod", "proxy", "late").to_bytes().unwrap());
    assert!(eventually(|| seen.lock().len() == 1 && late_seen.lock().len() == 1).await);
    assert!(node.stats().reconnects >= 1);
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_subscribe_retries_degrade_then_recover() {
    let broker = MemoryBroker::new();
    broker.fail_next_subscribes(3);
    let node = bus(&broker, "paper-1");
    let (_, handler) = recorder();
    node.subscribe(CHANNEL, handler).unwrap();
    node.start().unwrap();

    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);
    let stats = node.stats();
    assert_eq!(stats.subscribe_failures, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(broker.active_subscriptions(CHANNEL), 1);
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_handlers_are_isolated() {
    let broker = MemoryBroker::new();
    let node = bus(&broker, "paper-1");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    node.subscribe(
        CHANNEL,
        Arc::new(|_: &str, envelope: &Envelope| -> Result<(), HandlerError> {
            if envelope.payload() == "panic" {
                panic!("handler blew up");
            }
            Err("always fails".into())
        }),
    )
    .unwrap();
    node.subscribe(
        CHANNEL,
        Arc::new(move |_: &str, _: &Envelope| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();
    node.start().unwrap();
    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);

    for payload in ["panic", "error", "panic"] {
        broker.publish(CHANNEL, &envelope("prod", "proxy", payload).to_bytes().unwrap());
    }
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 3).await);
    assert_eq!(node.state(), ConnectionState::Running);
    node.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_broker_connection() {
    let broker = MemoryBroker::new();
    let node = bus(&broker, "paper-1");
    node.start().unwrap();
    assert!(node.wait_for_state(ConnectionState::Running, TIMEOUT).await);
    assert_eq!(broker.connection_count(), 1);

    node.stop();
    assert_eq!(node.state(), ConnectionState::Stopped);
    assert!(eventually(|| broker.connection_count() == 0).await);
    assert!(node.start().is_err());
}
