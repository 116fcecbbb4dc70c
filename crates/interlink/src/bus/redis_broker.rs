//! Redis pub/sub broker.
//!
//! Each bus connection holds two Redis connections: a multiplexed one for
//! PUBLISH and a dedicated pub/sub one owned by a pump task. A Redis
//! connection in subscriber mode only accepts (un)subscribe commands, so the
//! pump applies SUBSCRIBE requests between inbound messages.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, Msg, RedisResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broker::{BrokerConnection, BrokerConnector, BrokerDelivery};
use crate::error::BrokerError;
use crate::settings::RedisSettings;

const SUBSCRIBE_QUEUE: usize = 16;

/// Connects buses to a Redis server.
pub struct RedisBroker {
    client: Client,
    settings: RedisSettings,
}

impl RedisBroker {
    /// Validates the URL. Nothing is dialled until a bus connects.
    pub fn new(settings: RedisSettings) -> Result<Self, BrokerError> {
        let client = Client::open(settings.url.as_str()).map_err(|e| {
            BrokerError::Unavailable(format!("invalid Redis URL {}: {e}", settings.redacted_url()))
        })?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &RedisSettings {
        &self.settings
    }

    fn unavailable(&self, reason: String) -> BrokerError {
        BrokerError::Unavailable(format!("{}: {reason}", self.settings.redacted_url()))
    }
}

#[async_trait]
impl BrokerConnector for RedisBroker {
    async fn connect(
        &self,
        deliveries: mpsc::Sender<BrokerDelivery>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let timeout = self.settings.timeout;
        let publisher = within(timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|e| self.unavailable(e))?;
        let pubsub = within(timeout, self.client.get_async_pubsub())
            .await
            .map_err(|e| self.unavailable(e))?;

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (requests, request_rx) = mpsc::channel(SUBSCRIBE_QUEUE);
        let closed = Arc::new(watch::Sender::new(false));
        let pump = tokio::spawn(pump(id, pubsub, request_rx, deliveries, closed.clone()));

        info!("🔌 Connected to Redis {} (connection #{})", self.settings.redacted_url(), id);
        Ok(Arc::new(RedisConnection {
            id,
            publisher: Mutex::new(publisher),
            requests,
            closed,
            pump: Mutex::new(Some(pump)),
            timeout,
        }))
    }
}

async fn within<T, F>(limit: Duration, request: F) -> Result<T, String>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {limit:?}")),
    }
}

struct SubscribeRequest {
    channel: String,
    reply: oneshot::Sender<Result<(), String>>,
}

enum PumpInput {
    Message(Option<Msg>),
    Request(Option<SubscribeRequest>),
}

/// Forwards messages to the bus until the pub/sub connection ends, the bus
/// stops listening or the connection handle is dropped.
async fn pump(
    id: u64,
    mut pubsub: PubSub,
    mut requests: mpsc::Receiver<SubscribeRequest>,
    deliveries: mpsc::Sender<BrokerDelivery>,
    closed: Arc<watch::Sender<bool>>,
) {
    loop {
        let input = {
            let mut messages = pin!(pubsub.on_message());
            tokio::select! {
                message = messages.next() => PumpInput::Message(message),
                request = requests.recv() => PumpInput::Request(request),
            }
        };

        match input {
            PumpInput::Message(Some(message)) => {
                let delivery = BrokerDelivery {
                    channel: message.get_channel_name().to_string(),
                    payload: message.get_payload_bytes().to_vec(),
                };
                if deliveries.send(delivery).await.is_err() {
                    debug!("Redis connection #{}: bus stopped listening", id);
                    break;
                }
            }
            PumpInput::Message(None) => {
                warn!("Redis pub/sub connection #{} ended", id);
                break;
            }
            PumpInput::Request(Some(request)) => {
                let outcome = pubsub
                    .subscribe(request.channel.as_str())
                    .await
                    .map_err(|e| e.to_string());
                let _ = request.reply.send(outcome);
            }
            PumpInput::Request(None) => break,
        }
    }
    closed.send_replace(true);
}

pub struct RedisConnection {
    id: u64,
    publisher: Mutex<MultiplexedConnection>,
    requests: mpsc::Sender<SubscribeRequest>,
    closed: Arc<watch::Sender<bool>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl RedisConnection {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let mut publisher = self.publisher.lock().clone();
        let request = async move {
            let _receivers: i64 = publisher.publish(channel, payload).await?;
            Ok::<(), redis::RedisError>(())
        };
        within(self.timeout, request)
            .await
            .map_err(|reason| BrokerError::Publish {
                channel: channel.to_string(),
                reason,
            })
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(SubscribeRequest {
                channel: channel.to_string(),
                reply,
            })
            .await
            .map_err(|_| BrokerError::Closed)?;

        let failed = |reason: String| BrokerError::Subscribe {
            channel: channel.to_string(),
            reason,
        };
        match tokio::time::timeout(self.timeout, outcome).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(failed(reason)),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(failed(format!("timed out after {:?}", self.timeout))),
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            if let Some(pump) = self.pump.lock().take() {
                pump.abort();
            }
            debug!("Closed Redis connection #{}", self.id);
        }
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_url_is_rejected() {
        assert!(matches!(
            RedisBroker::new(RedisSettings::new("not a url")),
            Err(BrokerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = RedisSettings::new(format!("redis://127.0.0.1:{port}/")).timeout(Duration::from_secs(2));
        let broker = RedisBroker::new(settings).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        match broker.connect(tx).await {
            Err(BrokerError::Unavailable(reason)) => assert!(reason.contains("127.0.0.1"), "{reason}"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    /// Runs against a live server when `INTERLINK_REDIS_URL` is set.
    #[tokio::test]
    async fn test_publish_reaches_subscriber_on_live_server() {
        let Ok(url) = std::env::var("INTERLINK_REDIS_URL") else {
            return;
        };
        let broker = RedisBroker::new(RedisSettings::new(url)).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let conn = broker.connect(tx).await.unwrap();
        let channel = format!("fleet:test:{}", uuid::Uuid::new_v4());

        conn.subscribe(&channel).await.unwrap();
        conn.publish(&channel, b"hello").await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery, BrokerDelivery { channel, payload: b"hello".to_vec() });

        conn.close();
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert!(matches!(conn.publish("x", b"y").await, Err(BrokerError::Closed)));
    }
}
