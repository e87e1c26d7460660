//! Broker client boundary
//!
//! The pub/sub client is an external dependency wrapped behind
//! [`BrokerClient`] so the coordinator and the tests never touch a concrete
//! transport. The listener side follows one rule: a delivery callback only
//! never interprets a delivery: it enqueues the message and
//! signals the dispatcher. The single exception is the tile dictionary
//! subscription, which is a one-shot snapshot and is unsubscribed the moment
//! its payload arrives.

use crate::bounded_queue::BoundedQueue;
use crate::options::Mode;
use crate::subscription::SubscriptionState;
use crate::topics;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// One message delivered by the broker, queued for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Narrow interface over the pub/sub transport client.
///
/// Implementations manage their own connection state behind `&self`; the
/// handle is shared between the listener callback path and the subscription
/// manager. Callers serialize subscribe/unsubscribe against endpoint
/// switches with the shared ops lock; the client itself does not.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    /// Begin delivering messages to the listener.
    async fn start_loop(&self) -> Result<()>;
    /// Stop delivery without dropping the connection state.
    async fn stop_loop(&self) -> Result<()>;
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}

/// The topic set subscribed on every (re)connect, per the operating mode.
///
/// The key topic is always wanted; the frequency topic only matters when the
/// satellite link is in use; the region-wide correction stream only when the
/// network channel is enabled *and* localized distribution is off (localized
/// subscriptions are driven by position instead).
pub fn base_subscriptions(
    mode: Mode,
    localized: bool,
    band: &str,
    region: &str,
) -> Vec<(String, u8)> {
    let mut subs = vec![(topics::key_topic(band), 1)];
    if mode.uses_aux() {
        subs.push((topics::frequency_topic(band), 1));
    }
    if mode.uses_network() && !localized {
        subs.push((topics::correction_topic(band, region), 0));
    }
    subs
}

/// Receives every broker delivery and feeds the dispatcher's inbound queue.
pub struct BrokerListener {
    queue: Arc<BoundedQueue<InboundMessage>>,
    wakeup: Arc<Notify>,
    state: Arc<Mutex<SubscriptionState>>,
    /// Serializes broker operations against endpoint switches.
    ops_lock: Arc<tokio::sync::Mutex<()>>,
    /// Set once after the client exists (client and listener reference each
    /// other).
    broker: OnceLock<Arc<dyn BrokerClient>>,
}

impl BrokerListener {
    pub fn new(
        queue: Arc<BoundedQueue<InboundMessage>>,
        wakeup: Arc<Notify>,
        state: Arc<Mutex<SubscriptionState>>,
        ops_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            queue,
            wakeup,
            state,
            ops_lock,
            broker: OnceLock::new(),
        }
    }

    pub fn attach_broker(&self, broker: Arc<dyn BrokerClient>) {
        if self.broker.set(broker).is_err() {
            warn!("broker already attached to listener");
        }
    }

    /// Entry point for the client's delivery path. Enqueue and signal only;
    /// interpretation happens on the dispatcher.
    pub async fn on_message(&self, topic: String, payload: Vec<u8>) {
        debug!("broker message on {topic} ({} bytes)", payload.len());
        metrics::counter!("broker.messages_total").increment(1);

        // Tile dictionaries are one-shot snapshots, not streams: drop the
        // subscription as soon as the payload is in hand.
        let is_active_tile = {
            let state = self.state.lock().expect("subscription state lock poisoned");
            state.tile_topic.as_deref() == Some(topic.as_str())
        };
        if is_active_tile {
            if let Some(broker) = self.broker.get() {
                let _ops = self.ops_lock.lock().await;
                if let Err(e) = broker.unsubscribe(&topic).await {
                    warn!("one-shot unsubscribe of {topic} failed: {e:#}");
                }
            }
        }

        self.queue.push(InboundMessage { topic, payload });
        self.wakeup.notify_one();
    }
}

/// NATS-backed [`BrokerClient`].
///
/// Topic strings pass through verbatim as single-token subjects. NATS has no
/// QoS levels; the parameter is accepted and ignored. `start_loop` /
/// `stop_loop` control the per-subscription pump tasks that push deliveries
/// into the listener.
pub struct NatsBroker {
    listener: Arc<BrokerListener>,
    client_name: String,
    inner: tokio::sync::Mutex<NatsInner>,
}

#[derive(Default)]
struct NatsInner {
    client: Option<async_nats::Client>,
    pumps: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl NatsBroker {
    pub fn new(listener: Arc<BrokerListener>, client_name: impl Into<String>) -> Self {
        Self {
            listener,
            client_name: client_name.into(),
            inner: tokio::sync::Mutex::new(NatsInner::default()),
        }
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn connect(&self, endpoint: &str) -> Result<()> {
        let client = async_nats::ConnectOptions::new()
            .name(&self.client_name)
            .connect(endpoint)
            .await?;
        info!("connected to broker at {endpoint} as {}", self.client_name);
        self.inner.lock().await.client = Some(client);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (_, pump) in inner.pumps.drain() {
            pump.abort();
        }
        if let Some(client) = inner.client.take() {
            client.flush().await.ok();
            info!("disconnected from broker");
        }
        Ok(())
    }

    async fn start_loop(&self) -> Result<()> {
        // Delivery pumps run from the moment of subscription; nothing to arm.
        Ok(())
    }

    async fn stop_loop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (_, pump) in inner.pumps.drain() {
            pump.abort();
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: u8) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let client = inner
            .client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("subscribe on disconnected broker client"))?;

        let mut subscriber = client.subscribe(topic.to_string()).await?;
        info!("subscribed to {topic}");

        let listener = self.listener.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                listener
                    .on_message(message.subject.to_string(), message.payload.to_vec())
                    .await;
            }
        });

        if let Some(previous) = inner.pumps.insert(topic.to_string(), pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(pump) = inner.pumps.remove(topic) {
            // Aborting the pump drops the subscriber, which unsubscribes
            // server-side.
            pump.abort();
            info!("unsubscribed from {topic}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_config::BROKER_QUEUE_SIZE;

    #[derive(Default)]
    struct RecordingClient {
        ops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerClient for RecordingClient {
        async fn connect(&self, endpoint: &str) -> Result<()> {
            self.ops.lock().unwrap().push(format!("connect {endpoint}"));
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.ops.lock().unwrap().push("disconnect".into());
            Ok(())
        }
        async fn start_loop(&self) -> Result<()> {
            self.ops.lock().unwrap().push("start".into());
            Ok(())
        }
        async fn stop_loop(&self) -> Result<()> {
            self.ops.lock().unwrap().push("stop".into());
            Ok(())
        }
        async fn subscribe(&self, topic: &str, _qos: u8) -> Result<()> {
            self.ops.lock().unwrap().push(format!("sub {topic}"));
            Ok(())
        }
        async fn unsubscribe(&self, topic: &str) -> Result<()> {
            self.ops.lock().unwrap().push(format!("unsub {topic}"));
            Ok(())
        }
    }

    fn make_listener() -> (Arc<BrokerListener>, Arc<BoundedQueue<InboundMessage>>, Arc<RecordingClient>) {
        let queue = Arc::new(BoundedQueue::new("broker", BROKER_QUEUE_SIZE));
        let wakeup = Arc::new(Notify::new());
        let state = Arc::new(Mutex::new(SubscriptionState::new("broker.test")));
        state.lock().unwrap().tile_topic = Some("pp/ip/L0N4500W12250/dict".to_string());

        let listener = Arc::new(BrokerListener::new(
            queue.clone(),
            wakeup,
            state,
            Arc::new(tokio::sync::Mutex::new(())),
        ));
        let client = Arc::new(RecordingClient::default());
        listener.attach_broker(client.clone());
        (listener, queue, client)
    }

    #[test]
    fn base_subscription_rules() {
        let network = base_subscriptions(Mode::Network, false, "ip", "eu");
        assert_eq!(
            network,
            vec![("/pp/key/ip".to_string(), 1), ("/pp/ip/eu".to_string(), 0)]
        );

        // Localized network mode leaves the correction stream to the manager
        let localized = base_subscriptions(Mode::Network, true, "ip", "eu");
        assert_eq!(localized, vec![("/pp/key/ip".to_string(), 1)]);

        let satlink = base_subscriptions(Mode::SatLink, false, "Lb", "eu");
        assert_eq!(
            satlink,
            vec![
                ("/pp/key/Lb".to_string(), 1),
                ("/pp/frequencies/Lb".to_string(), 1)
            ]
        );

        let dual = base_subscriptions(Mode::Dual, false, "Lb", "eu");
        assert_eq!(dual.len(), 3);
    }

    #[tokio::test]
    async fn listener_enqueues_and_leaves_ordinary_topics_subscribed() {
        let (listener, queue, client) = make_listener();

        listener
            .on_message("/pp/key/Lb".to_string(), b"{}".to_vec())
            .await;

        assert_eq!(queue.len(), 1);
        assert!(client.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listener_unsubscribes_active_tile_topic_once_delivered() {
        let (listener, queue, client) = make_listener();

        listener
            .on_message("pp/ip/L0N4500W12250/dict".to_string(), b"{}".to_vec())
            .await;

        assert_eq!(queue.len(), 1, "payload still reaches the dispatcher");
        assert_eq!(
            client.ops.lock().unwrap().as_slice(),
            ["unsub pp/ip/L0N4500W12250/dict"]
        );
    }
}
