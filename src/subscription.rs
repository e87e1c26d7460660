//! Location-dependent subscription management
//!
//! When localized distribution is enabled, the correction stream is scoped to
//! a geographic tile and, within it, the nearest distribution node. This
//! module owns the transitions: tile reselection as the receiver moves, node
//! reselection as dictionaries arrive, and live migration of the broker
//! connection when a tile is served from a different endpoint.
//!
//! All methods run on the dispatcher, which keeps `Position` and the
//! dictionary single-threaded; the shared ops lock serializes broker calls
//! against the listener's one-shot tile unsubscribe.

use crate::broker::BrokerClient;
use crate::geo::{Position, haversine_distance};
use crate::topics::{self, NodeDictionary, NodeEntry};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Pause between disconnecting from the old endpoint and dialing the new one.
const ENDPOINT_SWITCH_PAUSE: Duration = Duration::from_millis(500);

/// Currently held subscriptions and connection endpoint.
///
/// At most one tile topic and one node topic are held at a time; every
/// transition unsubscribes the old topic before subscribing the new one.
/// Mutated only from the dispatcher; the broker listener reads `tile_topic`
/// to recognize one-shot tile deliveries.
#[derive(Debug)]
pub struct SubscriptionState {
    pub tile_topic: Option<String>,
    pub node_topic: Option<String>,
    pub endpoint: String,
}

impl SubscriptionState {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            tile_topic: None,
            node_topic: None,
            endpoint: endpoint.into(),
        }
    }
}

/// The node with the smallest great-circle distance to `pos`.
fn nearest_node<'a>(dict: &'a NodeDictionary, pos: Position) -> &'a NodeEntry {
    dict.nodes
        .iter()
        .min_by(|a, b| {
            let da = haversine_distance(pos.lat, pos.lon, a.lat, a.lon);
            let db = haversine_distance(pos.lat, pos.lon, b.lat, b.lon);
            da.total_cmp(&db)
        })
        .expect("dictionary is never empty after parsing")
}

pub struct SubscriptionManager {
    broker: Arc<dyn BrokerClient>,
    state: Arc<Mutex<SubscriptionState>>,
    ops_lock: Arc<tokio::sync::Mutex<()>>,
    tile_level: u8,
    /// Topics re-issued after an endpoint switch (key, frequency, ...).
    base_subscriptions: Vec<(String, u8)>,
    dictionary: Option<NodeDictionary>,
}

impl SubscriptionManager {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        state: Arc<Mutex<SubscriptionState>>,
        ops_lock: Arc<tokio::sync::Mutex<()>>,
        tile_level: u8,
        base_subscriptions: Vec<(String, u8)>,
    ) -> Self {
        Self {
            broker,
            state,
            ops_lock,
            tile_level: tile_level.min(topics::MAX_TILE_LEVEL),
            base_subscriptions,
            dictionary: None,
        }
    }

    fn current_tile(&self) -> Option<String> {
        self.state.lock().expect("state lock").tile_topic.clone()
    }

    fn current_node(&self) -> Option<String> {
        self.state.lock().expect("state lock").node_topic.clone()
    }

    pub fn current_endpoint(&self) -> String {
        self.state.lock().expect("state lock").endpoint.clone()
    }

    /// Tile reselection step, invoked when the receiver has moved beyond the
    /// hysteresis threshold (and once for the first fix).
    ///
    /// A tile change defers node reselection until the new tile's dictionary
    /// arrives; an unchanged tile goes straight to node reselection.
    pub async fn on_position_update(&mut self, pos: Position) {
        let tile = topics::tile_topic(self.tile_level, pos.lat, pos.lon);
        let current = self.current_tile();

        if current.as_deref() == Some(tile.as_str()) {
            self.reselect_node(pos).await;
            return;
        }

        info!(
            "tile change: {} -> {tile}",
            current.as_deref().unwrap_or("(none)")
        );
        let _ops = self.ops_lock.lock().await;
        if let Some(old) = &current {
            if let Err(e) = self.broker.unsubscribe(old).await {
                warn!("unsubscribe {old} failed: {e:#}");
            }
        }
        match self.broker.subscribe(&tile, 1).await {
            Ok(()) => {
                self.state.lock().expect("state lock").tile_topic = Some(tile);
            }
            Err(e) => warn!("tile subscribe {tile} failed: {e:#}"),
        }
    }

    /// Node reselection against the current dictionary. No-op while no
    /// dictionary has arrived, and when the nearest node is already held.
    pub async fn reselect_node(&mut self, pos: Position) {
        let Some(dict) = &self.dictionary else {
            return;
        };
        let entry = nearest_node(dict, pos);
        let topic = dict.node_topic(entry);

        let current = self.current_node();
        if current.as_deref() == Some(topic.as_str()) {
            return;
        }

        info!(
            "node change: {} -> {topic}",
            current.as_deref().unwrap_or("(none)")
        );
        let _ops = self.ops_lock.lock().await;
        if let Some(old) = &current {
            if let Err(e) = self.broker.unsubscribe(old).await {
                warn!("unsubscribe {old} failed: {e:#}");
            }
        }
        match self.broker.subscribe(&topic, 0).await {
            Ok(()) => {
                self.state.lock().expect("state lock").node_topic = Some(topic);
            }
            Err(e) => warn!("node subscribe {topic} failed: {e:#}"),
        }
    }

    /// Handle a freshly parsed tile dictionary.
    ///
    /// A dictionary declaring a different endpoint migrates the connection
    /// there; otherwise the node selection is refreshed in place.
    pub async fn on_tile_dictionary(
        &mut self,
        dict: NodeDictionary,
        pos: Option<Position>,
    ) -> Result<()> {
        let endpoint_changed = dict.endpoint != self.current_endpoint();
        let node_topic = pos
            .map(|p| {
                let entry = nearest_node(&dict, p);
                dict.node_topic(entry)
            })
            .unwrap_or_else(|| dict.node_topic(&dict.nodes[0]));
        let new_endpoint = dict.endpoint.clone();
        self.dictionary = Some(dict);

        if endpoint_changed {
            self.switch_endpoint(&new_endpoint, &node_topic).await?;
        } else if let Some(pos) = pos {
            self.reselect_node(pos).await;
        }
        Ok(())
    }

    /// Migrate the broker connection to `endpoint` and come back up
    /// subscribed to the base topic set plus `node_topic`.
    ///
    /// Sequential and blocking with respect to every other broker operation:
    /// the ops lock is held for the whole switch.
    async fn switch_endpoint(&mut self, endpoint: &str, node_topic: &str) -> Result<()> {
        info!(
            "endpoint switch: {} -> {endpoint}",
            self.current_endpoint()
        );
        metrics::counter!("broker.endpoint_switch_total").increment(1);

        let _ops = self.ops_lock.lock().await;
        self.broker.stop_loop().await.context("stopping client loop")?;
        self.broker.disconnect().await.context("disconnecting")?;
        tokio::time::sleep(ENDPOINT_SWITCH_PAUSE).await;
        self.broker
            .connect(endpoint)
            .await
            .with_context(|| format!("connecting to {endpoint}"))?;
        self.broker.start_loop().await.context("restarting client loop")?;

        for (topic, qos) in &self.base_subscriptions {
            if let Err(e) = self.broker.subscribe(topic, *qos).await {
                warn!("re-subscribe {topic} failed after switch: {e:#}");
            }
        }
        if let Err(e) = self.broker.subscribe(node_topic, 0).await {
            warn!("node subscribe {node_topic} failed after switch: {e:#}");
        }

        let mut state = self.state.lock().expect("state lock");
        state.endpoint = endpoint.to_string();
        state.node_topic = Some(node_topic.to_string());
        Ok(())
    }
}
