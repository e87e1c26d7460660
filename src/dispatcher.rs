//! Central dispatcher
//!
//! Single consumer of every inbound queue. Wakes when any producer signals,
//! then walks the queues once in fixed priority order (broker, then
//! ephemeris, then auxiliary), popping at most one message from each. All
//! engine calls happen here, so the engine needs no synchronization, and all
//! position/subscription state transitions happen here for the same reason.
//!
//! Priority is deliberate, not fair: a saturated broker queue can starve the
//! ephemeris pass. Key, frequency and position-dependent subscription
//! updates are latency-sensitive; receiver data is steady-state and bounded
//! by its queue either way.

use crate::bounded_queue::BoundedQueue;
use crate::broker::InboundMessage;
use crate::engine::{CorrectionEngine, MAX_OUTPUT_DRAIN};
use crate::geo::{self, MoveThreshold, Position};
use crate::options::Mode;
use crate::raw_log::RawLog;
use crate::subscription::{SubscriptionManager, SubscriptionState};
use crate::topics::{self, NodeDictionary};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One staged beam-frequency change, set by the dispatcher and consumed
/// exactly once by the output writer.
///
/// While a value is pending, later frequency messages are dropped so the
/// writer never applies a value that was overwritten before reconfiguration
/// ran.
#[derive(Default)]
pub struct FrequencyUpdate {
    pending: Mutex<Option<u64>>,
}

impl FrequencyUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `hz` unless an unapplied value is already pending.
    /// Returns whether the value was staged.
    pub fn stage(&self, hz: u64) -> bool {
        let mut pending = self.pending.lock().expect("frequency lock poisoned");
        if pending.is_some() {
            return false;
        }
        *pending = Some(hz);
        true
    }

    /// Consume the pending value, clearing the flag.
    pub fn take(&self) -> Option<u64> {
        self.pending.lock().expect("frequency lock poisoned").take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().expect("frequency lock poisoned").is_some()
    }
}

/// The three drain passes, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStage {
    Broker,
    Ephemeris,
    Aux,
}

/// Fixed queue priority walked once per wakeup. Kept as data rather than
/// nested conditionals so the policy is visible and testable on its own.
pub const DRAIN_ORDER: [DrainStage; 3] = [
    DrainStage::Broker,
    DrainStage::Ephemeris,
    DrainStage::Aux,
];

/// Everything the dispatcher consumes and produces.
pub struct DispatcherConfig {
    pub mode: Mode,
    pub localized: bool,
    pub region: String,
    pub key_topic: String,
    pub frequency_topic: String,
    /// Region-wide correction topic; `None` when localized distribution
    /// replaces it with dictionary-supplied node topics.
    pub correction_topic: Option<String>,
    pub broker_queue: Arc<BoundedQueue<InboundMessage>>,
    pub ephemeris_queue: Arc<BoundedQueue<Vec<u8>>>,
    pub aux_queue: Arc<BoundedQueue<Vec<u8>>>,
    pub wakeup: Arc<Notify>,
    pub outbound: Arc<BoundedQueue<Vec<u8>>>,
    pub outbound_notify: Arc<Notify>,
    pub engine: Box<dyn CorrectionEngine>,
    pub manager: SubscriptionManager,
    pub subscription_state: Arc<Mutex<SubscriptionState>>,
    pub frequency: Arc<FrequencyUpdate>,
    pub network_log: Option<RawLog>,
    pub aux_log: Option<RawLog>,
}

pub struct Dispatcher {
    mode: Mode,
    localized: bool,
    region: String,
    key_topic: String,
    frequency_topic: String,
    correction_topic: Option<String>,
    broker_queue: Arc<BoundedQueue<InboundMessage>>,
    ephemeris_queue: Arc<BoundedQueue<Vec<u8>>>,
    aux_queue: Arc<BoundedQueue<Vec<u8>>>,
    wakeup: Arc<Notify>,
    outbound: Arc<BoundedQueue<Vec<u8>>>,
    outbound_notify: Arc<Notify>,
    engine: Box<dyn CorrectionEngine>,
    manager: SubscriptionManager,
    subscription_state: Arc<Mutex<SubscriptionState>>,
    frequency: Arc<FrequencyUpdate>,
    position: Option<Position>,
    threshold: MoveThreshold,
    network_log: Option<RawLog>,
    aux_log: Option<RawLog>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            mode: config.mode,
            localized: config.localized,
            region: config.region,
            key_topic: config.key_topic,
            frequency_topic: config.frequency_topic,
            correction_topic: config.correction_topic,
            broker_queue: config.broker_queue,
            ephemeris_queue: config.ephemeris_queue,
            aux_queue: config.aux_queue,
            wakeup: config.wakeup,
            outbound: config.outbound,
            outbound_notify: config.outbound_notify,
            engine: config.engine,
            manager: config.manager,
            subscription_state: config.subscription_state,
            frequency: config.frequency,
            position: None,
            threshold: MoveThreshold::at_latitude(0.0),
            network_log: config.network_log,
            aux_log: config.aux_log,
        }
    }

    /// Consume queues until shutdown. Blocks on the wakeup condition between
    /// passes; producers signal it after every push.
    pub async fn run(mut self, token: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = token.cancelled() => break,
            }
            self.drain_pass().await;

            // A single notification can cover several pushes; re-arm if
            // anything is still waiting so nothing sits in a queue behind a
            // consumed signal.
            if self.has_pending() {
                self.wakeup.notify_one();
            }
        }
        info!("dispatcher stopped");
    }

    fn has_pending(&self) -> bool {
        !self.broker_queue.is_empty()
            || !self.ephemeris_queue.is_empty()
            || (self.mode.uses_aux() && !self.aux_queue.is_empty())
    }

    /// One bounded pass over the queues in [`DRAIN_ORDER`]: at most one
    /// message from each, independently locked, never blocking.
    pub async fn drain_pass(&mut self) {
        for stage in DRAIN_ORDER {
            match stage {
                DrainStage::Broker => {
                    if let Some(message) = self.broker_queue.pop_front() {
                        self.handle_broker_message(message).await;
                    }
                }
                DrainStage::Ephemeris => {
                    if let Some(data) = self.ephemeris_queue.pop_front() {
                        self.handle_receiver_data(&data).await;
                    }
                }
                DrainStage::Aux => {
                    // A mode without the auxiliary channel never drains the
                    // queue, whatever lands in it.
                    if self.mode.uses_aux() {
                        if let Some(data) = self.aux_queue.pop_front() {
                            self.handle_aux_data(&data);
                        }
                    }
                }
            }
        }
    }

    async fn handle_broker_message(&mut self, message: InboundMessage) {
        let InboundMessage { topic, payload } = message;

        if topic == self.key_topic {
            self.handle_key_payload(&payload);
        } else if topic == self.frequency_topic {
            self.handle_frequency_payload(&payload);
        } else if topic.ends_with("/dict") {
            self.handle_tile_payload(&payload).await;
        } else if self.is_correction_topic(&topic) {
            self.submit_network_correction(&payload);
        } else {
            debug!("dropping message on unclassified topic {topic}");
            metrics::counter!("dispatcher.unclassified_total").increment(1);
        }
    }

    fn is_correction_topic(&self, topic: &str) -> bool {
        if self.correction_topic.as_deref() == Some(topic) {
            return true;
        }
        let state = self.subscription_state.lock().expect("state lock");
        state.node_topic.as_deref() == Some(topic)
    }

    /// Key updates are advisory: a rejected key is logged and the engine
    /// keeps running on whatever key it had.
    fn handle_key_payload(&mut self, payload: &[u8]) {
        let key = match topics::parse_key_payload(payload) {
            Ok(key) => key,
            Err(e) => {
                warn!("discarding malformed key payload: {e:#}");
                return;
            }
        };

        let status = self.engine.submit_key(key.as_bytes());
        if status.is_success() {
            info!("engine accepted dynamic key ({} chars)", key.len());
        } else {
            warn!("engine rejected dynamic key: {status}");
            metrics::counter!("engine.key_rejected_total").increment(1);
        }
    }

    fn handle_frequency_payload(&mut self, payload: &[u8]) {
        let hz = match topics::parse_frequency_payload(payload, &self.region) {
            Ok(hz) => hz,
            Err(e) => {
                warn!("discarding malformed frequency payload: {e:#}");
                return;
            }
        };

        if self.frequency.stage(hz) {
            info!("staged beam frequency {hz} Hz for receiver reconfiguration");
        } else {
            // An unapplied value is still pending; keep it rather than
            // overwrite a change the writer is about to apply.
            info!("dropping frequency {hz} Hz: reconfiguration already pending");
        }
    }

    async fn handle_tile_payload(&mut self, payload: &[u8]) {
        let dict = match NodeDictionary::parse(payload) {
            Ok(dict) => dict,
            Err(e) => {
                warn!("discarding malformed tile dictionary: {e:#}");
                return;
            }
        };
        debug!(
            "tile dictionary: {} nodes, endpoint {}",
            dict.nodes.len(),
            dict.endpoint
        );

        if let Err(e) = self.manager.on_tile_dictionary(dict, self.position).await {
            // A failed migration leaves us disconnected until the next tile
            // update; there is no automatic retry path by design.
            warn!("endpoint switch failed: {e:#}");
        }
    }

    fn submit_network_correction(&mut self, payload: &[u8]) {
        if let Some(log) = self.network_log.as_mut() {
            log.write(payload);
        }

        let status = self.engine.submit_network_correction(payload);
        if status.is_success() {
            metrics::counter!("engine.network_bytes_total").increment(payload.len() as u64);
            self.pull_engine_output();
        } else {
            warn!("engine rejected network correction data: {status}");
            metrics::counter!("engine.network_rejected_total").increment(1);
        }
    }

    async fn handle_receiver_data(&mut self, data: &[u8]) {
        let status = self.engine.submit_receiver_data(data);
        if status.is_success() {
            debug!("receiver data accepted ({} bytes)", data.len());
        } else {
            warn!("engine rejected receiver data: {status}");
            metrics::counter!("engine.receiver_rejected_total").increment(1);
        }

        if self.localized
            && let Some(sentence) = geo::extract_gga(data)
            && let Some(pos) = geo::parse_gga(&sentence)
        {
            self.track_position(pos).await;
        }
    }

    /// Apply hysteresis and drive tile/node reselection on accepted moves.
    async fn track_position(&mut self, pos: Position) {
        let moved = match self.position {
            None => true,
            Some(prev) => self.threshold.exceeded(prev, pos),
        };
        if !moved {
            return;
        }

        debug!("position update: {:.4}, {:.4}", pos.lat, pos.lon);
        self.position = Some(pos);
        // Threshold tracks the new latitude so the longitude trigger keeps a
        // roughly constant ground distance.
        self.threshold = MoveThreshold::at_latitude(pos.lat);
        self.manager.on_position_update(pos).await;
    }

    fn handle_aux_data(&mut self, data: &[u8]) {
        if let Some(log) = self.aux_log.as_mut() {
            log.write(data);
        }

        let status = self.engine.submit_aux_correction(data);
        if status.is_success() {
            metrics::counter!("engine.aux_bytes_total").increment(data.len() as u64);
            self.pull_engine_output();
        } else {
            warn!("engine rejected satellite-link data: {status}");
            metrics::counter!("engine.aux_rejected_total").increment(1);
        }
    }

    /// Pull after every successful correction submission; ready output must
    /// never wait for the next inbound message.
    fn pull_engine_output(&mut self) {
        let output = self.engine.drain_output(MAX_OUTPUT_DRAIN);
        if output.is_empty() {
            return;
        }
        metrics::counter!("engine.output_bytes_total").increment(output.len() as u64);
        self.outbound.push(output);
        self.outbound_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_stage_is_first_writer_wins() {
        let freq = FrequencyUpdate::new();
        assert!(!freq.is_pending());

        assert!(freq.stage(1_545_260_000));
        assert!(freq.is_pending());
        // Second value is dropped while the first is unapplied
        assert!(!freq.stage(1_545_000_000));

        assert_eq!(freq.take(), Some(1_545_260_000));
        assert!(!freq.is_pending());
        assert_eq!(freq.take(), None);

        // Once consumed, staging works again
        assert!(freq.stage(1_545_000_000));
        assert_eq!(freq.take(), Some(1_545_000_000));
    }

    #[test]
    fn drain_order_is_broker_first_aux_last() {
        assert_eq!(
            DRAIN_ORDER,
            [DrainStage::Broker, DrainStage::Ephemeris, DrainStage::Aux]
        );
    }
}
