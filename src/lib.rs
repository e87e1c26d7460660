//! tether - GNSS correction distribution coordinator
//!
//! Moves correction data between a hardware receiver, a pub/sub broker and a
//! correction-computation engine: device readers and the broker listener feed
//! bounded queues, a single dispatcher drains them in fixed priority order
//! into the engine, and the output writer forwards engine output back to the
//! receiver. When localized distribution is enabled, the subscription manager
//! re-targets the correction feed (tile, node, and broker endpoint) as the
//! receiver moves.

pub mod bounded_queue;
pub mod broker;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod geo;
pub mod options;
pub mod output_writer;
pub mod queue_config;
pub mod raw_log;
pub mod receiver_config;
pub mod rtcm;
pub mod subscription;
pub mod topics;

pub use bounded_queue::BoundedQueue;
pub use broker::{BrokerClient, BrokerListener, InboundMessage, NatsBroker};
pub use device::{DeviceTransport, SerialDevice};
pub use dispatcher::{Dispatcher, DispatcherConfig, FrequencyUpdate};
pub use engine::{CorrectionEngine, EngineStatus, NullEngine};
pub use geo::Position;
pub use options::{Mode, Options};
pub use output_writer::OutputWriter;
pub use subscription::{SubscriptionManager, SubscriptionState};
