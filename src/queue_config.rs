//! Centralized queue capacity configuration for the correction pipeline
//!
//! Every queue in the system is a [`crate::bounded_queue::BoundedQueue`] with
//! overwrite-oldest semantics, so these capacities bound *staleness*, not
//! producer throughput: when a consumer falls behind, the oldest buffered
//! message is evicted and the producer never blocks. Freshness matters more
//! than completeness for correction streams.

/// Inbound broker message queue (key, frequency, correction, tile payloads).
/// Broker traffic is the highest-priority drain and the burstiest source;
/// 10 messages is roughly 10 seconds of correction stream at the default
/// publish cadence.
pub const BROKER_QUEUE_SIZE: usize = 10;

/// Ephemeris/GGA queue fed by the primary device channel.
/// The receiver emits one GGA+ZDA block per second plus ephemeris on change;
/// 15 entries absorbs an ephemeris burst without aging the position fix.
pub const EPHEMERIS_QUEUE_SIZE: usize = 15;

/// Auxiliary (satellite-link) correction queue.
/// The beam delivers at 2400 baud, so depth 10 is far more buffering than the
/// channel can fill between dispatcher wakeups.
pub const AUX_QUEUE_SIZE: usize = 10;

/// Outbound correction queue between the dispatcher and the output writer.
/// The writer's only slow path is the one-shot device reconfiguration; 10
/// entries rides that out while keeping stale corrections from reaching the
/// receiver afterwards.
pub const OUTBOUND_QUEUE_SIZE: usize = 10;

/// Fixed read buffer size for device channels, in bytes.
/// Sized for the largest ephemeris block the receiver emits in one burst.
pub const DEVICE_READ_BUFFER_SIZE: usize = 4096;

/// Poll interval for the primary (ephemeris/GGA) reader between reads.
pub const MAIN_POLL_INTERVAL_MS: u64 = 500;

/// Poll interval for the auxiliary (satellite-link) reader between reads.
pub const AUX_POLL_INTERVAL_MS: u64 = 500;
