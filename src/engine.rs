//! Correction engine adapter
//!
//! The engine that turns correction streams plus receiver data into encoded
//! output messages is an external, single-threaded library. This module wraps
//! it behind a narrow trait so the dispatcher (and the tests) never depend on
//! a concrete binding. All calls are made from one logical place at a time;
//! implementations are not required to be safe for concurrent invocation.

use tracing::debug;

/// Maximum number of bytes requested from the engine per output drain.
/// Matches the largest single output burst the engine is documented to
/// produce (header + one full message set).
pub const MAX_OUTPUT_DRAIN: usize = 19 + 164 + 12 + 450 * 7;

/// Channel enable mask passed to [`CorrectionEngine::initialize`].
pub mod channel_mask {
    /// Network (broker-delivered) correction input channel.
    pub const NETWORK: u32 = 0x0000_0001;
    /// Auxiliary (satellite-link) correction input channel.
    pub const AUX: u32 = 0x0000_0004;
}

/// Status returned by every engine call.
///
/// Anything other than `Success` is advisory: the submitted message has been
/// consumed either way and is never retried. Statuses are logged with their
/// numeric code so field reports can be matched against the engine vendor's
/// documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Success,
    IncorrectUsage,
    InitFailed,
    LicenseExpired,
    ChannelNotEnabled,
    NoDynamicKey,
    InvalidDynamicKey,
    IncorrectDynamicKey,
    PositionNotAvailable,
    TimeNotResolved,
    BufferOverflow,
    Unknown(u32),
}

impl EngineStatus {
    pub fn is_success(self) -> bool {
        self == EngineStatus::Success
    }

    /// Numeric code for log lines, aligned with the vendor status table.
    pub fn code(self) -> u32 {
        match self {
            EngineStatus::Success => 0,
            EngineStatus::IncorrectUsage => 1,
            EngineStatus::InitFailed => 2,
            EngineStatus::LicenseExpired => 3,
            EngineStatus::ChannelNotEnabled => 10,
            EngineStatus::NoDynamicKey => 100,
            EngineStatus::InvalidDynamicKey => 101,
            EngineStatus::IncorrectDynamicKey => 102,
            EngineStatus::PositionNotAvailable => 200,
            EngineStatus::TimeNotResolved => 201,
            EngineStatus::BufferOverflow => 300,
            EngineStatus::Unknown(code) => code,
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (code {})", self, self.code())
    }
}

/// Narrow interface over the external correction engine.
///
/// Methods are synchronous: the underlying library is a C-ABI-style binding
/// whose calls complete quickly and must not overlap. The dispatcher owns the
/// engine exclusively, which gives that guarantee by construction.
pub trait CorrectionEngine: Send {
    /// One-time setup with the set of enabled input channels
    /// (see [`channel_mask`]).
    fn initialize(&mut self, channel_mask: u32) -> EngineStatus;

    /// Rotate the authentication key. Invalid or expired keys are reported
    /// via the returned status; the engine keeps running on the prior key.
    fn submit_key(&mut self, key: &[u8]) -> EngineStatus;

    /// Feed correction data received over the network (broker) channel.
    fn submit_network_correction(&mut self, data: &[u8]) -> EngineStatus;

    /// Feed correction data received over the auxiliary (satellite-link)
    /// channel.
    fn submit_aux_correction(&mut self, data: &[u8]) -> EngineStatus;

    /// Feed raw receiver output (ephemeris and position sentences).
    fn submit_receiver_data(&mut self, data: &[u8]) -> EngineStatus;

    /// Pull any output the engine has ready, up to `max_size` bytes.
    /// Returns an empty vector when nothing is pending.
    fn drain_output(&mut self, max_size: usize) -> Vec<u8>;
}

/// Engine stand-in that accepts all input and produces no output.
///
/// Used for dry runs (pipeline bring-up against live devices and broker
/// without a licensed engine binding) and as the base of test doubles.
#[derive(Debug, Default)]
pub struct NullEngine;

impl NullEngine {
    pub fn new() -> Self {
        Self
    }
}

impl CorrectionEngine for NullEngine {
    fn initialize(&mut self, channel_mask: u32) -> EngineStatus {
        debug!("null engine initialized with channel mask {channel_mask:#010x}");
        EngineStatus::Success
    }

    fn submit_key(&mut self, _key: &[u8]) -> EngineStatus {
        EngineStatus::Success
    }

    fn submit_network_correction(&mut self, _data: &[u8]) -> EngineStatus {
        EngineStatus::Success
    }

    fn submit_aux_correction(&mut self, _data: &[u8]) -> EngineStatus {
        EngineStatus::Success
    }

    fn submit_receiver_data(&mut self, _data: &[u8]) -> EngineStatus {
        EngineStatus::Success
    }

    fn drain_output(&mut self, _max_size: usize) -> Vec<u8> {
        Vec::new()
    }
}
