//! Receiver configuration command sequences
//!
//! The command strings are the receiver's ASCII control dialect and must be
//! sent byte-exact, carriage-return terminated, with the escape sequence
//! first to force the port into command input mode. Every command string in
//! the system lives here.

/// Forces the receiver port into command input mode regardless of what the
/// port was streaming.
pub const COMMAND_MODE_ESCAPE: &str = "SSSSSSSSSSSSSSSSSSSSSSS\r";

/// Restore the factory default configuration.
pub const FACTORY_RESET: &str = "eccf, RxDefault, Current\r";

/// Receiver-side name of the primary channel port.
pub const MAIN_PORT: &str = "USB1";

/// Receiver-side name of the auxiliary (satellite-link) port.
pub const AUX_PORT: &str = "USB2";

/// Stream setup sent once at startup: correction input + ephemeris output on
/// the main port, and a once-per-second position/time report.
pub fn startup_commands(main_port: &str) -> Vec<String> {
    vec![
        format!("sdio, {main_port}, auto, RTCMv3+NMEA\r"),
        format!("sr3o, {main_port}, RTCM1019+RTCM1020+RTCM1042+RTCM1046\r"),
        format!("sno, Stream1, {main_port}, GGA+ZDA, sec1\r"),
    ]
}

/// Beam tracking setup applied when a frequency update arrives: tune the
/// user beam, select it, set the decoder service parameters, and route the
/// demodulated stream to the auxiliary port.
pub fn beam_commands(frequency_hz: u64, aux_port: &str) -> Vec<String> {
    vec![
        format!("slbb, User1, {frequency_hz}, baud2400, , , Enabled\r"),
        "slsm, manual, Inmarsat, User1, User2\r".to_string(),
        "slcs, 5555, 6959\r".to_string(),
        format!("sdio, {aux_port}, none, LBandBeam1\r"),
    ]
}
