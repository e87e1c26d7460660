//! Command-line options
//!
//! The correction source mode, the two device channels, broker parameters
//! and the optional capture/startup-configuration behaviors.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::str::FromStr;

/// Which correction channels feed the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Broker-delivered (network) corrections only.
    Network,
    /// Satellite-link (auxiliary channel) corrections only.
    SatLink,
    /// Both channels.
    Dual,
}

impl Mode {
    pub fn uses_network(self) -> bool {
        matches!(self, Mode::Network | Mode::Dual)
    }

    pub fn uses_aux(self) -> bool {
        matches!(self, Mode::SatLink | Mode::Dual)
    }
}

/// `path@baud` serial channel specification, e.g. `/dev/ttyACM0@115200`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub path: String,
    pub baud: u32,
}

impl FromStr for ChannelSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, baud) = s
            .split_once('@')
            .with_context(|| format!("`{s}`: expected path@baud"))?;
        if path.is_empty() {
            bail!("`{s}`: empty device path");
        }
        let baud = baud
            .parse()
            .with_context(|| format!("`{s}`: bad baud rate"))?;
        Ok(Self {
            path: path.to_string(),
            baud,
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "tether", about = "GNSS correction distribution coordinator", version)]
pub struct Options {
    /// Correction source mode
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Primary device channel (receiver), as path@baud
    #[arg(long)]
    pub main_device: ChannelSpec,

    /// Auxiliary device channel (satellite-link demodulator), as path@baud.
    /// Required for sat-link and dual modes.
    #[arg(long)]
    pub aux_device: Option<ChannelSpec>,

    /// Client identifier presented to the broker
    #[arg(long)]
    pub client_id: String,

    /// Broker endpoint to connect to first; tile dictionaries may migrate the
    /// connection elsewhere when localized distribution is enabled
    #[arg(long, default_value = "corrections.example.net")]
    pub broker_host: String,

    /// Correction service region, selects the frequency table entry and the
    /// region-wide correction topic
    #[arg(long, default_value = "eu")]
    pub region: String,

    /// Service band embedded in topic names. Defaults to `Lb` for modes using
    /// the satellite link and `ip` otherwise.
    #[arg(long)]
    pub band: Option<String>,

    /// Subscribe to location-dependent correction feeds instead of the
    /// region-wide stream
    #[arg(long)]
    pub localized: bool,

    /// Tile granularity level for localized distribution
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub tile_level: u8,

    /// Capture raw correction streams to <prefix>_ip.bin / <prefix>_lb.bin
    #[arg(long)]
    pub raw_log: Option<String>,

    /// Send the stream-configuration command sequence to the receiver before
    /// starting the pipeline
    #[arg(long)]
    pub send_startup_config: bool,

    /// Reset the receiver to factory defaults first (only with
    /// --send-startup-config)
    #[arg(long)]
    pub reset_default: bool,

    /// Stop after this many seconds (unbounded if absent)
    #[arg(long)]
    pub run_for: Option<u64>,
}

impl Options {
    /// Cross-field validation beyond what clap expresses.
    pub fn validate(&self) -> Result<()> {
        if self.mode.uses_aux() && self.aux_device.is_none() {
            bail!("--aux-device is required for sat-link and dual modes");
        }
        if self.reset_default && !self.send_startup_config {
            bail!("--reset-default has no effect without --send-startup-config");
        }
        Ok(())
    }

    pub fn band(&self) -> String {
        match &self.band {
            Some(band) => band.clone(),
            None if self.mode.uses_aux() => "Lb".to_string(),
            None => "ip".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(
            std::iter::once("tether").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn channel_spec_parsing() {
        let spec: ChannelSpec = "/dev/ttyACM0@115200".parse().unwrap();
        assert_eq!(spec.path, "/dev/ttyACM0");
        assert_eq!(spec.baud, 115_200);

        assert!("".parse::<ChannelSpec>().is_err());
        assert!("/dev/ttyACM0".parse::<ChannelSpec>().is_err());
        assert!("@115200".parse::<ChannelSpec>().is_err());
        assert!("/dev/ttyACM0@fast".parse::<ChannelSpec>().is_err());
    }

    #[test]
    fn aux_mode_requires_aux_device() {
        let opts = parse(&[
            "--mode",
            "sat-link",
            "--main-device",
            "/dev/ttyACM0@115200",
            "--client-id",
            "abc",
        ]);
        assert!(opts.validate().is_err());

        let opts = parse(&[
            "--mode",
            "sat-link",
            "--main-device",
            "/dev/ttyACM0@115200",
            "--aux-device",
            "/dev/ttyACM1@115200",
            "--client-id",
            "abc",
        ]);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn band_defaults_follow_mode() {
        let network = parse(&[
            "--mode",
            "network",
            "--main-device",
            "/dev/ttyACM0@115200",
            "--client-id",
            "abc",
        ]);
        assert_eq!(network.band(), "ip");

        let dual = parse(&[
            "--mode",
            "dual",
            "--main-device",
            "/dev/ttyACM0@115200",
            "--aux-device",
            "/dev/ttyACM1@115200",
            "--client-id",
            "abc",
        ]);
        assert_eq!(dual.band(), "Lb");
    }

    #[test]
    fn tile_level_range_is_enforced() {
        let result = Options::try_parse_from([
            "tether",
            "--mode",
            "network",
            "--main-device",
            "/dev/ttyACM0@115200",
            "--client-id",
            "abc",
            "--tile-level",
            "3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn mode_channel_predicates() {
        assert!(Mode::Network.uses_network() && !Mode::Network.uses_aux());
        assert!(!Mode::SatLink.uses_network() && Mode::SatLink.uses_aux());
        assert!(Mode::Dual.uses_network() && Mode::Dual.uses_aux());
    }
}
