//! Broker topic naming and payload parsing
//!
//! Topic strings are bit-exact with the correction service's published
//! layout: `/pp/key/<band>` (dynamic key), `/pp/frequencies/<band>`
//! (satellite beam frequency), `/pp/<band>/<region>` (region-wide correction
//! stream), `pp/ip/L<level><lat><lon>/dict` (tile dictionary snapshot) and
//! dictionary-supplied node topics for the localized stream.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Tile grid span in degrees at level 0; halved per level.
const TILE_BASE_SPAN_DEG: f64 = 2.5;

/// Tile granularity levels supported by the distribution service.
pub const MIN_TILE_LEVEL: u8 = 0;
pub const MAX_TILE_LEVEL: u8 = 2;

pub fn key_topic(band: &str) -> String {
    format!("/pp/key/{band}")
}

pub fn frequency_topic(band: &str) -> String {
    format!("/pp/frequencies/{band}")
}

/// Region-wide correction stream topic, used when localized distribution is
/// disabled.
pub fn correction_topic(band: &str, region: &str) -> String {
    format!("/pp/{band}/{region}")
}

/// Tile dictionary topic for the grid cell containing the given position.
///
/// The position snaps to the nearest multiple of the level's grid span, so
/// the embedded coordinates name the cell center. Latitude is formatted as
/// degrees x 100 zero-padded to 4 digits, longitude to 5, each preceded by
/// its hemisphere letter.
pub fn tile_topic(level: u8, lat: f64, lon: f64) -> String {
    let scale = TILE_BASE_SPAN_DEG / f64::from(1u32 << level.min(MAX_TILE_LEVEL));
    let snapped_lat = (lat / scale).round() * scale;
    let snapped_lon = (lon / scale).round() * scale;

    let ns = if snapped_lat < 0.0 { 'S' } else { 'N' };
    let ew = if snapped_lon < 0.0 { 'W' } else { 'E' };
    let lat_scaled = (snapped_lat.abs() * 100.0).round() as u32;
    let lon_scaled = (snapped_lon.abs() * 100.0).round() as u32;

    format!("pp/ip/L{level}{ns}{lat_scaled:04}{ew}{lon_scaled:05}/dict")
}

/// One candidate distribution node from a tile dictionary.
///
/// The wire encoding is `<N|S><lat x 100, 4 digits><E|W><lon x 100, 5 digits>`,
/// e.g. `N4500W12250`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub code: String,
    pub lat: f64,
    pub lon: f64,
}

impl NodeEntry {
    pub fn decode(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 11 || !code.is_ascii() {
            bail!("node code `{code}`: expected 11 ASCII characters");
        }
        let lat_sign = match bytes[0] {
            b'N' => 1.0,
            b'S' => -1.0,
            other => bail!("node code `{code}`: bad latitude hemisphere {:?}", other as char),
        };
        let lon_sign = match bytes[5] {
            b'E' => 1.0,
            b'W' => -1.0,
            other => bail!("node code `{code}`: bad longitude hemisphere {:?}", other as char),
        };
        let lat_scaled: f64 = code[1..5]
            .parse::<u32>()
            .with_context(|| format!("node code `{code}`: latitude digits"))?
            .into();
        let lon_scaled: f64 = code[6..11]
            .parse::<u32>()
            .with_context(|| format!("node code `{code}`: longitude digits"))?
            .into();

        Ok(Self {
            code: code.to_string(),
            lat: lat_sign * lat_scaled / 100.0,
            lon: lon_sign * lon_scaled / 100.0,
        })
    }
}

/// Parsed tile dictionary snapshot.
///
/// Replaced wholesale on each dictionary update; the previous dictionary has
/// no residual meaning once a new tile payload arrives.
#[derive(Debug, Clone)]
pub struct NodeDictionary {
    /// Broker endpoint the dictionary was served for. A mismatch with the
    /// connected endpoint triggers an endpoint switch.
    pub endpoint: String,
    /// Topic prefix the selected node code is appended to.
    pub prefix: String,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Deserialize)]
struct TileDictPayload {
    endpoint: String,
    nodeprefix: String,
    nodes: Vec<String>,
}

impl NodeDictionary {
    /// Parse a tile dictionary payload. Entries that fail to decode are
    /// dropped with a warning rather than failing the whole snapshot.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: TileDictPayload =
            serde_json::from_slice(payload).context("tile dictionary payload")?;

        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for code in &raw.nodes {
            match NodeEntry::decode(code) {
                Ok(entry) => nodes.push(entry),
                Err(e) => tracing::warn!("skipping undecodable node entry: {e:#}"),
            }
        }
        if nodes.is_empty() {
            bail!("tile dictionary contained no decodable nodes");
        }

        Ok(Self {
            endpoint: raw.endpoint,
            prefix: raw.nodeprefix,
            nodes,
        })
    }

    /// Full topic for one of this dictionary's nodes.
    pub fn node_topic(&self, entry: &NodeEntry) -> String {
        format!("{}{}", self.prefix, entry.code)
    }
}

#[derive(Deserialize)]
struct KeyPayload {
    dynamickeys: KeyRing,
}

#[derive(Deserialize)]
struct KeyRing {
    current: CurrentValue,
}

#[derive(Deserialize)]
struct CurrentValue {
    value: String,
}

/// Extract the current dynamic key from a key-topic payload.
pub fn parse_key_payload(payload: &[u8]) -> Result<String> {
    let parsed: KeyPayload = serde_json::from_slice(payload).context("key payload")?;
    Ok(parsed.dynamickeys.current.value)
}

#[derive(Deserialize)]
struct FrequencyPayload {
    frequencies: std::collections::HashMap<String, FrequencyRegion>,
}

#[derive(Deserialize)]
struct FrequencyRegion {
    current: CurrentValue,
}

/// Extract the beam frequency for `region` from a frequency-topic payload,
/// converted from the published MHz string to integer Hz (the receiver only
/// accepts whole Hz).
pub fn parse_frequency_payload(payload: &[u8], region: &str) -> Result<u64> {
    let parsed: FrequencyPayload = serde_json::from_slice(payload).context("frequency payload")?;
    let region_entry = parsed
        .frequencies
        .get(region)
        .with_context(|| format!("no frequency published for region `{region}`"))?;
    let mhz: f64 = region_entry
        .current
        .value
        .parse()
        .with_context(|| format!("frequency value `{}`", region_entry.current.value))?;
    Ok((mhz * 1_000_000.0).round() as u64)
}
