//! Position math for localized correction distribution
//!
//! Great-circle distances pick the nearest distribution node; GGA sentence
//! parsing recovers the receiver's position from the raw device stream; the
//! movement threshold decides when a position change is large enough to
//! re-evaluate the tile subscription.

/// Receiver position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

/// Hysteresis thresholds for tile reselection, in degrees.
///
/// The longitude threshold scales with 1/cos(latitude) so the trigger
/// distance stays roughly constant on the ground as meridians converge;
/// latitude keeps the fixed base. Recomputed whenever the position is
/// accepted as moved.
#[derive(Debug, Clone, Copy)]
pub struct MoveThreshold {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

/// Base reselection threshold: 0.05 deg of latitude (~5.5 km).
const BASE_THRESHOLD_DEG: f64 = 0.05;

impl MoveThreshold {
    pub fn at_latitude(lat: f64) -> Self {
        // cos() goes to zero at the poles; floor it so the threshold stays
        // finite (a receiver at 89.9N re-selects on any longitude change,
        // which is the right behavior there anyway).
        let cos_lat = lat.to_radians().cos().max(0.01);
        Self {
            lat_deg: BASE_THRESHOLD_DEG,
            lon_deg: BASE_THRESHOLD_DEG / cos_lat,
        }
    }

    /// True when `to` is far enough from `from` to count as movement.
    pub fn exceeded(&self, from: Position, to: Position) -> bool {
        (to.lat - from.lat).abs() > self.lat_deg || (to.lon - from.lon).abs() > self.lon_deg
    }
}

/// Calculate the distance between two points using the Haversine formula
/// Returns distance in meters
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0; // Earth's radius in meters

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Convert an NMEA `ddmm.mmmm`/`dddmm.mmmm` coordinate plus hemisphere letter
/// to decimal degrees. `degree_digits` is 2 for latitude, 3 for longitude.
fn nmea_to_decimal(coord: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if coord.len() <= degree_digits || !coord.is_ascii() {
        return None;
    }
    let degrees: f64 = coord[..degree_digits].parse().ok()?;
    let minutes: f64 = coord[degree_digits..].parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

/// Parse one GGA sentence into a position.
///
/// Returns `None` for sentences without a fix (empty coordinate fields) or
/// with malformed coordinates.
pub fn parse_gga(sentence: &str) -> Option<Position> {
    let body = sentence.split('*').next().unwrap_or(sentence).trim_end();
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 6 || !fields[0].ends_with("GGA") {
        return None;
    }

    let lat = nmea_to_decimal(fields[2], fields[3], 2)?;
    let lon = nmea_to_decimal(fields[4], fields[5], 3)?;
    Some(Position { lat, lon })
}

/// Find the freshest GGA sentence in a raw device chunk.
///
/// The primary channel interleaves binary ephemeris with NMEA text, so this
/// scans for `$--GGA` starts and takes the last complete sentence.
pub fn extract_gga(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let mut latest = None;
    for (idx, _) in text.match_indices('$') {
        let rest = &text[idx..];
        let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
        let candidate = &rest[..end];
        // Talker is two characters between `$` and the sentence type; compare
        // bytes so lossy-decoded noise can't split a char boundary
        if candidate.len() > 6 && candidate.as_bytes().get(3..6) == Some(b"GGA".as_slice()) {
            latest = Some(candidate.to_string());
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_is_symmetric_and_zero_on_identity() {
        let d1 = haversine_distance(48.85, 2.35, 50.73, 7.09);
        let d2 = haversine_distance(50.73, 7.09, 48.85, 2.35);
        assert!((d1 - d2).abs() < 1e-6);
        assert_eq!(haversine_distance(45.0, -122.5, 45.0, -122.5), 0.0);
    }

    #[test]
    fn haversine_known_distance() {
        // Paris <-> Bonn is roughly 400 km
        let d = haversine_distance(48.8566, 2.3522, 50.7374, 7.0982);
        assert!((350_000.0..450_000.0).contains(&d), "got {d}");
    }

    #[test]
    fn gga_parses_to_decimal_degrees() {
        let pos = parse_gga("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47")
            .unwrap();
        assert!((pos.lat - (48.0 + 7.038 / 60.0)).abs() < 1e-9);
        assert!((pos.lon - (11.0 + 31.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn gga_southern_western_hemispheres_negate() {
        let pos = parse_gga("$GNGGA,120000,4500.000,S,12230.000,W,1,10,0.8,12.0,M,0.0,M,,*55")
            .unwrap();
        assert!(pos.lat < 0.0);
        assert!(pos.lon < 0.0);
        assert!((pos.lat + 45.0).abs() < 1e-9);
        assert!((pos.lon + 122.5).abs() < 1e-9);
    }

    #[test]
    fn gga_without_fix_is_none() {
        assert!(parse_gga("$GPGGA,123519,,,,,0,00,,,M,,M,,*66").is_none());
        assert!(parse_gga("$GPRMC,123519,A,4807.038,N,01131.000,E*6A").is_none());
        assert!(parse_gga("garbage").is_none());
    }

    #[test]
    fn extract_gga_takes_last_sentence_from_mixed_chunk() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&[0xd3, 0x00, 0x13, 0x3e]); // binary noise
        chunk.extend_from_slice(b"$GPGGA,1,4800.000,N,01100.000,E,1,08,0.9,1.0,M,1.0,M,,*47\r\n");
        chunk.extend_from_slice(b"$GPZDA,123519,22,03,2024,00,00*55\r\n");
        chunk.extend_from_slice(b"$GNGGA,2,4810.000,N,01110.000,E,1,08,0.9,1.0,M,1.0,M,,*47\r\n");

        let sentence = extract_gga(&chunk).unwrap();
        assert!(sentence.starts_with("$GNGGA,2"));
    }

    #[test]
    fn threshold_scales_longitude_with_latitude() {
        let equator = MoveThreshold::at_latitude(0.0);
        let north = MoveThreshold::at_latitude(60.0);
        assert!((equator.lon_deg - equator.lat_deg).abs() < 1e-9);
        // cos(60) = 0.5 -> longitude threshold doubles
        assert!((north.lon_deg - 2.0 * north.lat_deg).abs() < 1e-6);
        assert_eq!(north.lat_deg, equator.lat_deg);
    }

    #[test]
    fn threshold_exceeded_checks_each_axis() {
        let thr = MoveThreshold::at_latitude(0.0);
        let origin = Position { lat: 10.0, lon: 20.0 };
        assert!(!thr.exceeded(origin, Position { lat: 10.01, lon: 20.01 }));
        assert!(thr.exceeded(origin, Position { lat: 10.06, lon: 20.0 }));
        assert!(thr.exceeded(origin, Position { lat: 10.0, lon: 19.94 }));
    }
}
