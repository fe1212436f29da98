//! Shared types, error enums, and observation records for beacon-core.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection reasons for a raw advertisement record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// All errors produced by beacon-core.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("invalid csv at line {line}: {reason}")]
    InvalidCsv { line: usize, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BeaconError>;

// ---------------------------------------------------------------------------
// Signal range
// ---------------------------------------------------------------------------

/// Weakest signal considered. Doubles as the floor sentinel for empty queries.
pub const DEFAULT_MIN_RSSI: i32 = -100;

/// Strongest signal considered when normalizing.
pub const DEFAULT_MAX_RSSI: i32 = -30;

/// Samples used by the live windowed reading.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// RSSI bounds used for normalization and as the empty-query floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRange {
    pub min_rssi: i32,
    pub max_rssi: i32,
}

impl SignalRange {
    pub fn new(min_rssi: i32, max_rssi: i32) -> Self {
        SignalRange { min_rssi, max_rssi }
    }

    /// Value returned when a query has no matching observations.
    pub fn floor(&self) -> i32 {
        self.min_rssi
    }
}

impl Default for SignalRange {
    fn default() -> Self {
        SignalRange::new(DEFAULT_MIN_RSSI, DEFAULT_MAX_RSSI)
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Observer position in local (scene) coordinates. `z` is the vertical axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Position { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Geodetic coordinate. `(0, 0)` means no fix was available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    pub lat: f64,
    pub lon: f64,
}

impl GeoCoord {
    pub const UNAVAILABLE: GeoCoord = GeoCoord { lat: 0.0, lon: 0.0 };

    pub fn new(lat: f64, lon: f64) -> Self {
        GeoCoord { lat, lon }
    }

    pub fn is_available(&self) -> bool {
        self.lat != 0.0 || self.lon != 0.0
    }
}

/// Quantized 3D grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        CellKey { x, y, z }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One advertisement heard at one place and time. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub sequence_id: u64,
    pub address_id: u32,
    pub display_name: String,
    pub rssi: i32,
    pub tx_power: i32,
    pub is_connectable: bool,
    pub position: Position,
    pub geo: GeoCoord,
    /// Seconds since pipeline start.
    pub timestamp: f64,
    /// Original record, shared with the store's raw-record archive.
    pub raw_record: Arc<str>,
}

// ---------------------------------------------------------------------------
// Manufacturer data
// ---------------------------------------------------------------------------

/// Decoded `<company_id>:<base64>` manufacturer block.
///
/// `company_id == 0` or an empty payload means the block was absent or
/// could not be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompanyDescriptor {
    pub company_id: i32,
    pub payload: Vec<u8>,
}

impl CompanyDescriptor {
    pub fn is_empty(&self) -> bool {
        self.company_id == 0 && self.payload.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Encode bytes as uppercase hex string.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x12, 0x19, 0x0A]), "12190A");
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn test_signal_range_floor() {
        let range = SignalRange::default();
        assert_eq!(range.floor(), -100);
        assert_eq!(range.max_rssi, -30);
    }

    #[test]
    fn test_geo_sentinel() {
        assert!(!GeoCoord::UNAVAILABLE.is_available());
        assert!(GeoCoord::new(35.5, -82.5).is_available());
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cell_key_display() {
        assert_eq!(CellKey::new(1, -2, 0).to_string(), "(1, -2, 0)");
    }

    #[test]
    fn test_decode_error_message() {
        let err = DecodeError::MalformedRecord("expected at least 5 fields, got 3".into());
        assert_eq!(
            err.to_string(),
            "malformed record: expected at least 5 fields, got 3"
        );
        let wrapped: BeaconError = err.into();
        assert!(matches!(wrapped, BeaconError::Decode(_)));
    }
}
