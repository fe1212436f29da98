//! Flat CSV export of observations.
//!
//! One row per observation in sequence order. Fields are quoted per
//! RFC 4180 when they contain a comma, quote, or line break; raw records
//! routinely do (manufacturer groups are comma-separated).

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::types::{BeaconError, CellKey, Observation, Result};

pub const EXPORT_HEADER: [&str; 12] = [
    "address",
    "name",
    "rssi",
    "txPower",
    "isConnectable",
    "local_x",
    "local_y",
    "local_z",
    "latitude",
    "longitude",
    "timestamp",
    "rawData",
];

/// One exported observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub address: String,
    pub name: String,
    pub rssi: i32,
    #[serde(rename = "txPower")]
    pub tx_power: i32,
    #[serde(rename = "isConnectable")]
    pub is_connectable: bool,
    pub local_x: f32,
    pub local_y: f32,
    pub local_z: f32,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: f64,
    #[serde(rename = "rawData")]
    pub raw_data: String,
}

impl ExportRow {
    pub fn from_observation(obs: &Observation, address: &str) -> Self {
        ExportRow {
            address: address.to_string(),
            name: obs.display_name.clone(),
            rssi: obs.rssi,
            tx_power: obs.tx_power,
            is_connectable: obs.is_connectable,
            local_x: obs.position.x,
            local_y: obs.position.y,
            local_z: obs.position.z,
            latitude: obs.geo.lat,
            longitude: obs.geo.lon,
            timestamp: obs.timestamp,
            raw_data: obs.raw_record.to_string(),
        }
    }
}

/// Export row plus the keys persistence needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub sequence_id: u64,
    pub cell: CellKey,
    #[serde(flatten)]
    pub row: ExportRow,
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn csv_error(e: csv::Error) -> BeaconError {
    let line = e.position().map_or(0, |p| p.line() as usize);
    let reason = e.to_string();
    match e.into_kind() {
        csv::ErrorKind::Io(io) => BeaconError::Io(io),
        _ => BeaconError::InvalidCsv { line, reason },
    }
}

/// Write header and rows to `out`.
///
/// The header is written even when there are no rows.
pub fn write_csv<'a, W: Write>(
    out: &mut W,
    rows: impl IntoIterator<Item = &'a ExportRow>,
) -> Result<usize> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(out);
    wtr.write_record(EXPORT_HEADER).map_err(csv_error)?;
    let mut count = 0;
    for row in rows {
        wtr.serialize(row).map_err(csv_error)?;
        count += 1;
    }
    wtr.flush()?;
    Ok(count)
}

pub fn to_csv_string<'a>(rows: impl IntoIterator<Item = &'a ExportRow>) -> String {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail
    let _ = write_csv(&mut buf, rows);
    String::from_utf8_lossy(&buf).into_owned()
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Parse an export produced by `write_csv`.
pub fn parse_csv(text: &str) -> Result<Vec<ExportRow>> {
    let mut rdr = csv::Reader::from_reader(text.as_bytes());

    let header = rdr.headers().map_err(csv_error)?;
    if header.is_empty() {
        return Ok(Vec::new());
    }
    if header.iter().ne(EXPORT_HEADER) {
        return Err(BeaconError::InvalidCsv {
            line: 1,
            reason: "unexpected header".into(),
        });
    }

    rdr.deserialize::<ExportRow>()
        .map(|row| row.map_err(csv_error))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
