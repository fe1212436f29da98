//! Parse pipe-delimited advertisement records into typed fields.
//!
//! Record layout, as produced by the platform scanning bridge:
//!
//! ```text
//! address|name|rssi|txPower|isConnectable|deviceType|primaryPhy|secondaryPhy|
//! advertisingSetId|periodicInterval|manufacturerData|serviceUuids|serviceData|
//! advertisingFlags|rawBytes|timestampMs
//! ```
//!
//! Only the first five fields are required. The rest are kept in the raw
//! string and read on demand. Unavailable numbers are `-1`, unavailable
//! strings are empty.

use crate::types::DecodeError;

/// Field separator. Advertiser names have `|` replaced before formatting.
pub const DELIMITER: char = '|';

/// Fields a record must carry to be accepted.
pub const REQUIRED_FIELDS: usize = 5;

/// Fields in a complete record.
pub const RECORD_FIELDS: usize = 16;

// ---------------------------------------------------------------------------
// Field layout
// ---------------------------------------------------------------------------

/// Position of each field in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Address = 0,
    Name = 1,
    Rssi = 2,
    TxPower = 3,
    IsConnectable = 4,
    DeviceType = 5,
    PrimaryPhy = 6,
    SecondaryPhy = 7,
    AdvertisingSetId = 8,
    PeriodicInterval = 9,
    ManufacturerData = 10,
    ServiceUuids = 11,
    ServiceData = 12,
    AdvertisingFlags = 13,
    RawBytes = 14,
    TimestampMs = 15,
}

impl RecordField {
    pub fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// Decoded record
// ---------------------------------------------------------------------------

/// The typed head of a record plus the untouched raw string.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementRecord {
    pub address: String,
    pub name: String,
    pub rssi: i32,
    pub tx_power: i32,
    pub is_connectable: bool,
    pub raw: String,
}

impl AdvertisementRecord {
    /// Raw text of any field, or `None` if the record is too short.
    pub fn field(&self, field: RecordField) -> Option<&str> {
        self.raw.split(DELIMITER).nth(field.index())
    }

    /// Number of fields in the raw record.
    pub fn field_count(&self) -> usize {
        self.raw.split(DELIMITER).count()
    }

    /// Manufacturer-data sub-field, if present and non-empty.
    pub fn manufacturer_data(&self) -> Option<&str> {
        self.field(RecordField::ManufacturerData)
            .filter(|s| !s.is_empty())
    }

    /// Scanner timestamp in milliseconds, if present and available.
    pub fn timestamp_ms(&self) -> Option<i64> {
        optional_number(self.field(RecordField::TimestampMs)?)
    }

    /// Advertising set ID, if the scanner reported one.
    pub fn advertising_set_id(&self) -> Option<i64> {
        optional_number(self.field(RecordField::AdvertisingSetId)?)
    }
}

/// Parse a numeric pass-through field; `-1` and garbage both mean unavailable.
fn optional_number(val: &str) -> Option<i64> {
    match val.trim().parse::<i64>() {
        Ok(-1) | Err(_) => None,
        Ok(v) => Some(v),
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode a raw record.
///
/// Fails with `MalformedRecord` when fewer than five fields are present or
/// when `rssi`, `txPower`, or `isConnectable` do not parse.
pub fn decode(record: &str) -> Result<AdvertisementRecord, DecodeError> {
    let fields: Vec<&str> = record.split(DELIMITER).collect();
    if fields.len() < REQUIRED_FIELDS {
        return Err(DecodeError::MalformedRecord(format!(
            "expected at least {REQUIRED_FIELDS} fields, got {}",
            fields.len()
        )));
    }

    let rssi = parse_int(fields[RecordField::Rssi.index()], "rssi")?;
    let tx_power = parse_int(fields[RecordField::TxPower.index()], "txPower")?;
    let is_connectable = parse_bool(fields[RecordField::IsConnectable.index()])?;

    Ok(AdvertisementRecord {
        address: fields[RecordField::Address.index()].to_string(),
        name: fields[RecordField::Name.index()].to_string(),
        rssi,
        tx_power,
        is_connectable,
        raw: record.to_string(),
    })
}

fn parse_int(val: &str, name: &str) -> Result<i32, DecodeError> {
    val.trim()
        .parse::<i32>()
        .map_err(|_| DecodeError::MalformedRecord(format!("invalid {name} value {val:?}")))
}

fn parse_bool(val: &str) -> Result<bool, DecodeError> {
    let v = val.trim();
    if v.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if v.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(DecodeError::MalformedRecord(format!(
            "invalid isConnectable value {val:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Fields needed to format a full 16-field record.
///
/// Optional numbers left as `None` are written as `-1`, optional strings as
/// empty, matching what the scanning bridge emits.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    pub address: String,
    pub name: String,
    pub rssi: i32,
    pub tx_power: i32,
    pub is_connectable: bool,
    pub device_type: Option<i32>,
    pub advertising_set_id: Option<i32>,
    pub manufacturer_data: String,
    pub service_uuids: String,
    pub timestamp_ms: Option<i64>,
}

impl RecordBuilder {
    pub fn new(address: &str, name: &str, rssi: i32, tx_power: i32, is_connectable: bool) -> Self {
        RecordBuilder {
            address: address.to_string(),
            name: name.to_string(),
            rssi,
            tx_power,
            is_connectable,
            ..Default::default()
        }
    }

    pub fn manufacturer_data(mut self, data: &str) -> Self {
        self.manufacturer_data = data.to_string();
        self
    }

    pub fn timestamp_ms(mut self, ts: i64) -> Self {
        self.timestamp_ms = Some(ts);
        self
    }

    /// Format as a pipe-delimited record.
    pub fn encode(&self) -> String {
        let fields = [
            self.address.replace(DELIMITER, "_"),
            self.name.replace(DELIMITER, "_"),
            self.rssi.to_string(),
            self.tx_power.to_string(),
            self.is_connectable.to_string(),
            self.device_type.unwrap_or(-1).to_string(),
            "-1".into(), // primary PHY
            "-1".into(), // secondary PHY
            self.advertising_set_id.unwrap_or(-1).to_string(),
            "-1".into(), // periodic interval
            self.manufacturer_data.clone(),
            self.service_uuids.clone(),
            String::new(), // service data
            "-1".into(),   // advertising flags
            String::new(), // raw bytes
            self.timestamp_ms.unwrap_or(-1).to_string(),
        ];
        fields.join("|")
    }
}

/// Format a record the way the scanning bridge does.
pub fn encode_record(builder: &RecordBuilder) -> String {
    builder.encode()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_minimal_record() {
        let rec = decode("AA:BB:CC:DD:EE:FF|MyDevice|-70|-4|true").unwrap();
        assert_eq!(rec.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(rec.name, "MyDevice");
        assert_eq!(rec.rssi, -70);
        assert_eq!(rec.tx_power, -4);
        assert!(rec.is_connectable);
        assert_eq!(rec.raw, "AA:BB:CC:DD:EE:FF|MyDevice|-70|-4|true");
        assert_eq!(rec.manufacturer_data(), None);
        assert_eq!(rec.timestamp_ms(), None);
    }

    #[test]
    fn test_decode_too_few_fields() {
        let err = decode("AA:BB:CC:DD:EE:FF|MyDevice|-70").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedRecord(_)));
    }

    #[test]
    fn test_decode_empty_string() {
        assert!(decode("").is_err());
    }

    #[test]
    fn test_decode_bad_rssi() {
        assert!(decode("AA|n|strong|-4|true").is_err());
        assert!(decode("AA|n||-4|true").is_err());
    }

    #[test]
    fn test_decode_bad_tx_power() {
        assert!(decode("AA|n|-70|4.5|true").is_err());
    }

    #[test]
    fn test_decode_bad_bool() {
        assert!(decode("AA|n|-70|-4|yes").is_err());
        assert!(decode("AA|n|-70|-4|1").is_err());
    }

    #[test]
    fn test_decode_bool_case_and_whitespace() {
        assert!(decode("AA|n|-70|-4|True").unwrap().is_connectable);
        assert!(!decode("AA|n|-70|-4| FALSE ").unwrap().is_connectable);
        assert_eq!(decode("AA|n| -70 |-4|false").unwrap().rssi, -70);
    }

    #[test]
    fn test_decode_full_record() {
        let raw = "C0:FF:EE:00:11:22|Tag|-61|-12|false|0|1|-1|-1|-1|76:EhkQBQMYHCi2|0000FD6F-0000-1000-8000-00805F9B34FB||-1||1700000000123";
        let rec = decode(raw).unwrap();
        assert_eq!(rec.field_count(), RECORD_FIELDS);
        assert_eq!(rec.manufacturer_data(), Some("76:EhkQBQMYHCi2"));
        assert_eq!(rec.timestamp_ms(), Some(1700000000123));
        assert_eq!(rec.advertising_set_id(), None);
        assert_eq!(rec.field(RecordField::PrimaryPhy), Some("1"));
        assert_eq!(rec.field(RecordField::ServiceData), Some(""));
    }

    #[test]
    fn test_empty_name_allowed() {
        let rec = decode("AA||-70|-4|true").unwrap();
        assert_eq!(rec.name, "");
    }

    #[test]
    fn test_builder_encode_decodes() {
        let raw = RecordBuilder::new("AA:BB", "My|Beacon", -55, 3, true)
            .manufacturer_data("76:EhkQBQMYHCi2")
            .timestamp_ms(42)
            .encode();
        let rec = decode(&raw).unwrap();
        assert_eq!(rec.field_count(), RECORD_FIELDS);
        assert_eq!(rec.name, "My_Beacon");
        assert_eq!(rec.rssi, -55);
        assert_eq!(rec.tx_power, 3);
        assert_eq!(rec.manufacturer_data(), Some("76:EhkQBQMYHCi2"));
        assert_eq!(rec.timestamp_ms(), Some(42));
    }
}
