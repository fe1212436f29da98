//! Capture lines: a raw record plus where it was heard.
//!
//! ```text
//! x,y,z[,lat,lon[,t]];<raw record>
//! ```
//!
//! The prefix ends at the first `;`. Raw records never contain `;` in the
//! prefix position, but may contain it later (advertiser names).

use std::fmt;

use crate::types::{BeaconError, GeoCoord, Position, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureLine {
    pub position: Position,
    pub geo: GeoCoord,
    /// Seconds; `None` lets the reader assign one.
    pub timestamp: Option<f64>,
    pub record: String,
}

impl CaptureLine {
    /// Parse one line. `line_no` is only used in error messages.
    pub fn parse(line: &str, line_no: usize) -> Result<Self> {
        let invalid = |reason: String| BeaconError::InvalidCsv {
            line: line_no,
            reason,
        };

        let (prefix, record) = line
            .split_once(';')
            .ok_or_else(|| invalid("missing ';' between position and record".into()))?;

        let nums: Vec<&str> = prefix.split(',').map(str::trim).collect();
        if !matches!(nums.len(), 3 | 5 | 6) {
            return Err(invalid(format!(
                "expected 3, 5 or 6 position values, got {}",
                nums.len()
            )));
        }

        let num = |i: usize| -> Result<f64> {
            nums[i]
                .parse::<f64>()
                .map_err(|_| invalid(format!("invalid number {:?}", nums[i])))
        };

        let position = Position::new(num(0)? as f32, num(1)? as f32, num(2)? as f32);
        let geo = if nums.len() >= 5 {
            GeoCoord::new(num(3)?, num(4)?)
        } else {
            GeoCoord::UNAVAILABLE
        };
        let timestamp = if nums.len() == 6 { Some(num(5)?) } else { None };

        Ok(CaptureLine {
            position,
            geo,
            timestamp,
            record: record.trim_end_matches(['\r', '\n']).to_string(),
        })
    }
}

impl fmt::Display for CaptureLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.position;
        write!(f, "{},{},{}", p.x, p.y, p.z)?;
        match self.timestamp {
            Some(t) => write!(f, ",{},{},{t}", self.geo.lat, self.geo.lon)?,
            None if self.geo.is_available() => write!(f, ",{},{}", self.geo.lat, self.geo.lon)?,
            None => {}
        }
        write!(f, ";{}", self.record)
    }
}

/// Assigns timestamps to lines that lack one.
///
/// Untimed lines advance by `step` seconds past the last timestamp seen.
#[derive(Debug, Clone)]
pub struct CaptureClock {
    last: f64,
    step: f64,
}

impl CaptureClock {
    pub const DEFAULT_STEP: f64 = 0.1;

    pub fn new(step: f64) -> Self {
        CaptureClock { last: -step, step }
    }

    pub fn stamp(&mut self, line: &CaptureLine) -> f64 {
        let t = line.timestamp.unwrap_or(self.last + self.step);
        self.last = t;
        t
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        CaptureClock::new(CaptureClock::DEFAULT_STEP)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position_only() {
        let line = CaptureLine::parse("0.5,1.25,0;AA|n|-70|-4|true", 1).unwrap();
        assert_eq!(line.position, Position::new(0.5, 1.25, 0.0));
        assert!(!line.geo.is_available());
        assert_eq!(line.timestamp, None);
        assert_eq!(line.record, "AA|n|-70|-4|true");
    }

    #[test]
    fn test_parse_with_geo_and_time() {
        let line = CaptureLine::parse("1,2,3,35.59,-82.55,12.5;AA|n;x|-70|-4|true", 1).unwrap();
        assert_eq!(line.geo, GeoCoord::new(35.59, -82.55));
        assert_eq!(line.timestamp, Some(12.5));
        // only the first ';' splits
        assert_eq!(line.record, "AA|n;x|-70|-4|true");
    }

    #[test]
    fn test_parse_errors() {
        assert!(CaptureLine::parse("AA|n|-70|-4|true", 1).is_err());
        assert!(CaptureLine::parse("1,2;AA|n|-70|-4|true", 1).is_err());
        assert!(CaptureLine::parse("1,2,3,4;AA|n|-70|-4|true", 1).is_err());
        let err = CaptureLine::parse("1,x,3;AA", 7).unwrap_err();
        assert!(matches!(err, BeaconError::InvalidCsv { line: 7, .. }));
    }

    #[test]
    fn test_display_parses_back() {
        let line = CaptureLine {
            position: Position::new(0.25, -1.5, 0.0),
            geo: GeoCoord::UNAVAILABLE,
            timestamp: Some(3.5),
            record: "AA|n|-70|-4|true".into(),
        };
        let text = line.to_string();
        assert_eq!(text, "0.25,-1.5,0,0,0,3.5;AA|n|-70|-4|true");
        assert_eq!(CaptureLine::parse(&text, 1).unwrap(), line);
    }

    #[test]
    fn test_clock_fills_gaps() {
        let mut clock = CaptureClock::default();
        let untimed = CaptureLine::parse("0,0,0;AA|n|-70|-4|true", 1).unwrap();
        let timed = CaptureLine::parse("0,0,0,0,0,5;AA|n|-70|-4|true", 2).unwrap();
        assert_eq!(clock.stamp(&untimed), 0.0);
        assert!((clock.stamp(&untimed) - 0.1).abs() < 1e-9);
        assert_eq!(clock.stamp(&timed), 5.0);
        assert!((clock.stamp(&untimed) - 5.1).abs() < 1e-9);
    }
}
