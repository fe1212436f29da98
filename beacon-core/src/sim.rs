//! Simulated beacons for exercising the pipeline without a radio.
//!
//! Each emitter sits at a fixed position. Its RSSI at the observer falls
//! linearly from `max_rssi` at 0 m to `min_rssi` at `max_distance`, and is
//! pinned at `min_rssi` beyond that. Tx power and the connectable flag are
//! random per advertisement, like a real scanner sees from cheap tags.
//!
//! The observer does a seeded random walk, so a given seed always yields
//! the same capture.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::capture::CaptureLine;
use crate::manufacturer::encode_group;
use crate::record::RecordBuilder;
use crate::types::{GeoCoord, Position};

/// Apple's Bluetooth SIG company id.
const APPLE_COMPANY_ID: i32 = 76;

/// Proximity-tag status payload.
const TAG_PAYLOAD: [u8; 9] = [0x12, 0x19, 0x10, 0x05, 0x03, 0x18, 0x1C, 0x28, 0xB6];

/// iBeacon prefix.
const IBEACON_PAYLOAD: [u8; 4] = [0x02, 0x15, 0x01, 0x02];

#[derive(Debug, Clone)]
pub struct SimulatedEmitter {
    pub address: String,
    pub name: String,
    pub position: Position,
    pub max_rssi: i32,
    pub min_rssi: i32,
    pub strength_multiplier: f32,
    /// Meters.
    pub max_distance: f32,
    pub manufacturer_data: String,
}

impl SimulatedEmitter {
    pub fn new(address: &str, name: &str, position: Position) -> Self {
        SimulatedEmitter {
            address: address.to_string(),
            name: name.to_string(),
            position,
            max_rssi: -35,
            min_rssi: -110,
            strength_multiplier: 1.0,
            max_distance: 20.0,
            manufacturer_data: String::new(),
        }
    }

    pub fn with_manufacturer_data(mut self, company_id: i32, payload: &[u8]) -> Self {
        self.manufacturer_data = encode_group(company_id, payload);
        self
    }

    /// Expected RSSI at `observer`.
    pub fn rssi_at(&self, observer: Position) -> i32 {
        let d = self.position.distance(&observer).clamp(0.0, self.max_distance);
        let t = if self.max_distance > 0.0 { d / self.max_distance } else { 1.0 };
        let rssi = self.max_rssi as f32 + (self.min_rssi - self.max_rssi) as f32 * t;
        (rssi * self.strength_multiplier) as i32
    }

    /// One full advertisement record as heard from `observer`.
    pub fn advertise<R: Rng>(&self, observer: Position, timestamp_ms: i64, rng: &mut R) -> String {
        RecordBuilder::new(
            &self.address,
            &self.name,
            self.rssi_at(observer),
            rng.gen_range(-10..10),
            rng.gen_bool(0.5),
        )
        .manufacturer_data(&self.manufacturer_data)
        .timestamp_ms(timestamp_ms)
        .encode()
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub emitters: usize,
    /// Half-width of the square area emitters are placed in, meters.
    pub area: f32,
    /// Observer step length per tick, meters.
    pub stride: f32,
    /// Seconds between ticks.
    pub period: f64,
    pub seed: u64,
    /// Every n-th emitter carries a proximity-tag payload. 0 disables.
    pub tag_every: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            emitters: 5,
            area: 10.0,
            stride: 0.25,
            period: 0.1,
            seed: 1,
            tag_every: 3,
        }
    }
}

pub struct Simulation {
    config: SimulationConfig,
    emitters: Vec<SimulatedEmitter>,
    observer: Position,
    time: f64,
    rng: StdRng,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let a = config.area.max(0.1);
        let emitters = (0..config.emitters)
            .map(|i| {
                let position = Position::new(rng.gen_range(-a..a), rng.gen_range(-a..a), 0.0);
                let emitter = SimulatedEmitter::new(
                    &format!("5A:1D:00:00:{:02X}:{:02X}", (i >> 8) & 0xFF, i & 0xFF),
                    &format!("sim-{i}"),
                    position,
                );
                if config.tag_every > 0 && i % config.tag_every == 0 {
                    emitter.with_manufacturer_data(APPLE_COMPANY_ID, &TAG_PAYLOAD)
                } else {
                    emitter.with_manufacturer_data(APPLE_COMPANY_ID, &IBEACON_PAYLOAD)
                }
            })
            .collect();

        Simulation {
            config,
            emitters,
            observer: Position::default(),
            time: 0.0,
            rng,
        }
    }

    pub fn emitters(&self) -> &[SimulatedEmitter] {
        &self.emitters
    }

    pub fn observer(&self) -> Position {
        self.observer
    }

    /// Advance one tick: move the observer, then every emitter advertises once.
    pub fn step(&mut self) -> Vec<CaptureLine> {
        let heading: f32 = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let a = self.config.area.max(0.1);
        self.observer = Position::new(
            (self.observer.x + heading.cos() * self.config.stride).clamp(-a, a),
            (self.observer.y + heading.sin() * self.config.stride).clamp(-a, a),
            0.0,
        );

        let mut lines = Vec::with_capacity(self.emitters.len());
        for emitter in &self.emitters {
            let jitter = self.rng.gen_range(-0.5f64..0.5) * self.config.period;
            let t = (self.time + jitter).max(0.0);
            let record = emitter.advertise(self.observer, (t * 1000.0) as i64, &mut self.rng);
            lines.push(CaptureLine {
                position: self.observer,
                geo: GeoCoord::UNAVAILABLE,
                timestamp: Some(t),
                record,
            });
        }
        self.time += self.config.period;
        lines
    }

    /// Run `steps` ticks and collect every capture line.
    pub fn run(&mut self, steps: usize) -> Vec<CaptureLine> {
        (0..steps).flat_map(|_| self.step()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
