//! beacon-core: BLE advertisement decoding and spatial signal-strength store.
//!
//! No network, no database. This crate is the shared core used by the
//! `beacon` binary in `beacon-server` for its CLI, HTTP API, and SQLite
//! archive.

pub mod capture;
pub mod company;
pub mod config;
pub mod export;
pub mod grid;
pub mod manufacturer;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod sim;
pub mod store;
pub mod types;

// Re-export commonly used types at crate root
pub use capture::{CaptureClock, CaptureLine};
pub use company::CompanyTable;
pub use export::{parse_csv, to_csv_string, write_csv, ExportRecord, ExportRow};
pub use grid::GridQuantizer;
pub use manufacturer::{
    decode_all_manufacturer_data, decode_manufacturer_data, detect_proximity_tag, encode_group,
};
pub use pipeline::Pipeline;
pub use record::{decode, encode_record, AdvertisementRecord, RecordBuilder, RecordField};
pub use registry::AddressRegistry;
pub use sim::{SimulatedEmitter, Simulation, SimulationConfig};
pub use store::{
    percent_of, percent_of_clamped, CellSummary, DeviceSummary, SignalStore, StoreConfig, StoreEvent,
};
pub use types::*;
