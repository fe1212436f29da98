//! Spatial signal-strength store.
//!
//! Pure state: no I/O, no locking. The pipeline wraps a `SignalStore` in a
//! lock and publishes the `StoreEvent`s it returns.
//!
//! Holds, per grid cell, every observation heard there in arrival order,
//! plus two secondary structures kept in step with the cells:
//! - an archive `sequence_id -> (address_id, cell, raw record)`, ordered;
//! - a per-address index with running RSSI totals for O(1) store-wide means.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::export::{ExportRecord, ExportRow};
use crate::grid::GridQuantizer;
use crate::record::AdvertisementRecord;
use crate::registry::AddressRegistry;
use crate::types::*;

/// Filter values that select the global view.
pub const GLOBAL_FILTER_ALIASES: [&str; 2] = ["", "default"];

// ---------------------------------------------------------------------------
// Events (output)
// ---------------------------------------------------------------------------

/// Notifications produced by store mutations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// An observation was appended to a cell.
    ObservationLogged {
        address: String,
        cell: CellKey,
        observation: Observation,
    },
    /// The display filter changed. `None` is the global view.
    FilterChanged { address: Option<String> },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    pub quantizer: GridQuantizer,
    pub range: SignalRange,
    /// Oldest observations are evicted past this many per cell. `None` keeps all.
    pub max_history_per_cell: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            quantizer: GridQuantizer::default(),
            range: SignalRange::default(),
            max_history_per_cell: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Per-cell aggregates for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CellSummary {
    pub cell: CellKey,
    pub center: Position,
    pub count: usize,
    pub average: i32,
    pub windowed: i32,
    /// `windowed` normalized and clamped, ignoring the active filter.
    pub windowed_percent: f32,
}

/// Per-address aggregates for device listings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub address_id: u32,
    pub address: String,
    pub name: String,
    pub observations: u64,
    pub average_rssi: i32,
    pub cells: usize,
    pub last_seen: f64,
    #[serde(skip)]
    pub last_raw: Arc<str>,
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    address_id: u32,
    cell: CellKey,
    raw_record: Arc<str>,
}

#[derive(Debug, Clone)]
struct AddressIndex {
    entries: BTreeMap<u64, CellKey>, // sequence_id -> cell
    rssi_sum: i64,
    count: u64,
    last_name: String,
    last_seen: f64,
    last_raw: Arc<str>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SignalStore {
    config: StoreConfig,
    registry: AddressRegistry,
    cells: HashMap<CellKey, VecDeque<Observation>>,
    archive: BTreeMap<u64, ArchiveEntry>,
    by_address: HashMap<u32, AddressIndex>,
    next_sequence: u64,
    active_filter: Option<String>,
}

impl Default for SignalStore {
    fn default() -> Self {
        SignalStore::new(StoreConfig::default())
    }
}

impl SignalStore {
    pub fn new(config: StoreConfig) -> Self {
        SignalStore {
            config,
            registry: AddressRegistry::new(),
            cells: HashMap::new(),
            archive: BTreeMap::new(),
            by_address: HashMap::new(),
            next_sequence: 1,
            active_filter: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn range(&self) -> SignalRange {
        self.config.range
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn intern(&mut self, address: &str) -> u32 {
        self.registry.intern(address)
    }

    pub fn resolve(&self, address_id: u32) -> Option<&str> {
        self.registry.resolve(address_id)
    }

    /// Sequence id the next observation will receive. Ids start at 1.
    pub fn next_sequence_id(&self) -> u64 {
        self.next_sequence
    }

    pub fn cell_key_of(&self, position: Position) -> CellKey {
        self.config.quantizer.cell_key_of(position)
    }

    pub fn cell_center(&self, cell: CellKey) -> Position {
        self.config.quantizer.cell_center(cell)
    }

    // -- Ingestion ----------------------------------------------------------

    /// Intern, sequence, and ingest a decoded record in one step.
    pub fn record(
        &mut self,
        record: &AdvertisementRecord,
        position: Position,
        geo: GeoCoord,
        timestamp: f64,
    ) -> StoreEvent {
        let address_id = self.registry.intern(&record.address);
        let sequence_id = self.next_sequence;
        self.next_sequence = sequence_id.saturating_add(1);
        let observation = Observation {
            sequence_id,
            address_id,
            display_name: record.name.clone(),
            rssi: record.rssi,
            tx_power: record.tx_power,
            is_connectable: record.is_connectable,
            position,
            geo,
            timestamp,
            raw_record: Arc::from(record.raw.as_str()),
        };
        self.ingest(observation)
    }

    /// Append an observation to its cell, archive, and address index.
    ///
    /// Only `record` calls this, with a fresh sequence id and an interned
    /// address id.
    fn ingest(&mut self, observation: Observation) -> StoreEvent {
        let cell = self.cell_key_of(observation.position);
        let address = self
            .registry
            .resolve(observation.address_id)
            .unwrap_or_default()
            .to_string();

        self.archive.insert(
            observation.sequence_id,
            ArchiveEntry {
                address_id: observation.address_id,
                cell,
                raw_record: observation.raw_record.clone(),
            },
        );

        let index = self
            .by_address
            .entry(observation.address_id)
            .or_insert_with(|| AddressIndex {
                entries: BTreeMap::new(),
                rssi_sum: 0,
                count: 0,
                last_name: String::new(),
                last_seen: 0.0,
                last_raw: Arc::from(""),
            });
        index.entries.insert(observation.sequence_id, cell);
        index.rssi_sum += observation.rssi as i64;
        index.count += 1;
        index.last_name = observation.display_name.clone();
        index.last_seen = observation.timestamp;
        index.last_raw = observation.raw_record.clone();

        let history = self.cells.entry(cell).or_default();
        history.push_back(observation.clone());

        if let Some(cap) = self.config.max_history_per_cell {
            while history.len() > cap.max(1) {
                if let Some(evicted) = history.pop_front() {
                    self.archive.remove(&evicted.sequence_id);
                    let emptied = match self.by_address.get_mut(&evicted.address_id) {
                        Some(idx) => {
                            idx.entries.remove(&evicted.sequence_id);
                            idx.rssi_sum -= evicted.rssi as i64;
                            idx.count -= 1;
                            idx.count == 0
                        }
                        None => false,
                    };
                    if emptied {
                        self.by_address.remove(&evicted.address_id);
                    }
                }
            }
        }

        StoreEvent::ObservationLogged {
            address,
            cell,
            observation,
        }
    }

    // -- Filter -------------------------------------------------------------

    /// Set the display filter. `None`, `""`, and `"default"` select the global view.
    pub fn set_active_filter(&mut self, address: Option<String>) -> StoreEvent {
        self.active_filter = address.filter(|a| !GLOBAL_FILTER_ALIASES.contains(&a.as_str()));
        StoreEvent::FilterChanged {
            address: self.active_filter.clone(),
        }
    }

    pub fn active_filter(&self) -> Option<&str> {
        self.active_filter.as_deref()
    }

    // -- Queries ------------------------------------------------------------

    /// Truncating mean over `samples`, or the floor sentinel if empty.
    fn mean_rssi<'a>(&self, samples: impl Iterator<Item = &'a Observation>) -> i32 {
        let (sum, n) = samples.fold((0f64, 0usize), |(s, n), o| (s + o.rssi as f64, n + 1));
        if n == 0 {
            self.config.range.floor()
        } else {
            (sum / n as f64) as i32
        }
    }

    fn history(&self, cell: CellKey) -> impl Iterator<Item = &Observation> {
        self.cells.get(&cell).into_iter().flatten()
    }

    /// Mean RSSI over every observation in the cell.
    pub fn average_global(&self, cell: CellKey) -> i32 {
        self.mean_rssi(self.history(cell))
    }

    /// Mean RSSI over the cell's observations from one address.
    pub fn average_filtered(&self, cell: CellKey, address_id: u32) -> i32 {
        self.mean_rssi(self.history(cell).filter(|o| o.address_id == address_id))
    }

    /// `average_filtered` by address string; unknown addresses give the floor.
    pub fn average_filtered_by_address(&self, cell: CellKey, address: &str) -> i32 {
        match self.registry.lookup(address) {
            Some(id) => self.average_filtered(cell, id),
            None => self.config.range.floor(),
        }
    }

    /// Mean of the `sample_size` most recent observations by timestamp.
    ///
    /// Equal timestamps keep arrival order. `sample_size == 0` gives the floor.
    pub fn average_windowed(
        &self,
        cell: CellKey,
        sample_size: usize,
        address_id: Option<u32>,
    ) -> i32 {
        if sample_size == 0 {
            return self.config.range.floor();
        }
        let mut samples: Vec<&Observation> = self
            .history(cell)
            .filter(|o| address_id.map_or(true, |id| o.address_id == id))
            .collect();
        samples.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        let start = samples.len().saturating_sub(sample_size);
        self.mean_rssi(samples[start..].iter().copied())
    }

    /// Store-wide mean for one address, from the running totals.
    pub fn average_for_address(&self, address_id: u32) -> i32 {
        match self.by_address.get(&address_id) {
            Some(idx) if idx.count > 0 => (idx.rssi_sum as f64 / idx.count as f64) as i32,
            _ => self.config.range.floor(),
        }
    }

    /// Distinct cells holding observations from one address.
    pub fn cells_for_address(&self, address_id: u32) -> Vec<CellKey> {
        let Some(idx) = self.by_address.get(&address_id) else {
            return Vec::new();
        };
        let cells: BTreeSet<CellKey> = idx.entries.values().copied().collect();
        cells.into_iter().collect()
    }

    /// Windowed reading honoring the active filter.
    pub fn display_average(&self, cell: CellKey, sample_size: usize) -> i32 {
        match &self.active_filter {
            None => self.average_windowed(cell, sample_size, None),
            Some(addr) => match self.registry.lookup(addr) {
                Some(id) => self.average_windowed(cell, sample_size, Some(id)),
                None => self.config.range.floor(),
            },
        }
    }

    /// Normalized display reading.
    ///
    /// The global view is clamped to `[0, 1]`; a filtered view is not, so a
    /// filtered reading stronger than `max_rssi` reports above 1.
    pub fn display_percent(&self, cell: CellKey, sample_size: usize) -> f32 {
        let rssi = self.display_average(cell, sample_size);
        let SignalRange { min_rssi, max_rssi } = self.config.range;
        if self.active_filter.is_none() {
            percent_of_clamped(rssi, min_rssi, max_rssi)
        } else {
            percent_of(rssi, min_rssi, max_rssi)
        }
    }

    // -- Inspection ---------------------------------------------------------

    /// Occupied cells, sorted.
    pub fn cells(&self) -> Vec<CellKey> {
        let mut keys: Vec<CellKey> = self.cells.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn cell_len(&self, cell: CellKey) -> usize {
        self.cells.get(&cell).map_or(0, VecDeque::len)
    }

    pub fn cell_history(&self, cell: CellKey) -> Vec<&Observation> {
        self.history(cell).collect()
    }

    /// Observations currently held.
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    pub fn raw_record(&self, sequence_id: u64) -> Option<&str> {
        self.archive.get(&sequence_id).map(|e| &*e.raw_record)
    }

    pub fn cell_summaries(&self, sample_size: usize) -> Vec<CellSummary> {
        let range = self.config.range;
        self.cells()
            .into_iter()
            .map(|cell| {
                let windowed = self.average_windowed(cell, sample_size, None);
                CellSummary {
                    cell,
                    center: self.cell_center(cell),
                    count: self.cell_len(cell),
                    average: self.average_global(cell),
                    windowed,
                    windowed_percent: percent_of_clamped(windowed, range.min_rssi, range.max_rssi),
                }
            })
            .collect()
    }

    /// One summary per address with held observations, in ID order.
    pub fn device_summaries(&self) -> Vec<DeviceSummary> {
        let mut out: Vec<DeviceSummary> = self
            .by_address
            .iter()
            .map(|(&id, idx)| self.summarize(id, idx))
            .collect();
        out.sort_by_key(|d| d.address_id);
        out
    }

    pub fn device_summary(&self, address_id: u32) -> Option<DeviceSummary> {
        self.by_address
            .get(&address_id)
            .map(|idx| self.summarize(address_id, idx))
    }

    fn summarize(&self, address_id: u32, idx: &AddressIndex) -> DeviceSummary {
        DeviceSummary {
            address_id,
            address: self.registry.resolve(address_id).unwrap_or_default().to_string(),
            name: idx.last_name.clone(),
            observations: idx.count,
            average_rssi: self.average_for_address(address_id),
            cells: self.cells_for_address(address_id).len(),
            last_seen: idx.last_seen,
            last_raw: idx.last_raw.clone(),
        }
    }

    // -- Export / lifecycle -------------------------------------------------

    /// Held observations in sequence order, optionally only those after `after`.
    pub fn export_records(&self, after: Option<u64>) -> Vec<ExportRecord> {
        let start = after.map_or(0, |a| a.saturating_add(1));
        self.archive
            .range(start..)
            .filter_map(|(&seq, entry)| {
                let history = self.cells.get(&entry.cell)?;
                let pos = history
                    .binary_search_by_key(&seq, |o| o.sequence_id)
                    .ok()?;
                let address = self.registry.resolve(entry.address_id).unwrap_or_default();
                Some(ExportRecord {
                    sequence_id: seq,
                    cell: entry.cell,
                    row: ExportRow::from_observation(&history[pos], address),
                })
            })
            .collect()
    }

    /// Drop every observation. Registry IDs and the sequence counter persist.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.archive.clear();
        self.by_address.clear();
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Linear remap of `rssi` from `[min, max]` to `[0, 1]`, unclamped.
pub fn percent_of(rssi: i32, min_rssi: i32, max_rssi: i32) -> f32 {
    if min_rssi == max_rssi {
        return 0.0;
    }
    ((rssi as f64 - min_rssi as f64) / (max_rssi as f64 - min_rssi as f64)) as f32
}

/// `percent_of` clamped to `[0, 1]`.
pub fn percent_of_clamped(rssi: i32, min_rssi: i32, max_rssi: i32) -> f32 {
    percent_of(rssi, min_rssi, max_rssi).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
