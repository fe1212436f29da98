//! Ingestion pipeline: raw record -> decode -> store -> notification bus.
//!
//! The store sits behind one `RwLock`. Ingestion holds the write guard for
//! the whole intern/sequence/append/publish step so readers never observe
//! half an observation. Notifications fan out over a `broadcast` channel;
//! sending never blocks and lagging receivers lose the oldest messages.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;

use crate::record;
use crate::store::{SignalStore, StoreConfig, StoreEvent};
use crate::types::{DecodeError, GeoCoord, Position};

/// Notifications buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Pipeline {
    store: Arc<RwLock<SignalStore>>,
    events: broadcast::Sender<StoreEvent>,
    started: Instant,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new(StoreConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: StoreConfig) -> Self {
        Pipeline::with_store(SignalStore::new(config))
    }

    pub fn with_store(store: SignalStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Pipeline {
            store: Arc::new(RwLock::new(store)),
            events,
            started: Instant::now(),
        }
    }

    /// Decode and log one advertisement heard at `position`.
    ///
    /// Returns the assigned sequence id. A malformed record is rejected
    /// before the store is touched and nothing is published.
    pub fn handle_raw_advertisement(
        &self,
        raw: &str,
        position: Position,
        geo: GeoCoord,
        timestamp: f64,
    ) -> Result<u64, DecodeError> {
        let decoded = record::decode(raw).inspect_err(|e| debug!("rejected advertisement: {e}"))?;

        let mut store = self.write();
        let sequence_id = store.next_sequence_id();
        let event = store.record(&decoded, position, geo, timestamp);
        // No subscribers is fine
        let _ = self.events.send(event);
        Ok(sequence_id)
    }

    /// `handle_raw_advertisement` stamped with seconds since pipeline start.
    pub fn handle_raw_advertisement_now(
        &self,
        raw: &str,
        position: Position,
        geo: GeoCoord,
    ) -> Result<u64, DecodeError> {
        self.handle_raw_advertisement(raw, position, geo, self.elapsed())
    }

    /// Set the display filter and publish the change.
    ///
    /// Returns the published event and whether the filtered address has
    /// been seen, both taken under the same write guard. The global view
    /// counts as known.
    pub fn set_active_filter(&self, address: Option<String>) -> (StoreEvent, bool) {
        let mut store = self.write();
        let event = store.set_active_filter(address);
        let known = store
            .active_filter()
            .map_or(true, |a| store.registry().lookup(a).is_some());
        let _ = self.events.send(event.clone());
        (event, known)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<RwLock<SignalStore>> {
        &self.store
    }

    /// Shared read access for queries.
    pub fn read(&self) -> RwLockReadGuard<'_, SignalStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SignalStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seconds since the pipeline was created.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
