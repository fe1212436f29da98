//! Webhook notification dispatch for proximity-tag sightings.
//!
//! A background task follows the pipeline's event bus and fires one
//! fire-and-forget HTTP POST the first time each address is heard carrying
//! a proximity-tag payload.

use std::collections::HashSet;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_core::{decode_manufacturer_data, detect_proximity_tag, Pipeline, StoreEvent};

/// Dispatches sighting payloads to a webhook URL via HTTP POST.
#[derive(Clone)]
pub struct WebhookDispatcher {
    url: String,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: &str) -> Self {
        WebhookDispatcher {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Fire-and-forget POST of a JSON payload.
    pub fn notify(&self, payload: Value) {
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                warn!("webhook POST failed: {e}");
            }
        });
    }
}

/// Turns store events into first-sighting alerts.
#[derive(Debug, Default)]
pub struct ProximityAlerter {
    alerted: HashSet<String>,
}

impl ProximityAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload for a logged observation whose record carries a proximity-tag
    /// payload, once per address.
    pub fn check(&mut self, event: &StoreEvent) -> Option<Value> {
        let StoreEvent::ObservationLogged {
            address,
            cell,
            observation,
        } = event
        else {
            return None;
        };
        if self.alerted.contains(address) {
            return None;
        }

        let record = beacon_core::decode(&observation.raw_record).ok()?;
        let descriptor = decode_manufacturer_data(record.manufacturer_data()?);
        if !detect_proximity_tag(&descriptor) {
            return None;
        }

        self.alerted.insert(address.clone());
        Some(json!({
            "event_type": "proximity_tag_detected",
            "address": address,
            "name": observation.display_name,
            "company_id": descriptor.company_id,
            "rssi": observation.rssi,
            "cell": cell,
            "position": observation.position,
            "lat": observation.geo.is_available().then_some(observation.geo.lat),
            "lon": observation.geo.is_available().then_some(observation.geo.lon),
            "timestamp": observation.timestamp,
        }))
    }
}

/// Follow `pipeline` events and POST alerts until the bus closes.
pub fn spawn_webhook_task(pipeline: &Pipeline, dispatcher: WebhookDispatcher) -> JoinHandle<()> {
    let mut rx = pipeline.subscribe();
    tokio::spawn(async move {
        let mut alerter = ProximityAlerter::new();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(payload) = alerter.check(&event) {
                        info!(address = %payload["address"], "proximity tag detected");
                        dispatcher.notify(payload);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "webhook task lagged behind event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
