//! REST API route handlers.
//!
//! Every handler reads the live store under a short read lock. The guard is
//! never held across an `.await`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use beacon_core::{
    decode, decode_manufacturer_data, detect_proximity_tag, to_csv_string, CellKey,
    DeviceSummary, SignalStore, StoreEvent,
};

use crate::web::ingest::check_auth;
use crate::web::AppState;

// ---------------------------------------------------------------------------
// Query param types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CellParams {
    sample_size: Option<usize>,
}

#[derive(Deserialize)]
pub struct CellDetailParams {
    address: Option<String>,
    sample_size: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ExportParams {
    after: Option<u64>,
}

#[derive(Deserialize)]
pub struct FilterBody {
    address: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MAX_HISTORY_LIMIT: usize = 1000;

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
}

/// Company name and proximity-tag flag from a device's latest record.
fn device_json(state: &AppState, device: &DeviceSummary) -> Value {
    let descriptor = decode(&device.last_raw)
        .ok()
        .and_then(|rec| rec.manufacturer_data().map(decode_manufacturer_data))
        .unwrap_or_default();

    let mut value = serde_json::to_value(device).unwrap_or(json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("company_id".into(), json!(descriptor.company_id));
        obj.insert(
            "company".into(),
            json!(state.companies.lookup_company_name(&descriptor)),
        );
        obj.insert(
            "proximity_tag".into(),
            json!(detect_proximity_tag(&descriptor)),
        );
    }
    value
}

/// Numeric registry id, or an address string.
fn resolve_device(store: &SignalStore, id: &str) -> Option<u32> {
    id.parse::<u32>()
        .ok()
        .filter(|n| store.resolve(*n).is_some())
        .or_else(|| store.registry().lookup(id))
}

fn event_kind(event: &StoreEvent) -> &'static str {
    match event {
        StoreEvent::ObservationLogged { .. } => "observation_logged",
        StoreEvent::FilterChanged { .. } => "filter_changed",
    }
}

// ---------------------------------------------------------------------------
// Cell endpoints
// ---------------------------------------------------------------------------

/// GET /api/cells: every occupied cell with its display reading.
pub async fn api_cells(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CellParams>,
) -> impl IntoResponse {
    let sample_size = params.sample_size.unwrap_or(state.sample_size);
    let store = state.pipeline.read();
    let range = store.range();

    let cells: Vec<Value> = store
        .cell_summaries(sample_size)
        .into_iter()
        .map(|s| {
            json!({
                "cell": s.cell,
                "center": s.center,
                "count": s.count,
                "average": s.average,
                "windowed": s.windowed,
                "display_average": store.display_average(s.cell, sample_size),
                "display_percent": store.display_percent(s.cell, sample_size),
            })
        })
        .collect();

    Json(json!({
        "filter": store.active_filter(),
        "sample_size": sample_size,
        "min_rssi": range.min_rssi,
        "max_rssi": range.max_rssi,
        "cell_size": store.config().quantizer.cell_size(),
        "cells": cells,
    }))
}

/// GET /api/cells/:x/:y/:z: averages and recent history for one cell.
///
/// Empty or unknown cells answer with the floor reading, not 404.
pub async fn api_cell_detail(
    State(state): State<Arc<AppState>>,
    Path((x, y, z)): Path<(i32, i32, i32)>,
    Query(params): Query<CellDetailParams>,
) -> impl IntoResponse {
    let cell = CellKey::new(x, y, z);
    let sample_size = params.sample_size.unwrap_or(state.sample_size);
    let limit = params.limit.unwrap_or(100).min(MAX_HISTORY_LIMIT);
    let store = state.pipeline.read();

    let filtered = params.address.as_deref().map(|addr| {
        let id = store.registry().lookup(addr);
        json!({
            "address": addr,
            "average": store.average_filtered_by_address(cell, addr),
            "windowed": match id {
                Some(id) => store.average_windowed(cell, sample_size, Some(id)),
                None => store.range().floor(),
            },
        })
    });

    let history = store.cell_history(cell);
    let start = history.len().saturating_sub(limit);
    let recent: Vec<Value> = history[start..]
        .iter()
        .map(|o| {
            json!({
                "sequence_id": o.sequence_id,
                "address": store.resolve(o.address_id),
                "name": o.display_name,
                "rssi": o.rssi,
                "tx_power": o.tx_power,
                "is_connectable": o.is_connectable,
                "position": o.position,
                "timestamp": o.timestamp,
            })
        })
        .collect();

    Json(json!({
        "cell": cell,
        "center": store.cell_center(cell),
        "count": history.len(),
        "average": store.average_global(cell),
        "windowed": store.average_windowed(cell, sample_size, None),
        "display_average": store.display_average(cell, sample_size),
        "display_percent": store.display_percent(cell, sample_size),
        "filtered": filtered,
        "observations": recent,
    }))
}

// ---------------------------------------------------------------------------
// Device endpoints
// ---------------------------------------------------------------------------

/// GET /api/devices: one entry per address seen.
pub async fn api_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let devices = state.pipeline.read().device_summaries();
    let list: Vec<Value> = devices.iter().map(|d| device_json(&state, d)).collect();
    Json(json!(list))
}

/// GET /api/devices/:id: device detail by registry id or address.
pub async fn api_device_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let store = state.pipeline.read();
    let Some(summary) = resolve_device(&store, &id).and_then(|n| store.device_summary(n)) else {
        return not_found("device");
    };

    let cells: Vec<Value> = store
        .cells_for_address(summary.address_id)
        .into_iter()
        .map(|cell| {
            json!({
                "cell": cell,
                "average": store.average_filtered(cell, summary.address_id),
            })
        })
        .collect();

    let mut value = device_json(&state, &summary);
    value["cell_averages"] = json!(cells);
    value["last_raw"] = json!(&*summary.last_raw);
    (StatusCode::OK, Json(value))
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// GET /api/filter
pub async fn api_filter_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.pipeline.read();
    Json(json!({"address": store.active_filter()}))
}

/// PUT /api/filter: `{"address": null}` or `"default"` restores the global view.
pub async fn api_filter_set(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FilterBody>,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let (event, known) = state.pipeline.set_active_filter(body.address);
    let active = match event {
        StoreEvent::FilterChanged { address } => address,
        StoreEvent::ObservationLogged { .. } => None,
    };
    (
        StatusCode::OK,
        Json(json!({"address": active, "known": known})),
    )
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// GET /api/export: held observations as CSV.
pub async fn api_export(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> impl IntoResponse {
    let records = state.pipeline.read().export_records(params.after);
    let csv = to_csv_string(records.iter().map(|r| &r.row));
    ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv)
}

/// POST /api/export/flush: write new observations to the archive now.
pub async fn api_export_flush(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    if state.archive.is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no archive configured"})),
        );
    }

    match state.flush().await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => {
            warn!("flush failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// GET /api/stats
pub async fn api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut stats = {
        let store = state.pipeline.read();
        json!({
            "observations": store.len(),
            "cells": store.cells().len(),
            "devices": store.registry().len(),
            "next_sequence_id": store.next_sequence_id(),
            "filter": store.active_filter(),
            "uptime_sec": state.pipeline.elapsed(),
        })
    };

    stats["flushed_through"] = json!(state.flushed_through().await);
    if let Some(archive) = &state.archive {
        match archive.stats().await {
            Ok(db) => {
                stats["archive"] = json!({"session_id": archive.session_id(), "totals": db});
            }
            Err(e) => warn!("archive stats failed: {e}"),
        }
    }
    Json(stats)
}

// ---------------------------------------------------------------------------
// Live events
// ---------------------------------------------------------------------------

/// GET /api/events: store notifications as server-sent events.
pub async fn api_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.pipeline.subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event(event_kind(&event)).json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), rx)),
                    Err(e) => warn!("failed to encode event: {e}"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event subscriber lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use tower::ServiceExt;

    use beacon_core::{
        encode_group, parse_csv, CompanyTable, GeoCoord, Pipeline, Position, RecordBuilder,
    };

    use crate::db::{Database, SqliteArchive};

    fn test_state() -> Arc<AppState> {
        let mut companies = CompanyTable::new();
        companies.insert(76, "Apple, Inc.");
        let state = AppState::new(Pipeline::default(), companies, None, None, 5);

        let tag = RecordBuilder::new("AA:BB", "tag", -60, 4, true)
            .manufacturer_data(&encode_group(76, &[0x12, 0x19, 0x10, 0x05]))
            .encode();
        let at = |x: f32, y: f32| Position::new(x, y, 0.0);
        let geo = GeoCoord::UNAVAILABLE;
        state.pipeline.handle_raw_advertisement(&tag, at(0.05, 0.05), geo, 1.0).unwrap();
        state.pipeline.handle_raw_advertisement("CC:DD|other|-80|0|false", at(0.05, 0.05), geo, 2.0).unwrap();
        state.pipeline.handle_raw_advertisement(&tag, at(0.3, 0.05), geo, 3.0).unwrap();
        Arc::new(state)
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let app = crate::web::build_router(state);
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn put_filter(body: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/api/filter")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_api_cells() {
        let (status, json) = get_json(test_state(), "/api/cells").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filter"], Value::Null);
        assert_eq!(json["sample_size"], 5);
        let cells = json["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 2);
        // (0,0,0) holds -60 and -80
        assert_eq!(cells[0]["cell"], json!({"x": 0, "y": 0, "z": 0}));
        assert_eq!(cells[0]["average"], -70);
        assert_eq!(cells[0]["count"], 2);
    }

    #[tokio::test]
    async fn test_api_cell_detail_filtered() {
        let (status, json) =
            get_json(test_state(), "/api/cells/0/0/0?address=CC:DD&sample_size=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["average"], -70);
        // most recent by timestamp is CC:DD at t=2
        assert_eq!(json["windowed"], -80);
        assert_eq!(json["filtered"]["average"], -80);
        assert_eq!(json["observations"].as_array().unwrap().len(), 2);
        assert_eq!(json["observations"][0]["address"], "AA:BB");
    }

    #[tokio::test]
    async fn test_api_cell_detail_empty() {
        let (status, json) = get_json(test_state(), "/api/cells/9/9/9?address=nobody").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 0);
        assert_eq!(json["average"], -100);
        assert_eq!(json["filtered"]["average"], -100);
    }

    #[tokio::test]
    async fn test_api_devices() {
        let (status, json) = get_json(test_state(), "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        let devices = json.as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["address"], "AA:BB");
        assert_eq!(devices[0]["company"], "Apple, Inc.");
        assert_eq!(devices[0]["proximity_tag"], true);
        assert_eq!(devices[0]["cells"], 2);
        assert_eq!(devices[1]["company"], "");
        assert_eq!(devices[1]["proximity_tag"], false);
    }

    #[tokio::test]
    async fn test_api_device_detail() {
        let state = test_state();
        let (status, json) = get_json(state.clone(), "/api/devices/AA:BB").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["observations"], 2);
        assert_eq!(json["cell_averages"].as_array().unwrap().len(), 2);

        let (status, by_id) = get_json(state.clone(), "/api/devices/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_id["address"], "CC:DD");

        let (status, _) = get_json(state, "/api/devices/EE:FF").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_filter_roundtrip() {
        let state = test_state();
        let mut events = state.pipeline.subscribe();

        let app = crate::web::build_router(state.clone());
        let response = app
            .oneshot(put_filter(r#"{"address": "CC:DD"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::FilterChanged { address: Some(ref a) } if a == "CC:DD"
        ));

        let (_, json) = get_json(state.clone(), "/api/cells").await;
        assert_eq!(json["filter"], "CC:DD");
        assert_eq!(json["cells"][0]["display_average"], -80);

        let app = crate::web::build_router(state.clone());
        app.oneshot(put_filter(r#"{"address": "default"}"#))
            .await
            .unwrap();
        let (_, json) = get_json(state, "/api/filter").await;
        assert_eq!(json["address"], Value::Null);
    }

    #[tokio::test]
    async fn test_api_filter_set_reports_known() {
        let state = test_state();

        let app = crate::web::build_router(state.clone());
        let response = app
            .oneshot(put_filter(r#"{"address": "CC:DD"}"#))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({"address": "CC:DD", "known": true}));

        let app = crate::web::build_router(state);
        let response = app
            .oneshot(put_filter(r#"{"address": "77:77"}"#))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({"address": "77:77", "known": false}));
    }

    #[tokio::test]
    async fn test_api_filter_requires_auth() {
        let state = Arc::new(AppState::new(
            Pipeline::default(),
            CompanyTable::new(),
            None,
            Some("secret".into()),
            5,
        ));
        let app = crate::web::build_router(state);
        let response = app
            .oneshot(put_filter(r#"{"address": "AA"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_api_export_csv() {
        let app = crate::web::build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/export?after=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let rows = parse_csv(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].address, "CC:DD");
    }

    #[tokio::test]
    async fn test_api_export_flush() {
        let app = crate::web::build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/export/flush")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let archive = SqliteArchive::new(Database::open_memory().unwrap(), "test").unwrap();
        let state = Arc::new(AppState::new(
            Pipeline::default(),
            CompanyTable::new(),
            Some(Arc::new(archive)),
            None,
            5,
        ));
        state
            .pipeline
            .handle_raw_advertisement("AA|a|-60|0|true", Position::default(), GeoCoord::UNAVAILABLE, 0.0)
            .unwrap();
        let app = crate::web::build_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/export/flush")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, stats) = get_json(state, "/api/stats").await;
        assert_eq!(stats["flushed_through"], 1);
        assert_eq!(stats["archive"]["totals"]["observations"], 1);
    }

    #[tokio::test]
    async fn test_api_stats() {
        let (status, json) = get_json(test_state(), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["observations"], 3);
        assert_eq!(json["cells"], 2);
        assert_eq!(json["devices"], 2);
        assert_eq!(json["next_sequence_id"], 4);
        assert!(json.get("archive").is_none());
    }

    #[tokio::test]
    async fn test_api_events_stream() {
        let state = test_state();
        let app = crate::web::build_router(state.clone());
        let response = app
            .oneshot(Request::builder().uri("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        state
            .pipeline
            .handle_raw_advertisement("EE:FF|new|-55|0|true", Position::default(), GeoCoord::UNAVAILABLE, 9.0)
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: observation_logged"));
        assert!(text.contains("EE:FF"));
    }
}
