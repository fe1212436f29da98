//! Ingest API: scanning bridges POST raw advertisement records here.
//!
//! A batch carries the observer position once and any number of records
//! heard there. Malformed records are rejected individually; the rest of
//! the batch still lands.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use beacon_core::{GeoCoord, Position};

use crate::web::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct IngestRequest {
    observer: ObserverPosition,
    records: Vec<RecordData>,
}

#[derive(Deserialize)]
pub struct ObserverPosition {
    x: f32,
    y: f32,
    #[serde(default)]
    z: f32,
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Deserialize)]
pub struct RecordData {
    raw: String,
    /// Seconds. Defaults to time since server start.
    timestamp: Option<f64>,
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Bearer token check for mutating endpoints. No configured token accepts all.
pub(crate) fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Value>)> {
    let expected = match &state.auth_token {
        Some(t) => t,
        None => return Ok(()),
    };

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(token) = auth_header.strip_prefix("Bearer ") {
        if token == expected {
            return Ok(());
        }
    }

    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid or missing bearer token"})),
    ))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/advertisements: batch ingest from a scanner.
pub async fn api_ingest_advertisements(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let obs = &body.observer;
    let position = Position::new(obs.x, obs.y, obs.z);
    let geo = match (obs.lat, obs.lon) {
        (Some(lat), Some(lon)) => GeoCoord::new(lat, lon),
        _ => GeoCoord::UNAVAILABLE,
    };

    let mut sequence_ids = Vec::with_capacity(body.records.len());
    let mut errors = Vec::new();
    for (i, record) in body.records.iter().enumerate() {
        let ts = record
            .timestamp
            .unwrap_or_else(|| state.pipeline.elapsed());
        match state
            .pipeline
            .handle_raw_advertisement(&record.raw, position, geo, ts)
        {
            Ok(seq) => sequence_ids.push(seq),
            Err(e) => errors.push(json!({"index": i, "error": e.to_string()})),
        }
    }

    debug!(
        accepted = sequence_ids.len(),
        rejected = errors.len(),
        "ingested advertisement batch"
    );

    (
        StatusCode::OK,
        Json(json!({
            "accepted": sequence_ids.len(),
            "rejected": errors.len(),
            "sequence_ids": sequence_ids,
            "errors": errors,
        })),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use beacon_core::{CellKey, CompanyTable, Pipeline};

    const BATCH: &str = r#"{
        "observer": {"x": 0.3, "y": 0.1, "lat": 35.59, "lon": -82.55},
        "records": [
            {"raw": "AA:BB|tag|-60|4|true", "timestamp": 1.0},
            {"raw": "AA:BB|tag|-70|4|true", "timestamp": 2.0},
            {"raw": "garbage"}
        ]
    }"#;

    fn test_state(auth_token: Option<&str>) -> Arc<AppState> {
        Arc::new(AppState::new(
            Pipeline::default(),
            CompanyTable::new(),
            None,
            auth_token.map(str::to_string),
            5,
        ))
    }

    fn post(body: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/advertisements")
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_api_ingest_advertisements() {
        let state = test_state(None);
        let app = crate::web::build_router(state.clone());

        let response = app.oneshot(post(BATCH, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accepted"], 2);
        assert_eq!(json["rejected"], 1);
        assert_eq!(json["sequence_ids"], json!([1, 2]));
        assert_eq!(json["errors"][0]["index"], 2);

        let store = state.pipeline.read();
        // x 0.3 * 8 = 2.4, y 0.1 * 8 = 0.8
        let cell = CellKey::new(2, 0, 0);
        assert_eq!(store.cell_len(cell), 2);
        assert_eq!(store.average_global(cell), -65);
        let obs = store.cell_history(cell)[0].clone();
        assert_eq!(obs.geo, GeoCoord::new(35.59, -82.55));
        assert_eq!(obs.timestamp, 1.0);
    }

    #[tokio::test]
    async fn test_auth_reject_without_token() {
        let state = test_state(Some("secret-token-123"));
        let app = crate::web::build_router(state.clone());

        let response = app.oneshot(post(BATCH, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.pipeline.read().is_empty());
    }

    #[tokio::test]
    async fn test_auth_reject_wrong_token() {
        let state = test_state(Some("secret-token-123"));
        let app = crate::web::build_router(state);

        let response = app
            .oneshot(post(BATCH, Some("wrong-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_accept_correct_token() {
        let state = test_state(Some("secret-token-123"));
        let app = crate::web::build_router(state);

        let response = app
            .oneshot(post(BATCH, Some("secret-token-123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_timestamp_uses_server_clock() {
        let state = test_state(None);
        let app = crate::web::build_router(state.clone());

        let body = r#"{"observer": {"x": 0, "y": 0}, "records": [{"raw": "CC|n|-50|0|false"}]}"#;
        let response = app.oneshot(post(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let store = state.pipeline.read();
        let obs = store.cell_history(CellKey::new(0, 0, 0))[0].clone();
        assert!(obs.timestamp >= 0.0);
        assert!(!obs.geo.is_available());
    }
}
