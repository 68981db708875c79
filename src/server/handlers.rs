use axum::{
    Json,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::HeaderMap,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::{
    access_guard::{API_KEY_HEADER, Credentials},
    ingest::{MalformedInput, parse_compact, parse_fields},
    reading::{Reading, Sample},
    server::{AppState, app_error::AppError, ingest_body::IngestBody},
    storage::Backend,
};

/// Raw query-string pairs in request order.
///
/// Repeated names are allowed; the first occurrence wins. A query string that
/// cannot be decoded counts as empty.
#[derive(Debug, Default)]
pub struct QueryPairs(Vec<(String, String)>);

impl QueryPairs {
    fn from_extracted(query: Result<Query<Vec<(String, String)>>, QueryRejection>) -> Self {
        query.map(|Query(pairs)| Self(pairs)).unwrap_or_default()
    }

    fn first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Acknowledgement returned by both ingest endpoints.
#[derive(Serialize, Debug)]
pub struct IngestAck {
    ok: bool,
    id: Option<String>,
    mode: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    reading: Reading,
}

fn header_credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Appends a validated sample and builds the acknowledgement.
async fn record(state: &AppState, sample: Sample) -> Result<Json<IngestAck>, AppError> {
    let receipt = state.store.append(sample).await?;
    info!(
        t = receipt.reading.temperature,
        h = receipt.reading.humidity,
        "Recorded reading"
    );
    Ok(Json(IngestAck {
        ok: true,
        id: receipt.id,
        mode: state.store.backend(),
        size: receipt.size,
        reading: receipt.reading,
    }))
}

/// Records one reading from a JSON or form body with `t` and `h` fields.
#[axum::debug_handler]
#[instrument(skip_all)]
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: IngestBody,
) -> Result<Json<IngestAck>, AppError> {
    let params = QueryPairs::from_extracted(query);
    state.guard.check(Credentials {
        header: header_credential(&headers),
        query: params.first("key"),
        body: body.credential(),
    })?;
    let sample = parse_fields(&body.fields)?;
    record(&state, sample).await
}

/// Records one reading from a `"t,h"` text body.
#[axum::debug_handler]
#[instrument(skip_all)]
pub async fn ingest_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Bytes,
) -> Result<Json<IngestAck>, AppError> {
    let params = QueryPairs::from_extracted(query);
    state.guard.check(Credentials {
        header: header_credential(&headers),
        query: params.first("key"),
        body: None,
    })?;
    let text = std::str::from_utf8(&body).map_err(|_| MalformedInput::ExpectedPair)?;
    let sample = parse_compact(text)?;
    record(&state, sample).await
}

/// Returns recent readings, oldest first.
#[axum::debug_handler]
#[instrument(skip_all)]
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<Vec<Reading>>, AppError> {
    // A limit that is not a positive integer falls back to the default.
    let limit = QueryPairs::from_extracted(query)
        .first("limit")
        .and_then(|text| text.trim().parse::<usize>().ok());
    let result = state.store.recent(limit).await?;
    Ok(Json(result))
}

/// Returns the latest reading, or `null` when there is none.
#[axum::debug_handler]
#[instrument(skip(state))]
pub async fn get_latest(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Option<Reading>>, AppError> {
    let result = state.store.latest().await?;
    Ok(Json(result))
}

pub async fn healthz() -> &'static str {
    "ok"
}
