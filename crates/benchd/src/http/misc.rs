// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health, host info, activity log, and test-progress handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::envelope;
use crate::clock::parse_since;
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::progress::ProgressReport;

/// `GET /api/health`
pub async fn health(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    envelope(serde_json::json!({
        "status": "running",
        "slots": coord.slots.len(),
    }))
}

/// `GET /api/info`
pub async fn info(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut present = 0usize;
    let mut running = 0usize;
    for slot in coord.slots.all() {
        if slot.status.lock().present {
            present += 1;
        }
        if slot.proxy_running() {
            running += 1;
        }
    }
    envelope(serde_json::json!({
        "host": coord.settings.advertise_host,
        "hostname": coord.settings.hostname,
        "slots": { "total": coord.slots.len(), "present": present, "running": running },
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub since: Option<String>,
}

/// `GET /api/log?since=<iso8601|epoch-ms>`
pub async fn activity_log(
    State(coord): State<Arc<Coordinator>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since_ms = match query.since.as_deref() {
        None | Some("") => 0,
        Some(raw) => parse_since(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unparseable since: {raw}")))?,
    };
    envelope(serde_json::json!({ "entries": coord.activity.since(since_ms) }))
}

/// `POST /api/test/update`
pub async fn test_update(
    State(coord): State<Arc<Coordinator>>,
    Json(report): Json<ProgressReport>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.progress.update(report);
    super::ok()
}

/// `GET /api/test/progress`
pub async fn test_progress(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    envelope(coord.progress.snapshot())
}
