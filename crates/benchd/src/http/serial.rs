// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial operation handlers: reset, monitor, recover, release.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok, resolve_slot};
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::flap;
use crate::ops;

#[derive(Debug, Deserialize)]
pub struct SlotRequest {
    pub slot: String,
}

/// `POST /api/serial/reset`
pub async fn reset(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot)?;
    let output = ops::reset(&coord, &slot).await?;
    envelope(serde_json::json!({ "output": output }))
}

#[derive(Debug, Deserialize)]
pub struct MonitorRequest {
    pub slot: String,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Seconds; defaults to 10.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `POST /api/serial/monitor`
pub async fn monitor(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<MonitorRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot)?;
    let timeout = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(ops::DEFAULT_MONITOR_TIMEOUT);
    let outcome = ops::monitor(&coord, &slot, request.pattern.as_deref(), timeout).await?;
    envelope(outcome)
}

/// `POST /api/serial/recover`
pub async fn recover(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot)?;
    let outcome = flap::recover(&coord, &slot).await?;
    envelope(outcome)
}

/// `POST /api/serial/release` — exit download mode / release the BOOT line.
pub async fn release(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<SlotRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot)?;
    flap::release(&coord, &slot).await?;
    ok()
}
