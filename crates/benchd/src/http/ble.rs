// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bluetooth Central facade handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::coordinator::Coordinator;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct BleScanRequest {
    /// Seconds; defaults to the configured scan timeout.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub name_filter: Option<String>,
}

/// `POST /api/ble/scan`
pub async fn scan(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<BleScanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let timeout = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(coord.settings.ble_scan_timeout);
    let devices = coord.ble.scan(timeout, request.name_filter.as_deref()).await?;
    envelope(serde_json::json!({ "devices": devices }))
}

#[derive(Debug, Deserialize)]
pub struct BleConnectRequest {
    pub address: String,
}

/// `POST /api/ble/connect`
pub async fn connect(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<BleConnectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let services = coord.ble.connect(&request.address).await?;
    envelope(serde_json::json!({ "services": services }))
}

#[derive(Debug, Deserialize)]
pub struct BleWriteRequest {
    pub characteristic: String,
    pub hex: String,
    /// Write with response (default) or without.
    #[serde(default)]
    pub response: Option<bool>,
}

/// `POST /api/ble/write`
pub async fn write(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<BleWriteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let written = coord
        .ble
        .write(&request.characteristic, &request.hex, request.response.unwrap_or(true))
        .await?;
    envelope(serde_json::json!({ "written": written }))
}

/// `POST /api/ble/disconnect`
pub async fn disconnect(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.ble.disconnect().await?;
    ok()
}

/// `GET /api/ble/status`
pub async fn status(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    envelope(coord.ble.status().await)
}
