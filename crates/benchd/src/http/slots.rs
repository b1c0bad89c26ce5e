// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot listing, hotplug ingest, and manual start/stop handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok, resolve_slot};
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::hotplug::{self, HotplugAction};
use crate::ops;

/// `GET /api/devices`
pub async fn devices(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = coord.clock.now_ms();
    let window = coord.settings.flap_window_ms;
    let host = &coord.settings.advertise_host;
    let slots: Vec<_> =
        coord.slots.all().iter().map(|slot| slot.snapshot(host, now, window)).collect();
    envelope(serde_json::json!({
        "slots": slots,
        "observations": coord.slots.observations(),
    }))
}

/// Body of the OS hotplug callback.
#[derive(Debug, Deserialize)]
pub struct HotplugRequest {
    pub action: String,
    pub devnode: String,
    #[serde(default)]
    pub id_path: String,
    #[serde(default)]
    pub devpath: String,
}

/// `POST /api/hotplug` (internal, from the udev rule)
pub async fn hotplug(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<HotplugRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = HotplugAction::parse(&request.action)
        .ok_or_else(|| ApiError::bad_request(format!("unknown action: {}", request.action)))?;
    hotplug::ingest(&coord, action, &request.devnode, &request.id_path, &request.devpath);
    ok()
}

#[derive(Debug, Deserialize)]
pub struct StartStopRequest {
    pub slot_key: String,
    #[serde(default)]
    pub devnode: Option<String>,
}

/// `POST /api/start` — idempotent manual proxy start.
pub async fn start(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<StartStopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot_key)?;
    ops::manual_start(&coord, &slot, request.devnode.as_deref()).await?;
    ok()
}

/// `POST /api/stop` — idempotent manual proxy stop.
pub async fn stop(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<StartStopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let slot = resolve_slot(&coord, &request.slot_key)?;
    ops::manual_stop(&coord, &slot).await?;
    ok()
}
