// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allowlisted GPIO handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::gpio::PinLevel;

#[derive(Debug, Deserialize)]
pub struct GpioSetRequest {
    pub pin: u32,
    /// `0`, `1`, or `"z"`.
    pub value: PinLevel,
}

/// `POST /api/gpio/set`
pub async fn set(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<GpioSetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.gpio.set(request.pin, request.value)?;
    ok()
}

/// `GET /api/gpio/status`
pub async fn status(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pins: Vec<_> = coord
        .gpio
        .status()
        .into_iter()
        .map(|(pin, level)| serde_json::json!({ "pin": pin, "value": level }))
        .collect();
    envelope(serde_json::json!({
        "allowed": coord.gpio.allowed(),
        "pins": pins,
    }))
}
