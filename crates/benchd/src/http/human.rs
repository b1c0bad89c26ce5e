// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Human-confirmation rendezvous handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::coordinator::Coordinator;
use crate::error::ApiError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
pub struct InteractionRequest {
    pub message: String,
    /// Seconds; defaults to 120.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `POST /api/human-interaction` — blocks until resolved or timed out.
pub async fn interaction(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<InteractionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let timeout = request.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_TIMEOUT);
    let outcome = coord.human.request(&request.message, timeout).await?;
    envelope(outcome)
}

/// `GET /api/human/status`
pub async fn status(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    envelope(coord.human.status().await)
}

/// `POST /api/human/done`
pub async fn done(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.human.done().await?;
    ok()
}

/// `POST /api/human/cancel`
pub async fn cancel(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.human.cancel().await?;
    ok()
}
