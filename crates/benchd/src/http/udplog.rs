// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! UDP log ring query handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::clock::parse_since;
use crate::coordinator::Coordinator;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct UdpLogQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /api/udplog?since=&source=&limit=`
pub async fn query(
    State(coord): State<Arc<Coordinator>>,
    Query(query): Query<UdpLogQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let since_ms = match query.since.as_deref() {
        None | Some("") => 0,
        Some(raw) => parse_since(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unparseable since: {raw}")))?,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let lines = coord.udplog.query(since_ms, query.source.as_deref(), limit);
    envelope(serde_json::json!({ "lines": lines }))
}

/// `DELETE /api/udplog`
pub async fn clear(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.udplog.clear();
    ok()
}
