// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wireless handlers: arbiter operations, lease ingestion, event
//! long-poll, relay, and the captive-portal flow.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{envelope, ok};
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::radio::{RadioState, RelayRequest};

/// Default station-join window.
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default event long-poll window.
const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /api/wifi/mode`
pub async fn get_mode(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state = coord.radio.state().await;
    let mode = match state {
        RadioState::Uplink { .. } => "uplink",
        _ => "testing",
    };
    envelope(serde_json::json!({ "mode": mode, "radio": state }))
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default, alias = "pass")]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `POST /api/wifi/mode` — switch between `testing` and `uplink`.
pub async fn set_mode(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match request.mode.as_str() {
        "uplink" => {
            let ssid = request
                .ssid
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("uplink mode needs an ssid"))?;
            let timeout =
                request.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_JOIN_TIMEOUT);
            let lease =
                coord.radio.enter_uplink(ssid, request.password.as_deref(), timeout).await?;
            envelope(serde_json::json!({ "mode": "uplink", "ip": lease.ip }))
        }
        "testing" => {
            coord.radio.leave_uplink().await?;
            envelope(serde_json::json!({ "mode": "testing" }))
        }
        other => Err(ApiError::bad_request(format!("unknown mode: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApStartRequest {
    pub ssid: String,
    #[serde(default, alias = "password")]
    pub pass: Option<String>,
    #[serde(default)]
    pub channel: Option<u8>,
}

/// `POST /api/wifi/ap_start`
pub async fn ap_start(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<ApStartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.radio.ap_start(&request.ssid, request.pass.as_deref(), request.channel).await?;
    ok()
}

/// `POST /api/wifi/ap_stop`
pub async fn ap_stop(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.radio.ap_stop().await?;
    ok()
}

/// `GET /api/wifi/ap_status`
pub async fn ap_status(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state = coord.radio.state().await;
    let stations = coord.radio.stations().await;
    match state {
        RadioState::Ap { ssid, channel } => envelope(serde_json::json!({
            "active": true,
            "ssid": ssid,
            "channel": channel,
            "stations": stations,
        })),
        _ => envelope(serde_json::json!({ "active": false, "stations": [] })),
    }
}

#[derive(Debug, Deserialize)]
pub struct StaJoinRequest {
    pub ssid: String,
    #[serde(default, alias = "password")]
    pub pass: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `POST /api/wifi/sta_join`
pub async fn sta_join(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<StaJoinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let timeout = request.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_JOIN_TIMEOUT);
    let lease = coord.radio.sta_join(&request.ssid, request.pass.as_deref(), timeout).await?;
    envelope(serde_json::json!({ "ip": lease.ip, "gateway": lease.gateway }))
}

/// `POST /api/wifi/sta_leave`
pub async fn sta_leave(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord.radio.sta_leave().await?;
    ok()
}

/// `GET /api/wifi/scan`
pub async fn scan(
    State(coord): State<Arc<Coordinator>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let networks = coord.radio.scan().await?;
    envelope(serde_json::json!({ "networks": networks }))
}

/// `POST /api/wifi/http` — relay a request out of the radio interface.
pub async fn http_relay(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<RelayRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = coord.radio.http_relay(request).await?;
    envelope(response)
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Seconds to wait when the queue is empty.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `GET /api/wifi/events?timeout=N` — single-consumer long poll.
pub async fn events(
    State(coord): State<Arc<Coordinator>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let timeout = query.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_EVENT_TIMEOUT);
    let events = coord.events.drain(timeout).await;
    envelope(serde_json::json!({ "events": events }))
}

/// Body of the DHCP daemon's lease callback.
#[derive(Debug, Deserialize)]
pub struct LeaseEventRequest {
    pub action: String,
    pub mac: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// `POST /api/wifi/lease_event` (internal, from the DHCP daemon hook)
pub async fn lease_event(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<LeaseEventRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord
        .radio
        .lease_event(
            &request.action,
            &request.mac,
            request.ip.as_deref(),
            request.hostname.as_deref(),
        )
        .await?;
    ok()
}

#[derive(Debug, Deserialize)]
pub struct EnterPortalRequest {
    pub portal_ssid: String,
    pub ssid: String,
    #[serde(default, alias = "pass")]
    pub password: Option<String>,
}

/// `POST /api/enter-portal` — composite captive-portal credential handoff.
pub async fn enter_portal(
    State(coord): State<Arc<Coordinator>>,
    Json(request): Json<EnterPortalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    coord
        .radio
        .enter_portal(&request.portal_ssid, &request.ssid, request.password.as_deref())
        .await?;
    ok()
}
