// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP surface: thin axum handlers dispatching into the coordinator.
//!
//! Success responses are `{"ok": true, ...}`; failures are produced by
//! [`ApiError`](crate::error::ApiError) as `{"ok": false, "error": ...}`.

mod ble;
mod firmware;
mod gpio;
mod human;
mod misc;
mod serial;
mod slots;
mod udplog;
mod wifi;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::slot::Slot;

/// Wrap a serialisable payload in the success envelope.
fn envelope<T: Serialize>(payload: T) -> Result<Json<serde_json::Value>, ApiError> {
    let mut value = serde_json::to_value(payload)
        .map_err(|e| ApiError::internal(format!("serialising response: {e}")))?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("ok".to_owned(), serde_json::Value::Bool(true));
            Ok(Json(value))
        }
        None => Ok(Json(serde_json::json!({ "ok": true, "result": value }))),
    }
}

/// Bare `{"ok": true}` success.
fn ok() -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Resolve a client-supplied slot reference (label or slot_key).
fn resolve_slot(coord: &Coordinator, reference: &str) -> Result<Arc<Slot>, ApiError> {
    coord
        .slots
        .resolve(reference)
        .ok_or_else(|| ApiError::not_found(format!("unknown slot: {reference}")))
}

/// Build the axum router with every API route.
pub fn build_router(coord: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/health", get(misc::health))
        .route("/api/info", get(misc::info))
        .route("/api/log", get(misc::activity_log))
        .route("/api/devices", get(slots::devices))
        .route("/api/hotplug", post(slots::hotplug))
        .route("/api/start", post(slots::start))
        .route("/api/stop", post(slots::stop))
        .route("/api/serial/reset", post(serial::reset))
        .route("/api/serial/monitor", post(serial::monitor))
        .route("/api/serial/recover", post(serial::recover))
        .route("/api/serial/release", post(serial::release))
        .route("/api/wifi/mode", get(wifi::get_mode).post(wifi::set_mode))
        .route("/api/wifi/ap_start", post(wifi::ap_start))
        .route("/api/wifi/ap_stop", post(wifi::ap_stop))
        .route("/api/wifi/ap_status", get(wifi::ap_status))
        .route("/api/wifi/sta_join", post(wifi::sta_join))
        .route("/api/wifi/sta_leave", post(wifi::sta_leave))
        .route("/api/wifi/scan", get(wifi::scan))
        .route("/api/wifi/http", post(wifi::http_relay))
        .route("/api/wifi/events", get(wifi::events))
        .route("/api/wifi/lease_event", post(wifi::lease_event))
        .route("/api/enter-portal", post(wifi::enter_portal))
        .route("/api/gpio/set", post(gpio::set))
        .route("/api/gpio/status", get(gpio::status))
        .route("/api/udplog", get(udplog::query).delete(udplog::clear))
        .route("/api/firmware/upload", post(firmware::upload))
        .route("/api/firmware/list", get(firmware::list))
        .route("/api/firmware/delete", delete(firmware::remove).post(firmware::remove))
        .route("/firmware/{project}/{file}", get(firmware::download))
        .route("/api/human-interaction", post(human::interaction))
        .route("/api/human/status", get(human::status))
        .route("/api/human/done", post(human::done))
        .route("/api/human/cancel", post(human::cancel))
        .route("/api/test/update", post(misc::test_update))
        .route("/api/test/progress", get(misc::test_progress))
        .route("/api/ble/scan", post(ble::scan))
        .route("/api/ble/connect", post(ble::connect))
        .route("/api/ble/write", post(ble::write))
        .route("/api/ble/disconnect", post(ble::disconnect))
        .route("/api/ble/status", get(ble::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coord)
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
