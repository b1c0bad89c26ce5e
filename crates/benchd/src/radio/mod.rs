// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Radio-mode arbiter: multiplexes the one wireless interface between
//! access-point, station, and scan roles, mutually exclusive with the
//! "uplink" operating mode that reserves the radio for bench connectivity.
//!
//! All wireless operations serialise on one process-wide lock. Failures
//! revert to `Idle` (or the previous AP) before returning.

pub mod backend;
pub mod system;

pub use backend::{ApConfig, RadioBackend, ScanNetwork, StaLease};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::activity::{ActivityLevel, ActivityLog};
use crate::clock::Clock;
use crate::error::ApiError;
use crate::events::{EventQueue, WirelessEvent, WirelessEventKind};

/// Default AP channel when the caller does not pick one.
pub const DEFAULT_AP_CHANNEL: u8 = 6;

/// DHCP lease time handed to stations.
pub const AP_LEASE_SECS: u32 = 3600;

/// Path on a DUT's captive portal that accepts WiFi credentials.
pub const PORTAL_CREDENTIALS_PATH: &str = "/connect";

/// How long the relay waits for the DUT's HTTP server.
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplicant poll cadence during association.
const ASSOC_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RadioState {
    Idle,
    Ap { ssid: String, channel: u8 },
    Sta { ssid: String, ip: String, gateway: String },
    Uplink { ssid: String, ip: String },
}

impl RadioState {
    pub fn mode_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ap { .. } => "ap",
            Self::Sta { .. } => "sta",
            Self::Uplink { .. } => "uplink",
        }
    }

    pub fn is_uplink(&self) -> bool {
        matches!(self, Self::Uplink { .. })
    }
}

/// A station known from lease events, keyed by MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub connected_ms: u64,
}

/// Remembered AP parameters, used to restore the AP after a failed
/// uplink switch and to rebuild it in `enter_portal`.
#[derive(Debug, Clone)]
struct ApParams {
    ssid: String,
    password: Option<String>,
    channel: u8,
}

struct RadioInner {
    state: RadioState,
    stations: HashMap<String, Station>,
    last_ap: Option<ApParams>,
}

#[derive(Debug, Clone)]
pub struct RadioSettings {
    pub interface: String,
    pub ap_ip: Ipv4Addr,
}

/// Outbound HTTP request relayed through the radio interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64-encoded request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Base64-encoded response body.
    pub body: String,
}

pub struct RadioArbiter {
    settings: RadioSettings,
    backend: Arc<dyn RadioBackend>,
    lock: Mutex<RadioInner>,
    events: Arc<EventQueue>,
    activity: Arc<ActivityLog>,
    clock: Arc<Clock>,
}

impl RadioArbiter {
    pub fn new(
        settings: RadioSettings,
        backend: Arc<dyn RadioBackend>,
        events: Arc<EventQueue>,
        activity: Arc<ActivityLog>,
        clock: Arc<Clock>,
    ) -> Self {
        Self {
            settings,
            backend,
            lock: Mutex::new(RadioInner {
                state: RadioState::Idle,
                stations: HashMap::new(),
                last_ap: None,
            }),
            events,
            activity,
            clock,
        }
    }

    pub async fn state(&self) -> RadioState {
        self.lock.lock().await.state.clone()
    }

    pub async fn stations(&self) -> Vec<Station> {
        let inner = self.lock.lock().await;
        let mut stations: Vec<Station> = inner.stations.values().cloned().collect();
        stations.sort_by(|a, b| a.mac.cmp(&b.mac));
        stations
    }

    fn guard_testing(inner: &RadioInner) -> Result<(), ApiError> {
        if inner.state.is_uplink() {
            return Err(ApiError::unavailable("wireless testing disabled"));
        }
        Ok(())
    }

    /// Bring up the AP, replacing any current wireless role.
    pub async fn ap_start(
        &self,
        ssid: &str,
        password: Option<&str>,
        channel: Option<u8>,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock.lock().await;
        Self::guard_testing(&inner)?;
        self.teardown_current(&mut inner).await;

        let channel = channel.unwrap_or(DEFAULT_AP_CHANNEL);
        let ip = self.settings.ap_ip;
        let octets = ip.octets();
        let config = ApConfig {
            interface: self.settings.interface.clone(),
            ssid: ssid.to_owned(),
            password: password.map(str::to_owned),
            channel,
            ip,
            dhcp_range_start: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] + 1),
            dhcp_range_end: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] + 19),
            lease_secs: AP_LEASE_SECS,
        };
        if let Err(e) = self.backend.start_ap(config).await {
            inner.state = RadioState::Idle;
            self.activity.push(ActivityLevel::Error, "wifi", format!("ap_start failed: {e:#}"));
            return Err(ApiError::internal(format!("ap_start: {e:#}")));
        }
        inner.state = RadioState::Ap { ssid: ssid.to_owned(), channel };
        inner.last_ap = Some(ApParams {
            ssid: ssid.to_owned(),
            password: password.map(str::to_owned),
            channel,
        });
        self.activity.push(ActivityLevel::Ok, "wifi", format!("AP '{ssid}' up on channel {channel}"));
        Ok(())
    }

    /// Tear the AP down; a no-op when no AP is running.
    pub async fn ap_stop(&self) -> Result<(), ApiError> {
        let mut inner = self.lock.lock().await;
        Self::guard_testing(&inner)?;
        if !matches!(inner.state, RadioState::Ap { .. }) {
            return Ok(());
        }
        self.stop_ap_inner(&mut inner).await;
        self.activity.push(ActivityLevel::Ok, "wifi", "AP stopped");
        Ok(())
    }

    async fn stop_ap_inner(&self, inner: &mut RadioInner) {
        if let Err(e) = self.backend.stop_ap().await {
            self.activity.push(ActivityLevel::Error, "wifi", format!("ap_stop failed: {e:#}"));
        }
        // Every known station is gone with the AP.
        for station in inner.stations.values() {
            self.events.push(WirelessEvent {
                kind: WirelessEventKind::StaDisconnect,
                mac: station.mac.clone(),
                ip: station.ip.clone(),
                hostname: station.hostname.clone(),
                ts_ms: self.clock.now_ms(),
            });
        }
        inner.stations.clear();
        inner.state = RadioState::Idle;
    }

    /// Join a network as a station, replacing any current wireless role.
    pub async fn sta_join(
        &self,
        ssid: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<StaLease, ApiError> {
        let mut inner = self.lock.lock().await;
        Self::guard_testing(&inner)?;
        self.teardown_current(&mut inner).await;

        let lease = match self.join_inner(ssid, password, timeout).await {
            Ok(lease) => lease,
            Err(e) => {
                inner.state = RadioState::Idle;
                self.activity.push(
                    ActivityLevel::Error,
                    "wifi",
                    format!("sta_join '{ssid}' failed: {}", e.message),
                );
                return Err(e);
            }
        };
        inner.state = RadioState::Sta {
            ssid: ssid.to_owned(),
            ip: lease.ip.clone(),
            gateway: lease.gateway.clone(),
        };
        self.activity.push(
            ActivityLevel::Ok,
            "wifi",
            format!("joined '{ssid}' as {}", lease.ip),
        );
        Ok(lease)
    }

    /// Association + DHCP with full revert on any step failure.
    async fn join_inner(
        &self,
        ssid: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<StaLease, ApiError> {
        if let Err(e) = self
            .backend
            .start_station(ssid.to_owned(), password.map(str::to_owned))
            .await
        {
            return Err(ApiError::internal(format!("supplicant: {e:#}")));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.backend.station_state().await {
                Ok(state) if state == "COMPLETED" => break,
                Ok(state) => debug!("association state: {state}"),
                Err(e) => debug!("supplicant poll failed: {e:#}"),
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.backend.stop_station().await;
                return Err(ApiError::timeout(format!("association with '{ssid}' timed out")));
            }
            tokio::time::sleep(ASSOC_POLL).await;
        }

        match self.backend.acquire_lease().await {
            Ok(lease) => Ok(lease),
            Err(e) => {
                let _ = self.backend.stop_station().await;
                Err(ApiError::internal(format!("dhcp: {e:#}")))
            }
        }
    }

    /// Leave the station network; a no-op when not joined.
    pub async fn sta_leave(&self) -> Result<(), ApiError> {
        let mut inner = self.lock.lock().await;
        Self::guard_testing(&inner)?;
        if !matches!(inner.state, RadioState::Sta { .. }) {
            return Ok(());
        }
        if let Err(e) = self.backend.stop_station().await {
            self.activity.push(ActivityLevel::Error, "wifi", format!("sta_leave failed: {e:#}"));
        }
        inner.state = RadioState::Idle;
        self.activity.push(ActivityLevel::Ok, "wifi", "left station network");
        Ok(())
    }

    /// Scan for networks. Allowed alongside a running AP; the own AP SSID
    /// is omitted from the result.
    pub async fn scan(&self) -> Result<Vec<ScanNetwork>, ApiError> {
        let inner = self.lock.lock().await;
        Self::guard_testing(&inner)?;
        let own_ssid = match inner.state {
            RadioState::Ap { ref ssid, .. } => Some(ssid.clone()),
            _ => None,
        };
        let mut networks = self
            .backend
            .scan()
            .await
            .map_err(|e| ApiError::internal(format!("scan: {e:#}")))?;
        if let Some(own) = own_ssid {
            networks.retain(|n| n.ssid != own);
        }
        networks.sort_by_key(|n| std::cmp::Reverse(n.signal_dbm));
        Ok(networks)
    }

    /// Switch the radio into uplink mode (bench connectivity via WiFi).
    ///
    /// On failure the previous role is restored: a running AP is rebuilt,
    /// anything else reverts to `Idle`.
    pub async fn enter_uplink(
        &self,
        ssid: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<StaLease, ApiError> {
        let mut inner = self.lock.lock().await;
        if inner.state.is_uplink() {
            return Err(ApiError::conflict("already in uplink mode"));
        }
        let previous_ap = match inner.state {
            RadioState::Ap { .. } => inner.last_ap.clone(),
            _ => None,
        };
        self.teardown_current(&mut inner).await;

        match self.join_inner(ssid, password, timeout).await {
            Ok(lease) => {
                inner.state = RadioState::Uplink { ssid: ssid.to_owned(), ip: lease.ip.clone() };
                self.activity.push(
                    ActivityLevel::Ok,
                    "wifi",
                    format!("uplink via '{ssid}' as {}", lease.ip),
                );
                Ok(lease)
            }
            Err(e) => {
                if let Some(params) = previous_ap {
                    let restored = self
                        .restore_ap(&mut inner, &params)
                        .await;
                    if !restored {
                        inner.state = RadioState::Idle;
                    }
                } else {
                    inner.state = RadioState::Idle;
                }
                self.activity.push(
                    ActivityLevel::Error,
                    "wifi",
                    format!("uplink join failed: {}", e.message),
                );
                Err(e)
            }
        }
    }

    /// Leave uplink mode and return the radio to the testers.
    pub async fn leave_uplink(&self) -> Result<(), ApiError> {
        let mut inner = self.lock.lock().await;
        if !inner.state.is_uplink() {
            return Ok(());
        }
        if let Err(e) = self.backend.stop_station().await {
            self.activity.push(ActivityLevel::Error, "wifi", format!("uplink stop failed: {e:#}"));
        }
        inner.state = RadioState::Idle;
        self.activity.push(ActivityLevel::Ok, "wifi", "uplink mode off, wireless testing enabled");
        Ok(())
    }

    async fn restore_ap(&self, inner: &mut RadioInner, params: &ApParams) -> bool {
        let ip = self.settings.ap_ip;
        let octets = ip.octets();
        let config = ApConfig {
            interface: self.settings.interface.clone(),
            ssid: params.ssid.clone(),
            password: params.password.clone(),
            channel: params.channel,
            ip,
            dhcp_range_start: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] + 1),
            dhcp_range_end: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3] + 19),
            lease_secs: AP_LEASE_SECS,
        };
        match self.backend.start_ap(config).await {
            Ok(()) => {
                inner.state = RadioState::Ap {
                    ssid: params.ssid.clone(),
                    channel: params.channel,
                };
                true
            }
            Err(e) => {
                self.activity.push(
                    ActivityLevel::Error,
                    "wifi",
                    format!("AP restore failed: {e:#}"),
                );
                false
            }
        }
    }

    /// Stop whatever role is active. Callers must hold the lock.
    async fn teardown_current(&self, inner: &mut RadioInner) {
        match inner.state {
            RadioState::Ap { .. } => self.stop_ap_inner(inner).await,
            RadioState::Sta { .. } | RadioState::Uplink { .. } => {
                if let Err(e) = self.backend.stop_station().await {
                    self.activity.push(
                        ActivityLevel::Error,
                        "wifi",
                        format!("station teardown failed: {e:#}"),
                    );
                }
                inner.state = RadioState::Idle;
            }
            RadioState::Idle => {}
        }
    }

    /// Ingest a DHCP lease callback (`add` / `old` / `del`).
    pub async fn lease_event(
        &self,
        action: &str,
        mac: &str,
        ip: Option<&str>,
        hostname: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock.lock().await;
        let now = self.clock.now_ms();
        match action {
            "add" | "old" => {
                let is_new = !inner.stations.contains_key(mac);
                let station =
                    inner.stations.entry(mac.to_owned()).or_insert_with(|| Station {
                        mac: mac.to_owned(),
                        ip: None,
                        hostname: None,
                        connected_ms: now,
                    });
                if ip.is_some() {
                    station.ip = ip.map(str::to_owned);
                }
                if hostname.is_some() {
                    station.hostname = hostname.map(str::to_owned);
                }
                if is_new || action == "add" {
                    self.events.push(WirelessEvent {
                        kind: WirelessEventKind::StaConnect,
                        mac: mac.to_owned(),
                        ip: ip.map(str::to_owned),
                        hostname: hostname.map(str::to_owned),
                        ts_ms: now,
                    });
                    self.activity.push(
                        ActivityLevel::Info,
                        "wifi",
                        format!("station {mac} connected"),
                    );
                }
            }
            "del" => {
                let known = inner.stations.remove(mac);
                self.events.push(WirelessEvent {
                    kind: WirelessEventKind::StaDisconnect,
                    mac: mac.to_owned(),
                    ip: ip.map(str::to_owned).or_else(|| known.as_ref().and_then(|s| s.ip.clone())),
                    hostname: hostname
                        .map(str::to_owned)
                        .or_else(|| known.and_then(|s| s.hostname)),
                    ts_ms: now,
                });
                self.activity.push(
                    ActivityLevel::Info,
                    "wifi",
                    format!("station {mac} disconnected"),
                );
            }
            other => {
                return Err(ApiError::bad_request(format!("unknown lease action: {other}")));
            }
        }
        Ok(())
    }

    /// Execute an outbound HTTP request bound to the radio interface.
    pub async fn http_relay(&self, request: RelayRequest) -> Result<RelayResponse, ApiError> {
        let inner = self.lock.lock().await;
        match inner.state {
            RadioState::Ap { .. } | RadioState::Sta { .. } => {}
            RadioState::Uplink { .. } => {
                return Err(ApiError::unavailable("wireless testing disabled"));
            }
            RadioState::Idle => {
                return Err(ApiError::conflict("no wireless connectivity"));
            }
        }
        let local = self
            .backend
            .interface_ip()
            .await
            .map_err(|e| ApiError::internal(format!("interface ip: {e:#}")))?;
        drop(inner);

        relay(local, request).await
    }

    /// Composite captive-portal flow: join the DUT's AP, POST the target
    /// credentials, then rebuild our own AP so the DUT comes back as a
    /// station.
    pub async fn enter_portal(
        &self,
        portal_ssid: &str,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<(), ApiError> {
        self.activity.push(
            ActivityLevel::Step,
            "portal",
            format!("joining captive portal '{portal_ssid}'"),
        );
        let lease = self.sta_join(portal_ssid, None, Duration::from_secs(15)).await?;

        self.activity.push(ActivityLevel::Step, "portal", "posting credentials");
        let url = format!("http://{}{PORTAL_CREDENTIALS_PATH}", lease.gateway);
        let form: Vec<(&str, &str)> = match password {
            Some(password) => vec![("ssid", ssid), ("password", password)],
            None => vec![("ssid", ssid)],
        };
        let client = reqwest::Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .map_err(|e| ApiError::internal(format!("http client: {e}")))?;
        let result = client.post(&url).form(&form).send().await;
        // The portal exits immediately after accepting credentials, so a
        // dropped connection here is expected.
        if let Err(e) = result {
            debug!("portal POST ended with: {e}");
        }

        self.sta_leave().await?;

        self.activity.push(ActivityLevel::Step, "portal", format!("rebuilding AP '{ssid}'"));
        self.ap_start(ssid, password, None).await?;
        self.activity.push(ActivityLevel::Ok, "portal", "portal handoff complete");
        Ok(())
    }
}

async fn relay(
    local: Option<std::net::IpAddr>,
    request: RelayRequest,
) -> Result<RelayResponse, ApiError> {
    let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
        .map_err(|_| ApiError::bad_request(format!("invalid method: {}", request.method)))?;
    let body = match request.body {
        Some(ref b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| ApiError::bad_request("body is not valid base64"))?,
        None => Vec::new(),
    };

    let mut builder = reqwest::Client::builder().timeout(RELAY_TIMEOUT);
    if let Some(ip) = local {
        builder = builder.local_address(ip);
    }
    let client = builder.build().map_err(|e| ApiError::internal(format!("http client: {e}")))?;

    let mut req = client.request(method, &request.url);
    for (name, value) in &request.headers {
        req = req.header(name, value);
    }
    if !body.is_empty() {
        req = req.body(body);
    }

    let response = req.send().await.map_err(|e| ApiError::internal(format!("relay: {e}")))?;
    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), value.to_owned());
        }
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::internal(format!("relay body: {e}")))?;
    Ok(RelayResponse {
        status,
        headers,
        body: base64::engine::general_purpose::STANDARD.encode(&bytes),
    })
}

#[cfg(test)]
#[path = "arbiter_tests.rs"]
mod tests;
