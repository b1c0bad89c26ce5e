// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability interface over the wireless plumbing.
//!
//! The arbiter owns the state machine; implementations own the subprocess
//! zoo (`hostapd`, `dnsmasq`, `wpa_supplicant`, `iw`, DHCP clients) or, in
//! tests, nothing at all.

use std::net::{IpAddr, Ipv4Addr};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Access-point parameters handed to the backend.
#[derive(Debug, Clone)]
pub struct ApConfig {
    pub interface: String,
    pub ssid: String,
    pub password: Option<String>,
    pub channel: u8,
    pub ip: Ipv4Addr,
    pub dhcp_range_start: Ipv4Addr,
    pub dhcp_range_end: Ipv4Addr,
    pub lease_secs: u32,
}

/// Result of a successful DHCP acquisition on the station interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaLease {
    pub ip: String,
    pub gateway: String,
}

/// One network from a scan, sorted strongest-first by the arbiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanNetwork {
    pub ssid: String,
    pub signal_dbm: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    pub secured: bool,
}

/// Wireless plumbing the arbiter drives. One implementation per process.
pub trait RadioBackend: Send + Sync {
    /// Bring up an access point with DHCP service.
    fn start_ap(&self, config: ApConfig) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Tear the access point down.
    fn stop_ap(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Launch the supplicant for the given network. Association is polled
    /// separately via [`RadioBackend::station_state`].
    fn start_station(
        &self,
        ssid: String,
        password: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Current supplicant state string (e.g. `COMPLETED`, `SCANNING`).
    fn station_state(&self) -> BoxFuture<'_, anyhow::Result<String>>;

    /// Acquire a DHCP lease on the station interface.
    fn acquire_lease(&self) -> BoxFuture<'_, anyhow::Result<StaLease>>;

    /// Release any lease and terminate the supplicant.
    fn stop_station(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Scan for networks. Allowed while the AP is up.
    fn scan(&self) -> BoxFuture<'_, anyhow::Result<Vec<ScanNetwork>>>;

    /// Address currently bound to the radio interface, if any.
    fn interface_ip(&self) -> BoxFuture<'_, anyhow::Result<Option<IpAddr>>>;
}
