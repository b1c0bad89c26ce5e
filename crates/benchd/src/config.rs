// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Hardware-in-the-loop bench daemon.
#[derive(Debug, Clone, Parser)]
#[command(name = "benchd", version, about)]
pub struct Config {
    /// Host address to bind the HTTP API to.
    #[arg(long, env = "BENCHD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP API port.
    #[arg(long, env = "BENCHD_PORT", default_value = "8080")]
    pub port: u16,

    /// Path to the slot map JSON file.
    #[arg(long, env = "BENCHD_SLOT_MAP", default_value = "/etc/benchd/slots.json")]
    pub slot_map: PathBuf,

    /// Wireless interface used by the radio arbiter.
    #[arg(long, env = "BENCHD_WLAN_IF", default_value = "wlan0")]
    pub wifi_interface: String,

    /// Access-point IP address (the /24 it implies is the AP subnet).
    #[arg(long, env = "BENCHD_AP_IP", default_value = "192.168.4.1")]
    pub ap_ip: Ipv4Addr,

    /// UDP log ingress port.
    #[arg(long, env = "BENCHD_UDP_LOG_PORT", default_value = "5555")]
    pub udp_log_port: u16,

    /// UDP log ring capacity in lines.
    #[arg(long, env = "BENCHD_UDP_LOG_CAPACITY", default_value = "5000")]
    pub udp_log_capacity: usize,

    /// Root directory for firmware blobs.
    #[arg(long, env = "BENCHD_FIRMWARE_DIR", default_value = "/var/lib/benchd/firmware")]
    pub firmware_dir: PathBuf,

    /// sysfs root (overridable for tests).
    #[arg(long, env = "BENCHD_SYSFS_ROOT", default_value = "/sys")]
    pub sysfs_root: PathBuf,

    /// Device node root (overridable for tests).
    #[arg(long, env = "BENCHD_DEV_ROOT", default_value = "/dev")]
    pub dev_root: PathBuf,

    /// GPIO sysfs root (overridable for tests).
    #[arg(long, env = "BENCHD_GPIO_ROOT", default_value = "/sys/class/gpio")]
    pub gpio_root: PathBuf,

    /// Allowlisted GPIO pins for `/api/gpio/set` (comma-separated).
    #[arg(long, env = "BENCHD_GPIO_PINS", value_delimiter = ',')]
    pub gpio_pins: Vec<u32>,

    /// Default BLE scan timeout in seconds.
    #[arg(long, env = "BENCHD_BLE_SCAN_TIMEOUT", default_value = "10")]
    pub ble_scan_timeout: u64,

    /// Script handed to dnsmasq's --dhcp-script for lease callbacks.
    #[arg(long, env = "BENCHD_LEASE_SCRIPT")]
    pub lease_script: Option<PathBuf>,

    /// Runtime directory for wireless config files and control sockets.
    #[arg(long, env = "BENCHD_RUN_DIR", default_value = "/run/benchd")]
    pub run_dir: PathBuf,

    /// Flap detection window in seconds.
    #[arg(long, env = "BENCHD_FLAP_WINDOW", default_value = "30")]
    pub flap_window: u64,

    /// Hotplug events within the window that trigger flap suppression.
    #[arg(long, env = "BENCHD_FLAP_THRESHOLD", default_value = "6")]
    pub flap_threshold: usize,

    /// Cooldown between recovery steps in seconds.
    #[arg(long, env = "BENCHD_FLAP_COOLDOWN", default_value = "10")]
    pub flap_cooldown: u64,

    /// Recovery retries for slots without GPIO control.
    #[arg(long, env = "BENCHD_FLAP_MAX_RETRIES", default_value = "2")]
    pub flap_max_retries: u32,

    /// Device settle timeout after a hotplug add, in seconds.
    #[arg(long, env = "BENCHD_SETTLE_TIMEOUT", default_value = "2")]
    pub settle_timeout: u64,

    /// Extra delay before opening native-USB devices, in seconds.
    #[arg(long, env = "BENCHD_POST_ADD_DELAY", default_value = "2")]
    pub post_add_delay: u64,

    /// Log format (json or text).
    #[arg(long, env = "BENCHD_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BENCHD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("--port must be non-zero");
        }
        if self.flap_threshold < 2 {
            anyhow::bail!("--flap-threshold must be at least 2");
        }
        if self.flap_window == 0 {
            anyhow::bail!("--flap-window must be non-zero");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        // The DHCP range is AP_IP+1 .. AP_IP+19; the last octet must fit.
        if self.ap_ip.octets()[3] >= 235 {
            anyhow::bail!("--ap-ip leaves no room for the DHCP range");
        }
        Ok(())
    }

    pub fn flap_window_duration(&self) -> Duration {
        Duration::from_secs(self.flap_window)
    }

    pub fn flap_cooldown_duration(&self) -> Duration {
        Duration::from_secs(self.flap_cooldown)
    }

    pub fn settle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.settle_timeout)
    }

    pub fn post_add_delay_duration(&self) -> Duration {
        Duration::from_secs(self.post_add_delay)
    }

    pub fn ble_scan_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ble_scan_timeout)
    }
}

/// On-disk slot map: the only durable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMapFile {
    pub slots: Vec<SlotEntry>,
}

/// One configured connector position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEntry {
    pub label: String,
    pub slot_key: String,
    pub tcp_port: u16,
    /// GPIO line wired to the DUT's boot-select pin, if the bench has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_pin: Option<u32>,
    /// GPIO line wired to the DUT's reset pin, if the bench has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_pin: Option<u32>,
}

/// Load and validate the slot map file.
pub fn load_slot_map(path: &Path) -> anyhow::Result<SlotMapFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading slot map {}", path.display()))?;
    let map: SlotMapFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing slot map {}", path.display()))?;

    let mut labels = std::collections::HashSet::new();
    let mut keys = std::collections::HashSet::new();
    let mut ports = std::collections::HashSet::new();
    for entry in &map.slots {
        if entry.label.is_empty() || entry.slot_key.is_empty() {
            anyhow::bail!("slot map entries need a non-empty label and slot_key");
        }
        if !labels.insert(entry.label.clone()) {
            anyhow::bail!("duplicate slot label: {}", entry.label);
        }
        if !keys.insert(entry.slot_key.clone()) {
            anyhow::bail!("duplicate slot_key: {}", entry.slot_key);
        }
        if !ports.insert(entry.tcp_port) {
            anyhow::bail!("duplicate tcp_port: {}", entry.tcp_port);
        }
    }
    Ok(map)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
