// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single `Coordinator` value constructed at startup and shared with
//! every handler and worker. No package-level mutables anywhere.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::activity::{ActivityLevel, ActivityLog};
use crate::ble::BleCentral;
use crate::clock::Clock;
use crate::config::Config;
use crate::events::EventQueue;
use crate::firmware::FirmwareStore;
use crate::flap::UsbControl;
use crate::gpio::GpioBank;
use crate::human::HumanGate;
use crate::progress::ProgressState;
use crate::radio::RadioArbiter;
use crate::slot::SlotMap;
use crate::udplog::UdpLogRing;

/// Derived runtime settings, immutable after construction.
#[derive(Debug, Clone)]
pub struct BenchSettings {
    /// Host name/address advertised in per-slot proxy URLs.
    pub advertise_host: String,
    pub hostname: String,
    pub flap_window_ms: u64,
    pub flap_threshold: usize,
    pub flap_cooldown: Duration,
    pub flap_max_retries: u32,
    pub settle_timeout: Duration,
    pub post_add_delay: Duration,
    pub dev_root: PathBuf,
    pub sysfs_root: PathBuf,
    pub wifi_interface: String,
    pub ap_ip: Ipv4Addr,
    pub ble_scan_timeout: Duration,
    pub udp_log_port: u16,
}

impl BenchSettings {
    pub fn from_config(config: &Config, advertise_host: String, hostname: String) -> Self {
        Self {
            advertise_host,
            hostname,
            flap_window_ms: config.flap_window * 1000,
            flap_threshold: config.flap_threshold,
            flap_cooldown: config.flap_cooldown_duration(),
            flap_max_retries: config.flap_max_retries,
            settle_timeout: config.settle_timeout_duration(),
            post_add_delay: config.post_add_delay_duration(),
            dev_root: config.dev_root.clone(),
            sysfs_root: config.sysfs_root.clone(),
            wifi_interface: config.wifi_interface.clone(),
            ap_ip: config.ap_ip,
            ble_scan_timeout: config.ble_scan_timeout_duration(),
            udp_log_port: config.udp_log_port,
        }
    }
}

/// Shared application state, organised by concern.
pub struct Coordinator {
    pub settings: BenchSettings,
    pub clock: Arc<Clock>,
    pub activity: Arc<ActivityLog>,
    pub events: Arc<EventQueue>,
    pub slots: Arc<SlotMap>,
    pub radio: Arc<RadioArbiter>,
    pub ble: Arc<BleCentral>,
    pub gpio: Arc<GpioBank>,
    pub firmware: Arc<FirmwareStore>,
    pub udplog: Arc<UdpLogRing>,
    pub human: Arc<HumanGate>,
    pub progress: Arc<ProgressState>,
    pub usb: UsbControl,
    /// All background workers register here so shutdown can drain them.
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

impl Coordinator {
    /// Convenience append to the activity log.
    pub fn log(&self, level: ActivityLevel, tag: &str, message: impl Into<String>) {
        self.activity.push(level, tag, message);
    }

    /// Stop every proxy and wait for tracked workers to finish.
    pub async fn drain(&self) {
        self.shutdown.cancel();
        for slot in self.slots.all() {
            if let Some(proxy) = slot.take_proxy() {
                proxy.stop().await;
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("slots", &self.slots.len())
            .field("host", &self.settings.advertise_host)
            .finish()
    }
}
