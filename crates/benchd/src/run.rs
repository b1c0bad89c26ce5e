// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level daemon runner — shared by `main` and the end-to-end tests.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Once;

use anyhow::Context;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::activity::{ActivityLevel, ActivityLog, DEFAULT_CAPACITY};
use crate::ble::{BleCentral, BluetoothBackend, DisabledBluetooth};
use crate::clock::Clock;
use crate::config::{load_slot_map, Config};
use crate::coordinator::{BenchSettings, Coordinator};
use crate::events::EventQueue;
use crate::firmware::FirmwareStore;
use crate::flap::UsbControl;
use crate::gpio::{GpioBank, SysfsGpio};
use crate::hotplug;
use crate::http::build_router;
use crate::human::HumanGate;
use crate::progress::ProgressState;
use crate::radio::system::SystemRadio;
use crate::radio::{RadioArbiter, RadioBackend, RadioSettings};
use crate::slot::SlotMap;
use crate::udplog::{self, UdpLogRing};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls. Safe to call
/// multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / BENCHD_LOG_LEVEL > RUST_LOG > default.
    let filter = if std::env::var("BENCHD_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// A fully-prepared daemon: coordinator built, boot scan done, sockets
/// bound, background sinks running.
pub struct PreparedDaemon {
    pub coord: Arc<Coordinator>,
    listener: TcpListener,
}

impl PreparedDaemon {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve HTTP until shutdown, then drain workers and proxies.
    pub async fn serve(self) -> anyhow::Result<()> {
        let router = build_router(Arc::clone(&self.coord));
        let shutdown = self.coord.shutdown.clone();
        info!("HTTP listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("shutting down, draining workers");
        self.coord.drain().await;
        Ok(())
    }
}

/// Run the daemon to completion (SIGINT/SIGTERM initiate shutdown).
pub async fn run(config: Config) -> anyhow::Result<()> {
    let prepared = prepare(config).await?;
    spawn_signal_handler(prepared.coord.shutdown.clone());
    prepared.serve().await
}

/// Build the coordinator over the real backends and bind all sockets.
pub async fn prepare(config: Config) -> anyhow::Result<PreparedDaemon> {
    init_tracing(&config);
    ensure_crypto();

    let slot_map = load_slot_map(&config.slot_map)?;
    info!("slot map: {} slots from {}", slot_map.slots.len(), config.slot_map.display());

    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "bench".to_owned());
    let advertise_host =
        primary_ip().map(|ip| ip.to_string()).unwrap_or_else(|| hostname.clone());
    let settings = BenchSettings::from_config(&config, advertise_host, hostname);

    let clock = Arc::new(Clock::new());
    let activity = Arc::new(ActivityLog::new(Arc::clone(&clock), DEFAULT_CAPACITY));
    let events = Arc::new(EventQueue::new());
    let slots = Arc::new(SlotMap::new(&slot_map.slots));

    let radio_backend: Arc<dyn RadioBackend> = Arc::new(SystemRadio::new(
        &config.wifi_interface,
        config.run_dir.clone(),
        config.lease_script.clone(),
    ));
    let radio = Arc::new(RadioArbiter::new(
        RadioSettings { interface: config.wifi_interface.clone(), ap_ip: config.ap_ip },
        radio_backend,
        Arc::clone(&events),
        Arc::clone(&activity),
        Arc::clone(&clock),
    ));

    // The Central stack is an external collaborator; without one wired in
    // the facade answers every radio op with an internal error.
    let ble_backend: Arc<dyn BluetoothBackend> = Arc::new(DisabledBluetooth::default());
    let ble = BleCentral::new(ble_backend, Arc::clone(&activity));

    let gpio = Arc::new(GpioBank::new(
        config.gpio_pins.iter().copied(),
        Box::new(SysfsGpio::new(config.gpio_root.clone())),
    ));

    let coord = Arc::new(Coordinator {
        settings,
        clock: Arc::clone(&clock),
        activity: Arc::clone(&activity),
        events,
        slots,
        radio,
        ble,
        gpio,
        firmware: Arc::new(FirmwareStore::new(config.firmware_dir.clone())),
        udplog: Arc::new(UdpLogRing::new(Arc::clone(&clock), config.udp_log_capacity)),
        human: Arc::new(HumanGate::new(Arc::clone(&clock))),
        progress: Arc::new(ProgressState::new(clock)),
        usb: UsbControl::new(config.sysfs_root.clone()),
        tracker: TaskTracker::new(),
        shutdown: CancellationToken::new(),
    });

    // UDP log sink.
    let udp_socket = UdpSocket::bind(("0.0.0.0", config.udp_log_port))
        .await
        .with_context(|| format!("binding UDP log port {}", config.udp_log_port))?;
    info!("UDP log sink on {}", udp_socket.local_addr()?);
    {
        let ring = Arc::clone(&coord.udplog);
        let cancel = coord.shutdown.clone();
        coord.tracker.spawn(udplog::run(udp_socket, ring, cancel));
    }

    // Pick up devices that were plugged while the daemon was down.
    hotplug::boot_scan(&coord).await;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;

    coord.log(ActivityLevel::Ok, "daemon", "bench daemon ready");
    Ok(PreparedDaemon { coord, listener })
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("installing SIGTERM handler: {e}");
                    return;
                }
            };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("ctrl-c handler: {e}");
                }
            }
            _ = sigterm.recv() => {}
        }
        info!("signal received, shutting down");
        shutdown.cancel();
    });
}

/// Best-effort primary address: the source address the kernel would use
/// for an external destination. No packets are sent.
fn primary_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip())
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
