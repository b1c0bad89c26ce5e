// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bluetooth Central facade: one connection at a time, with the actual
//! radio stack behind a capability trait so the core runs without one.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::activity::{ActivityLevel, ActivityLog};
use crate::error::ApiError;

/// Advertisement seen during a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleAdvert {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub rssi: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: String,
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: String,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Connection result delivered by the backend.
#[derive(Debug, Clone)]
pub struct BleConnection {
    pub name: Option<String>,
    pub services: Vec<GattService>,
}

/// Out-of-band notifications from the radio stack.
#[derive(Debug, Clone)]
pub enum BleEvent {
    Disconnected { address: String },
}

/// Facade state. At most one of these at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum BleState {
    Idle,
    Scanning,
    Connected { address: String, name: Option<String>, services: Vec<GattService> },
}

impl BleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connected { .. } => "connected",
        }
    }
}

/// Capability interface over the Central radio stack.
pub trait BluetoothBackend: Send + Sync {
    fn scan(&self, timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<BleAdvert>>>;

    fn connect(&self, address: String) -> BoxFuture<'_, anyhow::Result<BleConnection>>;

    fn write(
        &self,
        characteristic: String,
        payload: Vec<u8>,
        with_response: bool,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Subscribe to remote-initiated events (disconnects).
    fn events(&self) -> broadcast::Receiver<BleEvent>;
}

/// Backend used when no Central stack is wired in.
pub struct DisabledBluetooth {
    events: broadcast::Sender<BleEvent>,
}

impl Default for DisabledBluetooth {
    fn default() -> Self {
        let (events, _) = broadcast::channel(8);
        Self { events }
    }
}

impl BluetoothBackend for DisabledBluetooth {
    fn scan(&self, _timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<BleAdvert>>> {
        Box::pin(async { anyhow::bail!("bluetooth backend not available") })
    }

    fn connect(&self, _address: String) -> BoxFuture<'_, anyhow::Result<BleConnection>> {
        Box::pin(async { anyhow::bail!("bluetooth backend not available") })
    }

    fn write(
        &self,
        _characteristic: String,
        _payload: Vec<u8>,
        _with_response: bool,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("bluetooth backend not available") })
    }

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn events(&self) -> broadcast::Receiver<BleEvent> {
        self.events.subscribe()
    }
}

pub struct BleCentral {
    backend: Arc<dyn BluetoothBackend>,
    lock: Mutex<BleState>,
    activity: Arc<ActivityLog>,
}

impl BleCentral {
    pub fn new(backend: Arc<dyn BluetoothBackend>, activity: Arc<ActivityLog>) -> Arc<Self> {
        let central = Arc::new(Self { backend, lock: Mutex::new(BleState::Idle), activity });
        central.spawn_event_watcher();
        central
    }

    /// Watch for remote disconnects and drop back to `Idle` so subsequent
    /// status reads see it.
    fn spawn_event_watcher(self: &Arc<Self>) {
        let central = Arc::clone(self);
        let mut events = central.backend.events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    BleEvent::Disconnected { address } => {
                        let mut state = central.lock.lock().await;
                        if matches!(*state, BleState::Connected { address: ref a, .. } if *a == address)
                        {
                            *state = BleState::Idle;
                            central.activity.push(
                                ActivityLevel::Info,
                                "ble",
                                format!("{address} disconnected"),
                            );
                        }
                    }
                }
            }
        });
    }

    pub async fn status(&self) -> BleState {
        self.lock.lock().await.clone()
    }

    /// Scan for peripherals, optionally filtering by name substring.
    pub async fn scan(
        &self,
        timeout: Duration,
        name_filter: Option<&str>,
    ) -> Result<Vec<BleAdvert>, ApiError> {
        {
            let mut state = self.lock.lock().await;
            match *state {
                BleState::Idle => {}
                BleState::Scanning => return Err(ApiError::conflict("scan already running")),
                BleState::Connected { .. } => {
                    return Err(ApiError::conflict("already_connected"))
                }
            }
            // Status reads see Scanning while the radio works.
            *state = BleState::Scanning;
        }
        let result = self.backend.scan(timeout).await;
        {
            let mut state = self.lock.lock().await;
            if matches!(*state, BleState::Scanning) {
                *state = BleState::Idle;
            }
        }

        let mut adverts =
            result.map_err(|e| ApiError::internal(format!("ble scan: {e:#}")))?;
        if let Some(filter) = name_filter {
            let needle = filter.to_lowercase();
            adverts.retain(|a| {
                a.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&needle))
            });
        }
        adverts.sort_by_key(|a| std::cmp::Reverse(a.rssi));
        Ok(adverts)
    }

    /// Connect and discover services; fails with `already_connected` when a
    /// connection exists.
    pub async fn connect(&self, address: &str) -> Result<Vec<GattService>, ApiError> {
        let mut state = self.lock.lock().await;
        match *state {
            BleState::Idle => {}
            BleState::Scanning => return Err(ApiError::conflict("scan in progress")),
            BleState::Connected { .. } => return Err(ApiError::conflict("already_connected")),
        }
        let connection = self
            .backend
            .connect(address.to_owned())
            .await
            .map_err(|e| ApiError::internal(format!("ble connect: {e:#}")))?;
        info!(address, "BLE connected");
        self.activity.push(ActivityLevel::Ok, "ble", format!("connected to {address}"));
        let services = connection.services.clone();
        *state = BleState::Connected {
            address: address.to_owned(),
            name: connection.name,
            services: connection.services,
        };
        Ok(services)
    }

    /// Write hex-encoded bytes to a characteristic.
    pub async fn write(
        &self,
        characteristic: &str,
        hex: &str,
        with_response: bool,
    ) -> Result<usize, ApiError> {
        let payload = parse_hex(hex)?;
        let state = self.lock.lock().await;
        if !matches!(*state, BleState::Connected { .. }) {
            return Err(ApiError::conflict("not_connected"));
        }
        let len = payload.len();
        self.backend
            .write(characteristic.to_owned(), payload, with_response)
            .await
            .map_err(|e| ApiError::internal(format!("ble write: {e:#}")))?;
        Ok(len)
    }

    /// Disconnect; a no-op when already idle.
    pub async fn disconnect(&self) -> Result<(), ApiError> {
        let mut state = self.lock.lock().await;
        if matches!(*state, BleState::Connected { .. }) {
            self.backend
                .disconnect()
                .await
                .map_err(|e| ApiError::internal(format!("ble disconnect: {e:#}")))?;
            self.activity.push(ActivityLevel::Ok, "ble", "disconnected");
        }
        *state = BleState::Idle;
        Ok(())
    }
}

/// Decode a hex string, tolerating `0x` prefixes, colons and whitespace.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, ApiError> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if cleaned.is_empty() {
        return Err(ApiError::bad_request("empty hex payload"));
    }
    if cleaned.len() % 2 != 0 {
        return Err(ApiError::bad_request("hex payload has odd length"));
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    let chars: Vec<char> = cleaned.chars().collect();
    for pair in chars.chunks(2) {
        let high = pair[0].to_digit(16);
        let low = pair[1].to_digit(16);
        match (high, low) {
            (Some(h), Some(l)) => bytes.push((h * 16 + l) as u8),
            _ => return Err(ApiError::bad_request("invalid hex payload")),
        }
    }
    Ok(bytes)
}

#[cfg(test)]
#[path = "ble_tests.rs"]
mod tests;
