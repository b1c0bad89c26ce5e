// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot model: one persistent abstraction per physical connector.
//!
//! Slots are created at config load and never destroyed. Fast-path fields
//! (hotplug bookkeeping) live behind a cheap mutex the ingest handler may
//! touch; all device-mutating work serialises on the async `work` lock.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SlotEntry;
use crate::proxy::ProxyHandle;

/// Modem-control behaviour family, classified from the devnode name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// `ttyACM*`: the driver asserts DTR+RTS on open, which drops the chip
    /// into its bootloader. Settle checks must not open the file.
    NativeUsb,
    /// `ttyUSB*` UART bridges: safe to probe with a non-blocking open.
    UartBridge,
}

impl DeviceFamily {
    pub fn classify(devnode: &str) -> Self {
        let name = Path::new(devnode)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(devnode);
        if name.starts_with("ttyACM") {
            Self::NativeUsb
        } else {
            Self::UartBridge
        }
    }
}

/// Slot state machine phase. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPhase {
    Absent,
    Idle,
    Monitoring,
    Resetting,
    Flashing,
    Flapping,
}

impl SlotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Idle => "idle",
            Self::Monitoring => "monitoring",
            Self::Resetting => "resetting",
            Self::Flashing => "flashing",
            Self::Flapping => "flapping",
        }
    }
}

/// Static per-slot attributes from the slot map.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub label: String,
    pub slot_key: String,
    pub tcp_port: u16,
    pub boot_pin: Option<u32>,
    pub reset_pin: Option<u32>,
}

impl SlotConfig {
    pub fn has_gpio(&self) -> bool {
        self.boot_pin.is_some() && self.reset_pin.is_some()
    }
}

/// Mutable slot attributes behind the fast-path mutex.
#[derive(Debug)]
pub struct SlotStatus {
    pub present: bool,
    pub devnode: Option<String>,
    pub phase: SlotPhase,
    pub seq: u64,
    pub last_action: Option<String>,
    pub last_event_ms: u64,
    pub last_error: Option<String>,
    pub flapping: bool,
    pub recovering: bool,
    /// Recent add/remove timestamps (ms), pruned to the flap window.
    pub event_times: VecDeque<u64>,
    /// Recovery attempts since the flap flag was last raised.
    pub retries: u32,
}

impl Default for SlotStatus {
    fn default() -> Self {
        Self {
            present: false,
            devnode: None,
            phase: SlotPhase::Absent,
            seq: 0,
            last_action: None,
            last_event_ms: 0,
            last_error: None,
            flapping: false,
            recovering: false,
            event_times: VecDeque::new(),
            retries: 0,
        }
    }
}

/// One physical connector position.
pub struct Slot {
    pub config: SlotConfig,
    /// Serialises all device-mutating work for this slot.
    pub work: tokio::sync::Mutex<()>,
    /// Fast-path state; safe to touch from the hotplug ingest handler.
    pub status: Arc<Mutex<SlotStatus>>,
    /// Ordered hotplug job queue; the sender is installed when the slot's
    /// worker is first spawned (see `hotplug`).
    pub jobs: Mutex<Option<tokio::sync::mpsc::UnboundedSender<crate::hotplug::SlotJob>>>,
    proxy: Mutex<Option<ProxyHandle>>,
}

impl Slot {
    pub fn new(entry: &SlotEntry) -> Self {
        Self {
            config: SlotConfig {
                label: entry.label.clone(),
                slot_key: entry.slot_key.clone(),
                tcp_port: entry.tcp_port,
                boot_pin: entry.boot_pin,
                reset_pin: entry.reset_pin,
            },
            work: tokio::sync::Mutex::new(()),
            status: Arc::new(Mutex::new(SlotStatus::default())),
            jobs: Mutex::new(None),
            proxy: Mutex::new(None),
        }
    }

    /// Record a hotplug event on the fast path. Prunes the event window and
    /// returns how many events remain inside it.
    pub fn record_event(&self, action: &str, seq: u64, now_ms: u64, window_ms: u64) -> usize {
        let mut status = self.status.lock();
        status.seq = seq;
        status.last_action = Some(action.to_owned());
        status.last_event_ms = now_ms;
        status.event_times.push_back(now_ms);
        prune_window(&mut status.event_times, now_ms, window_ms);
        status.event_times.len()
    }

    /// Prune aged flap events; clears the flap flag passively once the
    /// window has fully drained and no recovery is in flight.
    pub fn prune_events(&self, now_ms: u64, window_ms: u64) {
        let mut status = self.status.lock();
        prune_window(&mut status.event_times, now_ms, window_ms);
        if status.flapping && !status.recovering && status.event_times.is_empty() {
            status.flapping = false;
            status.last_error = None;
            if status.phase == SlotPhase::Flapping {
                status.phase = if status.present { SlotPhase::Idle } else { SlotPhase::Absent };
            }
        }
    }

    pub fn phase(&self) -> SlotPhase {
        self.status.lock().phase
    }

    pub fn set_phase(&self, phase: SlotPhase) {
        self.status.lock().phase = phase;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.status.lock().last_error = Some(message.into());
    }

    pub fn devnode(&self) -> Option<String> {
        self.status.lock().devnode.clone()
    }

    pub fn is_flapping(&self) -> bool {
        self.status.lock().flapping
    }

    // -- Proxy handle ---------------------------------------------------------

    pub fn set_proxy(&self, handle: ProxyHandle) {
        *self.proxy.lock() = Some(handle);
    }

    pub fn take_proxy(&self) -> Option<ProxyHandle> {
        self.proxy.lock().take()
    }

    pub fn proxy_running(&self) -> bool {
        self.proxy.lock().as_ref().map(|p| !p.is_finished()).unwrap_or(false)
    }

    /// Devnode the running proxy was started with, if any.
    pub fn proxy_devnode(&self) -> Option<String> {
        self.proxy.lock().as_ref().map(|p| p.devnode.clone())
    }

    /// Subscribe to the running proxy's raw device-byte tap.
    pub fn proxy_tap(&self) -> Option<tokio::sync::broadcast::Receiver<bytes::Bytes>> {
        self.proxy.lock().as_ref().map(|p| p.subscribe())
    }

    /// Build a serialisable row for the devices listing.
    pub fn snapshot(&self, host: &str, now_ms: u64, window_ms: u64) -> SlotSnapshot {
        self.prune_events(now_ms, window_ms);
        let running = self.proxy_running();
        let status = self.status.lock();
        SlotSnapshot {
            label: self.config.label.clone(),
            slot_key: self.config.slot_key.clone(),
            tcp_port: self.config.tcp_port,
            present: status.present,
            running,
            devnode: status.devnode.clone(),
            state: status.phase,
            url: running.then(|| format!("rfc2217://{host}:{}", self.config.tcp_port)),
            seq: status.seq,
            last_action: status.last_action.clone(),
            last_event_ts: status.last_event_ms,
            last_error: status.last_error.clone(),
            flapping: status.flapping,
            recovering: status.recovering,
        }
    }
}

fn prune_window(times: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    let cutoff = now_ms.saturating_sub(window_ms);
    while times.front().is_some_and(|t| *t < cutoff) {
        times.pop_front();
    }
}

/// Serialisable slot row for `GET /api/devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub label: String,
    pub slot_key: String,
    pub tcp_port: u16,
    pub present: bool,
    pub running: bool,
    pub devnode: Option<String>,
    pub state: SlotPhase,
    pub url: Option<String>,
    pub seq: u64,
    pub last_action: Option<String>,
    pub last_event_ts: u64,
    pub last_error: Option<String>,
    pub flapping: bool,
    pub recovering: bool,
}

/// A device seen on a connector that is not in the slot map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub slot_key: String,
    pub devnode: Option<String>,
    pub present: bool,
    pub seq: u64,
    pub last_action: String,
    pub last_event_ts: u64,
}

/// Static connector table plus observations of unconfigured connectors.
pub struct SlotMap {
    slots: Vec<Arc<Slot>>,
    by_key: HashMap<String, usize>,
    by_label: HashMap<String, usize>,
    observations: Mutex<HashMap<String, Observation>>,
}

impl SlotMap {
    pub fn new(entries: &[SlotEntry]) -> Self {
        let slots: Vec<Arc<Slot>> = entries.iter().map(|e| Arc::new(Slot::new(e))).collect();
        let by_key = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.config.slot_key.clone(), i))
            .collect();
        let by_label = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.config.label.clone(), i))
            .collect();
        Self { slots, by_key, by_label, observations: Mutex::new(HashMap::new()) }
    }

    pub fn all(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn by_key(&self, slot_key: &str) -> Option<Arc<Slot>> {
        self.by_key.get(slot_key).map(|i| Arc::clone(&self.slots[*i]))
    }

    /// Resolve a client-supplied slot reference: label first, then key.
    pub fn resolve(&self, reference: &str) -> Option<Arc<Slot>> {
        self.by_label
            .get(reference)
            .or_else(|| self.by_key.get(reference))
            .map(|i| Arc::clone(&self.slots[*i]))
    }

    pub fn record_observation(
        &self,
        slot_key: &str,
        devnode: Option<&str>,
        action: &str,
        seq: u64,
        now_ms: u64,
    ) {
        let mut observations = self.observations.lock();
        let entry = observations.entry(slot_key.to_owned()).or_insert_with(|| Observation {
            slot_key: slot_key.to_owned(),
            devnode: None,
            present: false,
            seq: 0,
            last_action: String::new(),
            last_event_ts: 0,
        });
        entry.devnode = devnode.map(str::to_owned);
        entry.present = action == "add";
        entry.seq = seq;
        entry.last_action = action.to_owned();
        entry.last_event_ts = now_ms;
    }

    pub fn observations(&self) -> Vec<Observation> {
        let mut all: Vec<Observation> = self.observations.lock().values().cloned().collect();
        all.sort_by(|a, b| a.slot_key.cmp(&b.slot_key));
        all
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
#[path = "slot_tests.rs"]
mod tests;
