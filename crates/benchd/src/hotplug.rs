// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hotplug reconciler: OS add/remove callbacks drive each slot's state
//! machine.
//!
//! The ingest path is synchronous and cheap (sequence stamp, event-window
//! bookkeeping, flap check); everything slow runs on a tracked background
//! worker so the callback never blocks while the kernel is enumerating a
//! replacement device.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::activity::ActivityLevel;
use crate::coordinator::Coordinator;
use crate::flap;
use crate::proxy;
use crate::serial::wait_for_device;
use crate::slot::{DeviceFamily, Slot, SlotPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

impl HotplugAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Stable connector key: hardware path when the OS delivered one, device
/// path otherwise.
pub fn derive_slot_key(id_path: &str, devpath: &str, devnode: &str) -> String {
    if !id_path.is_empty() {
        return id_path.to_owned();
    }
    if !devpath.is_empty() {
        return devpath.to_owned();
    }
    devnode.to_owned()
}

/// One queued unit of slow slot work.
#[derive(Debug)]
pub struct SlotJob {
    pub action: HotplugAction,
    pub devnode: String,
}

/// Synchronous hotplug ingest. Returns immediately; slow work is queued on
/// the slot's ordered worker so a remove→add burst is applied in arrival
/// order.
pub fn ingest(
    coord: &Arc<Coordinator>,
    action: HotplugAction,
    devnode: &str,
    id_path: &str,
    devpath: &str,
) {
    let slot_key = derive_slot_key(id_path, devpath, devnode);
    let seq = coord.clock.next_seq();
    let now = coord.clock.now_ms();

    let Some(slot) = coord.slots.by_key(&slot_key) else {
        coord.slots.record_observation(&slot_key, Some(devnode), action.as_str(), seq, now);
        coord.log(
            ActivityLevel::Info,
            "hotplug",
            format!("{} on unknown connector {slot_key} ({devnode})", action.as_str()),
        );
        return;
    };

    let window = coord.settings.flap_window_ms;
    let events_in_window = slot.record_event(action.as_str(), seq, now, window);
    debug!(
        slot = %slot.config.label,
        seq,
        action = action.as_str(),
        events_in_window,
        "hotplug event"
    );

    // Flap detection on the fast path; suppression happens on a worker.
    if events_in_window >= coord.settings.flap_threshold && !slot.is_flapping() {
        {
            let mut status = slot.status.lock();
            status.flapping = true;
            status.last_error = Some("usb flapping detected".to_owned());
        }
        coord.log(
            ActivityLevel::Error,
            "hotplug",
            format!(
                "{}: {events_in_window} events in window, suppressing",
                slot.config.label
            ),
        );
        let coord_for_worker = Arc::clone(coord);
        let slot_for_worker = Arc::clone(&slot);
        coord.tracker.spawn(async move {
            flap::suppress_and_recover(&coord_for_worker, &slot_for_worker).await;
        });
        return;
    }

    enqueue(coord, &slot, SlotJob { action, devnode: devnode.to_owned() });
}

/// Queue a job on the slot's worker, spawning the worker on first use.
fn enqueue(coord: &Arc<Coordinator>, slot: &Arc<Slot>, job: SlotJob) {
    let sender = {
        let mut jobs = slot.jobs.lock();
        match jobs.as_ref().filter(|sender| !sender.is_closed()) {
            Some(sender) => sender.clone(),
            None => {
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                *jobs = Some(tx.clone());
                let coord = Arc::clone(coord);
                let slot = Arc::clone(slot);
                tokio::spawn(slot_worker(coord, slot, rx));
                tx
            }
        }
    };
    let _ = sender.send(job);
}

/// Long-lived per-slot worker: drains the job queue in order, holding the
/// slot work lock per job. Exits on daemon shutdown.
async fn slot_worker(
    coord: Arc<Coordinator>,
    slot: Arc<Slot>,
    mut jobs: tokio::sync::mpsc::UnboundedReceiver<SlotJob>,
) {
    loop {
        tokio::select! {
            _ = coord.shutdown.cancelled() => break,
            job = jobs.recv() => {
                let Some(job) = job else {
                    break;
                };
                let _work = slot.work.lock().await;
                match job.action {
                    HotplugAction::Add => apply_add(&coord, &slot, &job.devnode).await,
                    HotplugAction::Remove => apply_remove(&coord, &slot).await,
                }
            }
        }
    }
}

async fn apply_add(coord: &Arc<Coordinator>, slot: &Arc<Slot>, devnode: &str) {
    let family = DeviceFamily::classify(devnode);
    if !wait_for_device(Path::new(devnode), family, coord.settings.settle_timeout).await {
        slot.set_error(format!("{devnode} did not settle"));
        coord.log(
            ActivityLevel::Error,
            "hotplug",
            format!("{}: {devnode} did not settle", slot.config.label),
        );
        return;
    }

    {
        let mut status = slot.status.lock();
        status.present = true;
        status.devnode = Some(devnode.to_owned());
    }

    if slot.is_flapping() {
        debug!(slot = %slot.config.label, "flap suppression active, not starting proxy");
        return;
    }

    // Duplicate add with an unchanged devnode and a healthy proxy: no-op.
    // A changed devnode (or a dead proxy task) means stop and restart.
    if slot.proxy_running() && slot.proxy_devnode().as_deref() == Some(devnode) {
        debug!(slot = %slot.config.label, "duplicate add, proxy already up");
        return;
    }
    stop_proxy(slot).await;

    if family == DeviceFamily::NativeUsb {
        // Give the chip its boot window before the proxy opens the node.
        tokio::time::sleep(coord.settings.post_add_delay).await;
    }

    match start_proxy(coord, slot, devnode).await {
        Ok(()) => {
            slot.set_phase(SlotPhase::Idle);
            coord.log(
                ActivityLevel::Ok,
                "hotplug",
                format!(
                    "{}: {devnode} up on port {}",
                    slot.config.label, slot.config.tcp_port
                ),
            );
        }
        Err(e) => {
            slot.set_error(format!("{e:#}"));
            coord.log(
                ActivityLevel::Error,
                "hotplug",
                format!("{}: proxy start failed: {e:#}", slot.config.label),
            );
        }
    }
}

async fn apply_remove(coord: &Arc<Coordinator>, slot: &Arc<Slot>) {
    {
        let mut status = slot.status.lock();
        status.present = false;
        status.devnode = None;
        if !status.flapping {
            status.phase = SlotPhase::Absent;
        }
    }
    stop_proxy(slot).await;
    coord.log(
        ActivityLevel::Info,
        "hotplug",
        format!("{}: device removed", slot.config.label),
    );
}

/// Start the slot's proxy. Callers must hold the slot work lock.
pub async fn start_proxy(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
    devnode: &str,
) -> anyhow::Result<()> {
    let handle = proxy::start(devnode, slot.config.tcp_port, Arc::clone(&slot.status))
        .await
        .with_context(|| format!("slot {}", slot.config.label))?;
    slot.set_proxy(handle);
    Ok(())
}

/// Stop the slot's proxy if one is running. Callers must hold the slot
/// work lock.
pub async fn stop_proxy(slot: &Arc<Slot>) {
    if let Some(proxy) = slot.take_proxy() {
        proxy.stop().await;
    }
}

/// Enumerate already-plugged serial devices and synthesise add events.
pub async fn boot_scan(coord: &Arc<Coordinator>) {
    let dev_root = coord.settings.dev_root.clone();
    let mut entries = match tokio::fs::read_dir(&dev_root).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("boot scan: cannot read {}: {e}", dev_root.display());
            return;
        }
    };
    let mut found = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("ttyACM") && !name.starts_with("ttyUSB") {
            continue;
        }
        let devnode = entry.path().display().to_string();
        let hw_path = sysfs_hardware_path(&coord.settings.sysfs_root, &name).unwrap_or_default();
        ingest(coord, HotplugAction::Add, &devnode, &hw_path, "");
        found += 1;
    }
    info!("boot scan: {found} serial devices");
}

/// Derive the hardware path for a tty from its sysfs `device` symlink,
/// e.g. `.../1-1.4:1.0` → `1-1.4`.
fn sysfs_hardware_path(sysfs_root: &Path, tty_name: &str) -> Option<String> {
    let link = sysfs_root.join("class/tty").join(tty_name).join("device");
    let target = std::fs::read_link(&link).ok()?;
    let leaf = target.file_name()?.to_str()?;
    let bus_id = leaf.split(':').next()?;
    if bus_id.is_empty() {
        return None;
    }
    Some(bus_id.to_owned())
}

#[cfg(test)]
#[path = "hotplug_tests.rs"]
mod tests;
