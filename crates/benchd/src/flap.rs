// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flap suppression and recovery.
//!
//! Detection lives on the hotplug fast path; this module quiesces the
//! slot and, where the bench has boot/reset wiring, forces the device
//! into download mode so a flash tool can replace the crashing firmware.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activity::ActivityLevel;
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::gpio::PinLevel;
use crate::hotplug::{start_proxy, stop_proxy};
use crate::slot::{Slot, SlotPhase};

/// How long the reset line is held low during a pulse.
const RESET_PULSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverOutcome {
    /// `download_mode` (GPIO path) or `idle` (no-GPIO path).
    pub outcome: String,
    pub retries_used: u32,
}

/// Kernel-level USB unbind/rebind through sysfs.
#[derive(Debug, Clone)]
pub struct UsbControl {
    root: PathBuf,
}

impl UsbControl {
    pub fn new(sysfs_root: PathBuf) -> Self {
        Self { root: sysfs_root }
    }

    fn driver_file(&self, name: &str) -> PathBuf {
        self.root.join("bus/usb/drivers/usb").join(name)
    }

    pub fn unbind(&self, bus_id: &str) -> std::io::Result<()> {
        std::fs::write(self.driver_file("unbind"), bus_id)
    }

    pub fn rebind(&self, bus_id: &str) -> std::io::Result<()> {
        std::fs::write(self.driver_file("bind"), bus_id)
    }
}

/// The USB bus id for sysfs driver files: the slot key up to any
/// interface suffix (`1-1.4:1.0` → `1-1.4`).
pub fn usb_bus_id(slot_key: &str) -> &str {
    slot_key.split(':').next().unwrap_or(slot_key)
}

/// Worker entry from the flap detector: stop the proxy, then attempt
/// recovery automatically.
pub async fn suppress_and_recover(coord: &Arc<Coordinator>, slot: &Arc<Slot>) {
    let _work = slot.work.lock().await;
    slot.set_phase(SlotPhase::Flapping);
    stop_proxy(slot).await;
    let _ = recover_locked(coord, slot).await;
}

/// Manual recovery entry (`POST /api/serial/recover`): resets the retry
/// counter and re-runs the sequence.
pub async fn recover(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
) -> Result<RecoverOutcome, ApiError> {
    let _work = slot.work.lock().await;
    {
        let mut status = slot.status.lock();
        status.retries = 0;
        status.flapping = true;
        status.phase = SlotPhase::Flapping;
    }
    stop_proxy(slot).await;
    recover_locked(coord, slot).await
}

/// Recovery with the slot work lock held.
async fn recover_locked(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
) -> Result<RecoverOutcome, ApiError> {
    slot.status.lock().recovering = true;
    let result = if slot.config.has_gpio() {
        recover_with_gpio(coord, slot).await
    } else {
        recover_without_gpio(coord, slot).await
    };
    slot.status.lock().recovering = false;
    result
}

/// GPIO path: unbind, cool down, hold boot-select low, pulse reset, and
/// rebind. The device re-enumerates in download mode, a stable state that
/// waits for a flash tool.
async fn recover_with_gpio(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
) -> Result<RecoverOutcome, ApiError> {
    let bus_id = usb_bus_id(&slot.config.slot_key).to_owned();
    let (boot_pin, reset_pin) = match (slot.config.boot_pin, slot.config.reset_pin) {
        (Some(b), Some(r)) => (b, r),
        _ => return Err(ApiError::unavailable("slot has no gpio control")),
    };

    coord.log(
        ActivityLevel::Step,
        "recover",
        format!("{}: forcing download mode", slot.config.label),
    );
    if let Err(e) = coord.usb.unbind(&bus_id) {
        debug!("unbind {bus_id}: {e}");
    }
    tokio::time::sleep(coord.settings.flap_cooldown).await;

    if let Err(e) = coord.gpio.force(boot_pin, PinLevel::Low) {
        slot.set_error(format!("boot-select drive failed: {e:#}"));
        return Err(ApiError::internal(format!("gpio: {e:#}")));
    }
    pulse_reset(coord, reset_pin).await?;

    if let Err(e) = coord.usb.rebind(&bus_id) {
        slot.set_error(format!("rebind failed: {e}"));
        return Err(ApiError::internal(format!("rebind {bus_id}: {e}")));
    }

    {
        let mut status = slot.status.lock();
        status.flapping = false;
        status.event_times.clear();
        status.retries = 0;
        status.last_error = None;
        status.phase = if status.present { SlotPhase::Idle } else { SlotPhase::Absent };
    }
    coord.log(
        ActivityLevel::Ok,
        "recover",
        format!("{}: in download mode, awaiting flash", slot.config.label),
    );
    Ok(RecoverOutcome { outcome: "download_mode".to_owned(), retries_used: 0 })
}

/// No-GPIO path: bounded rebind attempts, then give up loudly.
async fn recover_without_gpio(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
) -> Result<RecoverOutcome, ApiError> {
    let bus_id = usb_bus_id(&slot.config.slot_key).to_owned();
    let max_retries = coord.settings.flap_max_retries;

    loop {
        let attempt = {
            let mut status = slot.status.lock();
            status.retries += 1;
            status.retries
        };
        if attempt > max_retries {
            break;
        }
        coord.log(
            ActivityLevel::Step,
            "recover",
            format!("{}: rebind attempt {attempt}/{max_retries}", slot.config.label),
        );
        if let Err(e) = coord.usb.unbind(&bus_id) {
            debug!("unbind {bus_id}: {e}");
        }
        tokio::time::sleep(coord.settings.flap_cooldown).await;
        if let Err(e) = coord.usb.rebind(&bus_id) {
            debug!("rebind {bus_id}: {e}");
        }

        if wait_stable(slot, coord.settings.settle_timeout).await {
            let mut status = slot.status.lock();
            status.flapping = false;
            status.event_times.clear();
            status.retries = 0;
            status.last_error = None;
            status.phase = if status.present { SlotPhase::Idle } else { SlotPhase::Absent };
            drop(status);
            info!(slot = %slot.config.label, "flap recovery succeeded");
            coord.log(
                ActivityLevel::Ok,
                "recover",
                format!("{}: stable after rebind", slot.config.label),
            );
            return Ok(RecoverOutcome { outcome: "idle".to_owned(), retries_used: attempt });
        }
    }

    slot.set_error("flapping, needs manual intervention".to_owned());
    coord.log(
        ActivityLevel::Error,
        "recover",
        format!("{}: still flapping, needs manual intervention", slot.config.label),
    );
    Err(ApiError::internal("needs manual intervention"))
}

/// A slot is stable when no hotplug events land during the window.
async fn wait_stable(slot: &Arc<Slot>, window: Duration) -> bool {
    let before = slot.status.lock().event_times.len();
    tokio::time::sleep(window).await;
    slot.status.lock().event_times.len() == before
}

async fn pulse_reset(coord: &Arc<Coordinator>, reset_pin: u32) -> Result<(), ApiError> {
    coord
        .gpio
        .force(reset_pin, PinLevel::Low)
        .map_err(|e| ApiError::internal(format!("reset drive: {e:#}")))?;
    tokio::time::sleep(RESET_PULSE).await;
    coord
        .gpio
        .force(reset_pin, PinLevel::High)
        .map_err(|e| ApiError::internal(format!("reset release: {e:#}")))?;
    Ok(())
}

/// Exit download mode (`POST /api/serial/release`): release the BOOT line,
/// pulse reset so the firmware boots, and restart the proxy.
pub async fn release(coord: &Arc<Coordinator>, slot: &Arc<Slot>) -> Result<(), ApiError> {
    let _work = slot.work.lock().await;
    let (boot_pin, reset_pin) = match (slot.config.boot_pin, slot.config.reset_pin) {
        (Some(b), Some(r)) => (b, r),
        _ => return Err(ApiError::unavailable("slot has no gpio control")),
    };

    coord
        .gpio
        .force(boot_pin, PinLevel::HighZ)
        .map_err(|e| ApiError::internal(format!("boot release: {e:#}")))?;
    pulse_reset(coord, reset_pin).await?;

    let devnode = slot.devnode();
    if let Some(ref devnode) = devnode {
        if !slot.proxy_running() {
            start_proxy(coord, slot, devnode)
                .await
                .map_err(|e| ApiError::internal(format!("{e:#}")))?;
            slot.set_phase(SlotPhase::Idle);
        }
    }
    coord.log(
        ActivityLevel::Ok,
        "recover",
        format!("{}: boot line released", slot.config.label),
    );
    Ok(())
}

#[cfg(test)]
#[path = "flap_tests.rs"]
mod tests;
