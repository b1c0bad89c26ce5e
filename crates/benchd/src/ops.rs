// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot-level serial operations: DTR/RTS reset, read-through monitor, and
//! the manual proxy start/stop overrides. All of them serialise on the
//! slot work lock, so they can never interleave with hotplug workers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::activity::ActivityLevel;
use crate::coordinator::Coordinator;
use crate::error::ApiError;
use crate::hotplug::{start_proxy, stop_proxy};
use crate::proxy::settle_delay;
use crate::serial::{LineBuffer, SerialDevice};
use crate::slot::{DeviceFamily, Slot, SlotPhase};

/// DTR/RTS assertion length during a reset pulse.
const RESET_PULSE: Duration = Duration::from_millis(50);

/// Total read window after the pulse.
const RESET_READ_WINDOW: Duration = Duration::from_secs(5);

/// Early-exit quiet gap once at least one line has arrived.
const RESET_QUIET_GAP: Duration = Duration::from_secs(1);

/// Default monitor window.
pub const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorOutcome {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    pub output: Vec<String>,
}

/// Stop the proxy, pulse DTR+RTS, collect boot output, restart the proxy.
///
/// Refused while a flashing client holds the proxy: only the client's own
/// disconnect may end that state.
pub async fn reset(coord: &Arc<Coordinator>, slot: &Arc<Slot>) -> Result<Vec<String>, ApiError> {
    let _work = slot.work.lock().await;
    let devnode = {
        let status = slot.status.lock();
        if status.phase == SlotPhase::Flashing {
            return Err(ApiError::device_busy("proxy in use by a flashing client"));
        }
        if !status.present {
            return Err(ApiError::conflict("device not present"));
        }
        status.devnode.clone().ok_or_else(|| ApiError::conflict("device not present"))?
    };

    slot.set_phase(SlotPhase::Resetting);
    coord.log(ActivityLevel::Step, "serial", format!("{}: reset", slot.config.label));
    stop_proxy(slot).await;

    let result = pulse_and_read(&devnode).await;

    let family = DeviceFamily::classify(&devnode);
    tokio::time::sleep(settle_delay(family, coord.settings.post_add_delay)).await;

    // Restart the proxy whether or not the read succeeded; the slot goes
    // back to idle either way.
    let restart = start_proxy(coord, slot, &devnode).await;
    slot.set_phase(SlotPhase::Idle);
    if let Err(e) = restart {
        slot.set_error(format!("proxy restart: {e:#}"));
        coord.log(
            ActivityLevel::Error,
            "serial",
            format!("{}: proxy restart failed: {e:#}", slot.config.label),
        );
    }

    match result {
        Ok(lines) => {
            coord.log(
                ActivityLevel::Ok,
                "serial",
                format!("{}: reset captured {} lines", slot.config.label, lines.len()),
            );
            Ok(lines)
        }
        Err(e) => {
            slot.set_error(e.message.clone());
            Err(e)
        }
    }
}

/// Open the device directly with both lines released, pulse them, and read
/// whatever the firmware prints while booting.
async fn pulse_and_read(devnode: &str) -> Result<Vec<String>, ApiError> {
    let family = DeviceFamily::classify(devnode);
    let device = SerialDevice::open(Path::new(devnode), family)
        .map_err(|e| ApiError::internal(format!("open {devnode}: {e}")))?;

    modem(&device, false, false)?;
    modem(&device, true, true)?;
    tokio::time::sleep(RESET_PULSE).await;
    modem(&device, false, false)?;

    let mut lines = Vec::new();
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; 1024];
    let deadline = tokio::time::Instant::now() + RESET_READ_WINDOW;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let window = if lines.is_empty() { deadline - now } else { RESET_QUIET_GAP.min(deadline - now) };
        match tokio::time::timeout(window, device.read_chunk(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => lines.extend(buffer.push(&chunk[..n])),
            Ok(Err(e)) => {
                debug!("reset read ended: {e}");
                break;
            }
            Err(_elapsed) => break,
        }
    }
    if let Some(partial) = buffer.take_partial() {
        lines.push(partial);
    }
    Ok(lines)
}

/// Drive DTR+RTS together. ENOTTY is tolerated: some CDC gadgets expose no
/// modem lines at all, and the reset is then just a reopen.
fn modem(device: &SerialDevice, dtr: bool, rts: bool) -> Result<(), ApiError> {
    match device.set_modem(dtr, rts) {
        Ok(()) => Ok(()),
        Err(e)
            if e.raw_os_error() == Some(nix::libc::ENOTTY)
                || e.raw_os_error() == Some(nix::libc::EINVAL) =>
        {
            Ok(())
        }
        Err(e) => Err(ApiError::internal(format!("modem lines: {e}"))),
    }
}

/// Read device output through the running proxy's tap, optionally until a
/// pattern matches.
pub async fn monitor(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
    pattern: Option<&str>,
    timeout: Duration,
) -> Result<MonitorOutcome, ApiError> {
    let regex = match pattern {
        Some(raw) => Some(
            regex::Regex::new(raw)
                .map_err(|e| ApiError::bad_request(format!("invalid pattern: {e}")))?,
        ),
        None => None,
    };

    let _work = slot.work.lock().await;
    if slot.phase() == SlotPhase::Monitoring {
        return Err(ApiError::conflict("monitor already running"));
    }
    let mut tap = slot
        .proxy_tap()
        .filter(|_| slot.proxy_running())
        .ok_or_else(|| ApiError::conflict("proxy_not_running"))?;

    slot.set_phase(SlotPhase::Monitoring);
    coord.log(ActivityLevel::Step, "serial", format!("{}: monitor", slot.config.label));

    let mut outcome = MonitorOutcome { matched: false, line: None, output: Vec::new() };
    let mut buffer = LineBuffer::new();
    let deadline = tokio::time::Instant::now() + timeout;

    'outer: loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match tokio::time::timeout(deadline - now, tap.recv()).await {
            Ok(Ok(chunk)) => {
                for line in buffer.push(&chunk) {
                    let hit = regex.as_ref().is_some_and(|r| r.is_match(&line));
                    outcome.output.push(line.clone());
                    if hit {
                        outcome.matched = true;
                        outcome.line = Some(line);
                        break 'outer;
                    }
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                debug!(skipped, "monitor tap lagged");
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_elapsed) => break,
        }
    }

    slot.set_phase(SlotPhase::Idle);
    Ok(outcome)
}

/// Manual proxy start override. Idempotent: starting an already-running
/// slot with the same devnode is a no-op. Refused while a flashing client
/// holds the proxy.
pub async fn manual_start(
    coord: &Arc<Coordinator>,
    slot: &Arc<Slot>,
    devnode_override: Option<&str>,
) -> Result<(), ApiError> {
    let _work = slot.work.lock().await;
    if slot.phase() == SlotPhase::Flashing {
        return Err(ApiError::device_busy("proxy in use by a flashing client"));
    }
    if slot.is_flapping() {
        return Err(ApiError::conflict("slot is flapping"));
    }
    let devnode = match devnode_override {
        Some(devnode) => devnode.to_owned(),
        None => slot
            .devnode()
            .ok_or_else(|| ApiError::conflict("no device node known for slot"))?,
    };

    if slot.proxy_running() && slot.proxy_devnode().as_deref() == Some(devnode.as_str()) {
        return Ok(());
    }
    stop_proxy(slot).await;
    start_proxy(coord, slot, &devnode)
        .await
        .map_err(|e| ApiError::internal(format!("{e:#}")))?;
    {
        let mut status = slot.status.lock();
        status.present = true;
        status.devnode = Some(devnode);
        status.phase = SlotPhase::Idle;
    }
    coord.log(ActivityLevel::Ok, "serial", format!("{}: proxy started", slot.config.label));
    Ok(())
}

/// Manual proxy stop override. A no-op on an absent or stopped slot.
/// Refused while a flashing client holds the proxy.
pub async fn manual_stop(coord: &Arc<Coordinator>, slot: &Arc<Slot>) -> Result<(), ApiError> {
    let _work = slot.work.lock().await;
    if slot.phase() == SlotPhase::Flashing {
        return Err(ApiError::device_busy("proxy in use by a flashing client"));
    }
    if slot.proxy_running() {
        coord.log(ActivityLevel::Ok, "serial", format!("{}: proxy stopped", slot.config.label));
    }
    stop_proxy(slot).await;
    Ok(())
}

#[cfg(test)]
#[path = "ops_tests.rs"]
mod tests;
