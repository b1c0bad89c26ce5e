// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::gpio::PinLevel;
use crate::hotplug::{ingest, HotplugAction};
use crate::slot::SlotPhase;
use crate::test_support::{free_tcp_port, CoordinatorBuilder};

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test]
fn bus_id_strips_interface_suffix() {
    assert_eq!(usb_bus_id("1-1.4:1.0"), "1-1.4");
    assert_eq!(usb_bus_id("1-1.4"), "1-1.4");
}

#[test]
fn usb_control_writes_driver_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("bus/usb/drivers/usb"))?;
    let usb = UsbControl::new(dir.path().to_path_buf());

    usb.unbind("1-1.4")?;
    usb.rebind("1-1.4")?;
    assert_eq!(
        std::fs::read_to_string(dir.path().join("bus/usb/drivers/usb/unbind"))?,
        "1-1.4"
    );
    assert_eq!(std::fs::read_to_string(dir.path().join("bus/usb/drivers/usb/bind"))?, "1-1.4");
    Ok(())
}

#[tokio::test]
async fn six_events_in_window_flip_flapping() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot("SLOT1", "usb-1.1", port)
        .flap(6, 30_000)
        .flap_cooldown(Duration::from_millis(300))
        .build()?;

    for i in 0..6 {
        let action = if i % 2 == 0 { HotplugAction::Add } else { HotplugAction::Remove };
        ingest(&bench.coord, action, "/nonexistent/ttyUSB0", "usb-1.1", "");
    }

    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    assert!(slot.is_flapping());
    let error = slot.status.lock().last_error.clone().unwrap_or_default();
    assert!(error.contains("flapping"));
    // Suppression keeps the proxy down while the flag is up.
    assert!(!slot.proxy_running());
    Ok(())
}

#[tokio::test]
async fn five_events_do_not_flip_flapping() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot("SLOT1", "usb-1.1", port)
        .flap(6, 30_000)
        .settle_timeout(Duration::from_millis(20))
        .build()?;

    for i in 0..5 {
        let action = if i % 2 == 0 { HotplugAction::Add } else { HotplugAction::Remove };
        ingest(&bench.coord, action, "/nonexistent/ttyUSB0", "usb-1.1", "");
    }
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    assert!(!slot.is_flapping());
    Ok(())
}

#[tokio::test]
async fn gpio_recovery_forces_download_mode() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot_with_gpio("SLOT1", "1-1.4:1.0", port, 5, 6)
        .flap_cooldown(Duration::from_millis(20))
        .build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    {
        let mut status = slot.status.lock();
        status.flapping = true;
        status.phase = SlotPhase::Flapping;
    }

    let outcome = recover(&bench.coord, &slot).await?;
    assert_eq!(outcome.outcome, "download_mode");

    // Boot-select held low, reset pulsed low then high.
    let calls = bench.gpio.calls.lock().clone();
    assert_eq!(
        calls,
        vec![(5, PinLevel::Low), (6, PinLevel::Low), (6, PinLevel::High)]
    );
    // Kernel-level unbind and rebind of the slot's bus id.
    let sysfs = bench.coord.settings.sysfs_root.clone();
    assert_eq!(
        std::fs::read_to_string(sysfs.join("bus/usb/drivers/usb/unbind"))?,
        "1-1.4"
    );
    assert_eq!(std::fs::read_to_string(sysfs.join("bus/usb/drivers/usb/bind"))?, "1-1.4");

    let status = slot.status.lock();
    assert!(!status.flapping);
    assert!(!status.recovering);
    assert!(status.event_times.is_empty());
    assert_eq!(status.last_error, None);
    Ok(())
}

#[tokio::test]
async fn no_gpio_recovery_succeeds_when_stable() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot("SLOT1", "1-1.7", port)
        .flap_cooldown(Duration::from_millis(20))
        .settle_timeout(Duration::from_millis(50))
        .build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    {
        let mut status = slot.status.lock();
        status.flapping = true;
        status.phase = SlotPhase::Flapping;
        status.present = true;
    }

    let outcome = recover(&bench.coord, &slot).await?;
    assert_eq!(outcome.outcome, "idle");
    assert_eq!(outcome.retries_used, 1);
    assert!(!slot.is_flapping());
    assert_eq!(slot.phase(), SlotPhase::Idle);
    Ok(())
}

#[tokio::test]
async fn suppression_recovers_automatically() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot("SLOT1", "usb-1.1", port)
        .flap(4, 30_000)
        .flap_cooldown(Duration::from_millis(20))
        .settle_timeout(Duration::from_millis(50))
        .build()?;

    for i in 0..4 {
        let action = if i % 2 == 0 { HotplugAction::Add } else { HotplugAction::Remove };
        ingest(&bench.coord, action, "/nonexistent/ttyUSB0", "usb-1.1", "");
    }

    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    assert!(slot.is_flapping());
    // The no-GPIO recovery worker clears the flag once the slot is quiet.
    assert!(wait_for(|| !slot.is_flapping()).await, "recovery never cleared the flap flag");
    Ok(())
}

#[tokio::test]
async fn release_requires_gpio() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new().slot("SLOT1", "usb-1.1", port).build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;

    let result = release(&bench.coord, &slot).await;
    assert!(matches!(result, Err(e) if e.code == ErrorCode::Unavailable));
    Ok(())
}

#[tokio::test]
async fn release_frees_boot_line_and_pulses_reset() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new()
        .slot_with_gpio("SLOT1", "1-1.4", port, 5, 6)
        .build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;

    release(&bench.coord, &slot).await?;
    let calls = bench.gpio.calls.lock().clone();
    assert_eq!(
        calls,
        vec![(5, PinLevel::HighZ), (6, PinLevel::Low), (6, PinLevel::High)]
    );
    Ok(())
}
