// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::io::Write;

use tokio::net::TcpStream;

use crate::error::ErrorCode;
use crate::test_support::{fake_pty, free_tcp_port, CoordinatorBuilder, FakePty, TestBench};

async fn bench_with_running_slot() -> anyhow::Result<(TestBench, Arc<Slot>, FakePty)> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new().slot("SLOT1", "usb-1.1", port).build()?;
    let pty = fake_pty()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;
    manual_start(&bench.coord, &slot, Some(&pty.path.display().to_string())).await?;
    Ok((bench, slot, pty))
}

#[tokio::test]
async fn monitor_without_proxy_conflicts() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new().slot("SLOT1", "usb-1.1", port).build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;

    let result = monitor(&bench.coord, &slot, None, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::Conflict));
    assert!(matches!(result, Err(ref e) if e.message == "proxy_not_running"));
    Ok(())
}

#[tokio::test]
async fn monitor_rejects_invalid_pattern() -> anyhow::Result<()> {
    let (bench, slot, _pty) = bench_with_running_slot().await?;
    let result = monitor(&bench.coord, &slot, Some("[unclosed"), Duration::from_secs(1)).await;
    assert!(matches!(result, Err(e) if e.code == ErrorCode::BadRequest));
    Ok(())
}

#[tokio::test]
async fn monitor_matches_pattern_and_returns_early() -> anyhow::Result<()> {
    let (bench, slot, mut pty) = bench_with_running_slot().await?;

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = pty.master.write_all(b"initializing\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = pty.master.write_all(b"system ready\n");
        pty
    });

    let outcome =
        monitor(&bench.coord, &slot, Some("ready"), Duration::from_secs(5)).await?;
    assert!(outcome.matched);
    assert_eq!(outcome.line.as_deref(), Some("system ready"));
    assert_eq!(outcome.output, vec!["initializing".to_owned(), "system ready".to_owned()]);
    assert_eq!(slot.phase(), SlotPhase::Idle);

    let _ = writer.await;
    Ok(())
}

#[tokio::test]
async fn monitor_times_out_without_match() -> anyhow::Result<()> {
    let (bench, slot, mut pty) = bench_with_running_slot().await?;
    pty.master.write_all(b"nothing interesting\n")?;

    let start = std::time::Instant::now();
    let outcome =
        monitor(&bench.coord, &slot, Some("never-appears"), Duration::from_millis(300)).await?;
    assert!(!outcome.matched);
    assert_eq!(outcome.line, None);
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert_eq!(outcome.output, vec!["nothing interesting".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn monitor_without_pattern_collects_for_full_window() -> anyhow::Result<()> {
    let (bench, slot, mut pty) = bench_with_running_slot().await?;
    pty.master.write_all(b"line one\nline two\n")?;

    let outcome = monitor(&bench.coord, &slot, None, Duration::from_millis(300)).await?;
    assert!(!outcome.matched);
    assert_eq!(outcome.output, vec!["line one".to_owned(), "line two".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn reset_on_absent_slot_conflicts() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new().slot("SLOT1", "usb-1.1", port).build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;

    let result = reset(&bench.coord, &slot).await;
    assert!(matches!(result, Err(e) if e.code == ErrorCode::Conflict));
    Ok(())
}

#[tokio::test]
async fn reset_collects_boot_lines_and_restarts_proxy() -> anyhow::Result<()> {
    let (bench, slot, mut pty) = bench_with_running_slot().await?;

    let writer = tokio::spawn(async move {
        // The firmware chatters shortly after the pulse.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let _ = pty.master.write_all(b"rst: power on\nboot complete\n");
        pty
    });

    let lines = reset(&bench.coord, &slot).await?;
    assert_eq!(lines, vec!["rst: power on".to_owned(), "boot complete".to_owned()]);
    assert_eq!(slot.phase(), SlotPhase::Idle);
    assert!(slot.proxy_running());

    let _ = writer.await;
    Ok(())
}

#[tokio::test]
async fn manual_start_is_idempotent() -> anyhow::Result<()> {
    let (bench, slot, pty) = bench_with_running_slot().await?;
    let devnode = pty.path.display().to_string();

    // Same devnode again: no-op success.
    manual_start(&bench.coord, &slot, Some(&devnode)).await?;
    assert!(slot.proxy_running());

    // Without an override it reuses the recorded devnode.
    manual_start(&bench.coord, &slot, None).await?;
    assert!(slot.proxy_running());
    Ok(())
}

#[tokio::test]
async fn manual_stop_is_idempotent() -> anyhow::Result<()> {
    let (bench, slot, _pty) = bench_with_running_slot().await?;
    manual_stop(&bench.coord, &slot).await?;
    assert!(!slot.proxy_running());
    // Stopping again (and stopping an absent slot) is a no-op.
    manual_stop(&bench.coord, &slot).await?;
    Ok(())
}

#[tokio::test]
async fn manual_start_without_devnode_conflicts() -> anyhow::Result<()> {
    let port = free_tcp_port()?;
    let bench = CoordinatorBuilder::new().slot("SLOT1", "usb-1.1", port).build()?;
    let slot = bench.coord.slots.resolve("SLOT1").ok_or_else(|| anyhow::anyhow!("no slot"))?;

    let result = manual_start(&bench.coord, &slot, None).await;
    assert!(matches!(result, Err(e) if e.code == ErrorCode::Conflict));
    Ok(())
}

#[tokio::test]
async fn flashing_client_blocks_reset_start_and_stop() -> anyhow::Result<()> {
    let (bench, slot, _pty) = bench_with_running_slot().await?;
    let devnode = slot.devnode().ok_or_else(|| anyhow::anyhow!("no devnode"))?;

    // An external flash tool connects to the proxy; the slot enters
    // Flashing until that client disconnects.
    let client = TcpStream::connect(("127.0.0.1", slot.config.tcp_port)).await?;
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while slot.phase() != SlotPhase::Flashing {
        anyhow::ensure!(std::time::Instant::now() < deadline, "client never observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = reset(&bench.coord, &slot).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::DeviceBusy));
    let result = manual_start(&bench.coord, &slot, Some(&devnode)).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::DeviceBusy));
    let result = manual_stop(&bench.coord, &slot).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::DeviceBusy));
    // The flashing client was never disconnected.
    assert!(slot.proxy_running());
    assert_eq!(slot.phase(), SlotPhase::Flashing);

    // Client disconnect is the only exit gate; afterwards the overrides
    // work again.
    drop(client);
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while slot.phase() != SlotPhase::Idle {
        anyhow::ensure!(std::time::Instant::now() < deadline, "phase never cleared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manual_stop(&bench.coord, &slot).await?;
    assert!(!slot.proxy_running());
    Ok(())
}

#[tokio::test]
async fn operations_on_one_slot_are_serialised() -> anyhow::Result<()> {
    let (bench, slot, mut pty) = bench_with_running_slot().await?;

    // A monitor holds the slot lock; a concurrent reset must wait for it
    // rather than interleave.
    let monitor_task = {
        let coord = Arc::clone(&bench.coord);
        let slot = Arc::clone(&slot);
        tokio::spawn(async move {
            monitor(&coord, &slot, Some("never"), Duration::from_millis(300)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(slot.phase(), SlotPhase::Monitoring);

    let reset_task = {
        let coord = Arc::clone(&bench.coord);
        let slot = Arc::clone(&slot);
        tokio::spawn(async move { reset(&coord, &slot).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Reset is parked on the work lock while the monitor runs.
    assert_eq!(slot.phase(), SlotPhase::Monitoring);

    let monitor_result = monitor_task.await.map_err(|e| anyhow::anyhow!("join: {e}"))?;
    assert!(monitor_result.is_ok());

    // Feed the reset's boot read so it exits on the quiet gap, not the
    // full window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    pty.master.write_all(b"boot\n")?;

    let reset_result = reset_task.await.map_err(|e| anyhow::anyhow!("join: {e}"))?;
    assert!(reset_result.is_ok());
    assert_eq!(slot.phase(), SlotPhase::Idle);
    Ok(())
}
