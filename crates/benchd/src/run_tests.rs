// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;
use serial_test::serial;
use std::io::Write;

fn test_config(dir: &tempfile::TempDir, port: u16, udp_port: u16) -> anyhow::Result<Config> {
    let slot_map = dir.path().join("slots.json");
    let mut file = std::fs::File::create(&slot_map)?;
    write!(
        file,
        r#"{{"slots":[{{"label":"SLOT1","slot_key":"usb-1.1","tcp_port":4101}}]}}"#
    )?;
    let dev_root = dir.path().join("dev");
    std::fs::create_dir_all(&dev_root)?;
    let sysfs = dir.path().join("sys");
    std::fs::create_dir_all(sysfs.join("class/tty"))?;

    let config = Config::try_parse_from([
        "benchd",
        "--host",
        "127.0.0.1",
        "--port",
        &port.to_string(),
        "--udp-log-port",
        &udp_port.to_string(),
        "--slot-map",
        &slot_map.display().to_string(),
        "--dev-root",
        &dev_root.display().to_string(),
        "--sysfs-root",
        &sysfs.display().to_string(),
        "--firmware-dir",
        &dir.path().join("firmware").display().to_string(),
        "--run-dir",
        &dir.path().join("run").display().to_string(),
    ])?;
    Ok(config)
}

fn free_udp_port() -> anyhow::Result<u16> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

#[tokio::test]
#[serial]
async fn prepare_builds_a_working_daemon() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = crate::test_support::free_tcp_port()?;
    let udp_port = free_udp_port()?;
    let config = test_config(&dir, port, udp_port)?;
    config.validate()?;

    let prepared = prepare(config).await?;
    assert_eq!(prepared.coord.slots.len(), 1);
    assert_eq!(prepared.local_addr()?.port(), port);

    // The activity log already carries the startup entry.
    assert!(!prepared.coord.activity.is_empty());

    prepared.coord.drain().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn prepare_fails_without_slot_map() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = crate::test_support::free_tcp_port()?;
    let udp_port = free_udp_port()?;
    let mut config = test_config(&dir, port, udp_port)?;
    config.slot_map = dir.path().join("missing.json");

    assert!(prepare(config).await.is_err());
    Ok(())
}
