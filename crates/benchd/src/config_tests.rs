// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;
use std::io::Write;

fn base_args() -> Vec<&'static str> {
    vec!["benchd"]
}

#[test]
fn defaults_parse_and_validate() -> anyhow::Result<()> {
    let config = Config::try_parse_from(base_args())?;
    config.validate()?;
    assert_eq!(config.port, 8080);
    assert_eq!(config.udp_log_port, 5555);
    assert_eq!(config.flap_threshold, 6);
    assert_eq!(config.flap_window, 30);
    assert_eq!(config.ap_ip, std::net::Ipv4Addr::new(192, 168, 4, 1));
    Ok(())
}

#[test]
fn rejects_zero_port() -> anyhow::Result<()> {
    let config = Config::try_parse_from(["benchd", "--port", "0"])?;
    assert!(config.validate().is_err());
    Ok(())
}

#[test]
fn rejects_bad_log_format() -> anyhow::Result<()> {
    let config = Config::try_parse_from(["benchd", "--log-format", "xml"])?;
    assert!(config.validate().is_err());
    Ok(())
}

#[test]
fn rejects_ap_ip_without_dhcp_room() -> anyhow::Result<()> {
    let config = Config::try_parse_from(["benchd", "--ap-ip", "192.168.4.250"])?;
    assert!(config.validate().is_err());
    Ok(())
}

#[test]
fn gpio_pins_comma_separated() -> anyhow::Result<()> {
    let config = Config::try_parse_from(["benchd", "--gpio-pins", "5,6,13"])?;
    assert_eq!(config.gpio_pins, vec![5, 6, 13]);
    Ok(())
}

#[test]
fn slot_map_loads() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{"slots":[
            {{"label":"SLOT1","slot_key":"usb-1.1","tcp_port":4001}},
            {{"label":"SLOT2","slot_key":"usb-1.2","tcp_port":4002,"boot_pin":5,"reset_pin":6}}
        ]}}"#
    )?;
    let map = load_slot_map(file.path())?;
    assert_eq!(map.slots.len(), 2);
    assert_eq!(map.slots[0].label, "SLOT1");
    assert_eq!(map.slots[0].boot_pin, None);
    assert_eq!(map.slots[1].boot_pin, Some(5));
    assert_eq!(map.slots[1].reset_pin, Some(6));
    Ok(())
}

#[test]
fn slot_map_rejects_duplicate_ports() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{"slots":[
            {{"label":"A","slot_key":"k1","tcp_port":4001}},
            {{"label":"B","slot_key":"k2","tcp_port":4001}}
        ]}}"#
    )?;
    assert!(load_slot_map(file.path()).is_err());
    Ok(())
}

#[test]
fn slot_map_rejects_duplicate_keys() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{"slots":[
            {{"label":"A","slot_key":"k1","tcp_port":4001}},
            {{"label":"B","slot_key":"k1","tcp_port":4002}}
        ]}}"#
    )?;
    assert!(load_slot_map(file.path()).is_err());
    Ok(())
}
