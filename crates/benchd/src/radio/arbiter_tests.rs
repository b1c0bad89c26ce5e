// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::events::WirelessEventKind;
use crate::test_support::CoordinatorBuilder;

fn scan_fixture() -> Vec<ScanNetwork> {
    vec![
        ScanNetwork { ssid: "Weak".to_owned(), signal_dbm: -80, channel: Some(11), secured: true },
        ScanNetwork { ssid: "Strong".to_owned(), signal_dbm: -40, channel: Some(1), secured: true },
        ScanNetwork { ssid: "Mid".to_owned(), signal_dbm: -60, channel: Some(6), secured: false },
    ]
}

#[tokio::test]
async fn ap_start_brings_up_ap_with_dhcp_range() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("TestNet", Some("12345678"), None).await?;

    assert!(matches!(bench.coord.radio.state().await, RadioState::Ap { ref ssid, .. } if ssid == "TestNet"));
    let state = bench.radio.state.lock();
    let ap = state.ap.as_ref().ok_or_else(|| anyhow::anyhow!("no AP config"))?;
    assert_eq!(ap.ip.to_string(), "192.168.4.1");
    assert_eq!(ap.dhcp_range_start.to_string(), "192.168.4.2");
    assert_eq!(ap.dhcp_range_end.to_string(), "192.168.4.20");
    assert_eq!(ap.lease_secs, 3600);
    Ok(())
}

#[tokio::test]
async fn ap_restart_equals_stop_then_start() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("First", None, Some(1)).await?;
    bench.coord.radio.ap_start("Second", None, Some(11)).await?;

    let calls = bench.radio.calls.lock().clone();
    assert_eq!(calls, vec!["start_ap First", "stop_ap", "start_ap Second"]);
    assert!(matches!(
        bench.coord.radio.state().await,
        RadioState::Ap { ref ssid, channel: 11 } if ssid == "Second"
    ));
    Ok(())
}

#[tokio::test]
async fn sta_join_tears_down_running_ap() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("T", Some("12345678"), None).await?;

    let lease = bench
        .coord
        .radio
        .sta_join("Other", Some("pw"), Duration::from_secs(5))
        .await?;
    assert_eq!(lease.ip, "192.168.1.50");
    assert_eq!(lease.gateway, "192.168.1.1");
    assert!(!bench.radio.ap_active());
    assert!(matches!(bench.coord.radio.state().await, RadioState::Sta { .. }));
    Ok(())
}

#[tokio::test]
async fn sta_join_association_timeout_reverts_to_idle() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.radio.fail_association.store(true, Ordering::Release);

    let result = bench.coord.radio.sta_join("NoSuchNet", None, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::Timeout));
    assert!(matches!(bench.coord.radio.state().await, RadioState::Idle));
    assert!(!bench.radio.station_active());
    Ok(())
}

#[tokio::test]
async fn sta_join_dhcp_failure_reverts_to_idle() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.radio.fail_dhcp.store(true, Ordering::Release);

    let result = bench.coord.radio.sta_join("Net", Some("pw"), Duration::from_secs(5)).await;
    assert!(matches!(result, Err(ref e) if e.code == ErrorCode::Internal));
    assert!(matches!(bench.coord.radio.state().await, RadioState::Idle));
    assert!(!bench.radio.station_active());
    Ok(())
}

#[tokio::test]
async fn scan_sorts_by_signal_and_omits_own_ap() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().scan_results(scan_fixture()).build()?;
    let networks = bench.coord.radio.scan().await?;
    assert_eq!(
        networks.iter().map(|n| n.ssid.as_str()).collect::<Vec<_>>(),
        vec!["Strong", "Mid", "Weak"]
    );

    bench.coord.radio.ap_start("Strong", None, None).await?;
    let networks = bench.coord.radio.scan().await?;
    assert_eq!(
        networks.iter().map(|n| n.ssid.as_str()).collect::<Vec<_>>(),
        vec!["Mid", "Weak"]
    );
    Ok(())
}

#[tokio::test]
async fn uplink_blocks_tester_operations() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.enter_uplink("HomeNet", Some("pw"), Duration::from_secs(5)).await?;
    assert!(matches!(bench.coord.radio.state().await, RadioState::Uplink { .. }));

    let err = bench.coord.radio.ap_start("T", None, None).await.err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::Unavailable));
    let err = bench.coord.radio.scan().await.err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::Unavailable));
    let err = bench
        .coord
        .radio
        .http_relay(RelayRequest {
            method: "GET".to_owned(),
            url: "http://127.0.0.1:1/".to_owned(),
            headers: Default::default(),
            body: None,
        })
        .await
        .err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::Unavailable));

    bench.coord.radio.leave_uplink().await?;
    assert!(matches!(bench.coord.radio.state().await, RadioState::Idle));
    Ok(())
}

#[tokio::test]
async fn failed_uplink_restores_previous_ap() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("BenchAP", Some("12345678"), Some(3)).await?;
    bench.radio.fail_association.store(true, Ordering::Release);

    let result = bench
        .coord
        .radio
        .enter_uplink("HomeNet", Some("pw"), Duration::from_millis(100))
        .await;
    assert!(result.is_err());
    assert!(matches!(
        bench.coord.radio.state().await,
        RadioState::Ap { ref ssid, channel: 3 } if ssid == "BenchAP"
    ));
    assert!(bench.radio.ap_active());
    Ok(())
}

#[tokio::test]
async fn lease_events_feed_station_table_and_queue() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    let radio = &bench.coord.radio;

    radio.lease_event("add", "aa:bb:cc:00:00:01", Some("192.168.4.2"), Some("dut1")).await?;
    radio.lease_event("old", "aa:bb:cc:00:00:01", Some("192.168.4.2"), None).await?;
    let stations = radio.stations().await;
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].hostname.as_deref(), Some("dut1"));

    radio.lease_event("del", "aa:bb:cc:00:00:01", None, None).await?;
    assert!(radio.stations().await.is_empty());

    let events = bench.coord.events.drain(Duration::from_millis(50)).await;
    let kinds: Vec<WirelessEventKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&WirelessEventKind::StaConnect));
    assert!(kinds.contains(&WirelessEventKind::StaDisconnect));
    // The del event keeps the ip learned from the lease.
    let disconnect = events
        .iter()
        .find(|e| e.kind == WirelessEventKind::StaDisconnect)
        .ok_or_else(|| anyhow::anyhow!("no disconnect"))?;
    assert_eq!(disconnect.ip.as_deref(), Some("192.168.4.2"));
    Ok(())
}

#[tokio::test]
async fn ap_stop_emits_disconnect_for_every_station() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("T", None, None).await?;
    bench.coord.radio.lease_event("add", "aa:bb:cc:00:00:01", Some("192.168.4.2"), None).await?;
    bench.coord.radio.lease_event("add", "aa:bb:cc:00:00:02", Some("192.168.4.3"), None).await?;
    // Drain the connect events first.
    let _ = bench.coord.events.drain(Duration::from_millis(50)).await;

    bench.coord.radio.ap_stop().await?;
    let events = bench.coord.events.drain(Duration::from_millis(50)).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.kind == WirelessEventKind::StaDisconnect));
    Ok(())
}

#[tokio::test]
async fn bad_lease_action_is_bad_request() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    let result = bench.coord.radio.lease_event("renew", "aa:bb:cc:00:00:01", None, None).await;
    assert!(matches!(result, Err(e) if e.code == ErrorCode::BadRequest));
    Ok(())
}

#[tokio::test]
async fn relay_requires_connectivity() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    let err = bench
        .coord
        .radio
        .http_relay(RelayRequest {
            method: "GET".to_owned(),
            url: "http://127.0.0.1:1/".to_owned(),
            headers: Default::default(),
            body: None,
        })
        .await
        .err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::Conflict));
    Ok(())
}

#[tokio::test]
async fn relay_executes_request_in_ap_mode() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("T", None, None).await?;

    // Minimal one-shot HTTP server standing in for a DUT.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi")
                .await;
        }
    });

    let response = bench
        .coord
        .radio
        .http_relay(RelayRequest {
            method: "GET".to_owned(),
            url: format!("http://{addr}/status"),
            headers: Default::default(),
            body: None,
        })
        .await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, base64::engine::general_purpose::STANDARD.encode("hi"));
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn relay_rejects_bad_method_and_body() -> anyhow::Result<()> {
    let bench = CoordinatorBuilder::new().build()?;
    bench.coord.radio.ap_start("T", None, None).await?;

    let err = bench
        .coord
        .radio
        .http_relay(RelayRequest {
            method: "NOT A METHOD".to_owned(),
            url: "http://127.0.0.1:1/".to_owned(),
            headers: Default::default(),
            body: None,
        })
        .await
        .err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::BadRequest));

    let err = bench
        .coord
        .radio
        .http_relay(RelayRequest {
            method: "POST".to_owned(),
            url: "http://127.0.0.1:1/".to_owned(),
            headers: Default::default(),
            body: Some("!!! not base64 !!!".to_owned()),
        })
        .await
        .err();
    assert!(matches!(err, Some(ref e) if e.code == ErrorCode::BadRequest));
    Ok(())
}
