// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests against the spawned `benchd` binary.

use std::time::Duration;

use benchd_specs::BenchProcess;

#[tokio::test]
async fn fresh_boot_lists_configured_slots() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;

    let body = bench.get_json("/api/devices").await?;
    assert_eq!(body["ok"], true);
    let slots = body["slots"].as_array().cloned().unwrap_or_default();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0]["label"], "SLOT1");
    assert_eq!(slots[0]["present"], false);
    assert_eq!(slots[0]["running"], false);
    assert_eq!(slots[0]["state"], "absent");
    Ok(())
}

#[tokio::test]
async fn info_and_health_answer() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;

    let health = bench.get_json("/api/health").await?;
    assert_eq!(health["ok"], true);
    assert_eq!(health["status"], "running");

    let info = bench.get_json("/api/info").await?;
    assert_eq!(info["ok"], true);
    assert_eq!(info["slots"]["total"], 1);
    Ok(())
}

#[tokio::test]
async fn hotplug_on_unknown_connector_is_observed() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;

    let (status, body) = bench
        .post_json(
            "/api/hotplug",
            serde_json::json!({
                "action": "add", "devnode": "/dev/ttyUSB7", "id_path": "usb-9.9", "devpath": ""
            }),
        )
        .await?;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);

    let devices = bench.get_json("/api/devices").await?;
    let observations = devices["observations"].as_array().cloned().unwrap_or_default();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0]["slot_key"], "usb-9.9");

    // The activity log recorded it.
    let log = bench.get_json("/api/log").await?;
    let entries = log["entries"].as_array().cloned().unwrap_or_default();
    assert!(entries
        .iter()
        .any(|e| e["message"].as_str().unwrap_or_default().contains("usb-9.9")));
    Ok(())
}

#[tokio::test]
async fn blocked_human_interaction_resolves_through_concurrent_request() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;

    // The interaction blocks server-side; `done` must get through on a
    // parallel connection.
    let interaction = {
        let url = bench.url("/api/human-interaction");
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .json(&serde_json::json!({ "message": "press button", "timeout": 30 }))
                .send()
                .await
        })
    };

    // Wait until the request is registered, then confirm it.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = bench.get_json("/api/human/status").await?;
        if status["pending"] == true {
            break;
        }
        anyhow::ensure!(std::time::Instant::now() < deadline, "request never registered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let (status, _) = bench.post_json("/api/human/done", serde_json::json!({})).await?;
    assert_eq!(status, 200);

    let resp = interaction.await.map_err(|e| anyhow::anyhow!("join: {e}"))??;
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["ok"], true);
    assert_eq!(body["confirmed"], true);
    Ok(())
}

#[tokio::test]
async fn stop_on_absent_slot_is_a_noop() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;
    let (status, body) =
        bench.post_json("/api/stop", serde_json::json!({ "slot_key": "SLOT1" })).await?;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    Ok(())
}

#[tokio::test]
async fn unknown_slot_is_not_found() -> anyhow::Result<()> {
    let bench = BenchProcess::spawn().await?;
    let (status, body) =
        bench.post_json("/api/serial/reset", serde_json::json!({ "slot": "SLOT9" })).await?;
    assert_eq!(status, 404);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "not_found");
    Ok(())
}
