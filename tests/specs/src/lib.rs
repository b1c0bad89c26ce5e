// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `benchd` binary against a temp slot map and fake
//! device/sysfs roots, then exercises it over HTTP.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::{Duration, Instant};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `benchd` binary.
pub fn benchd_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("benchd")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Find a free UDP port by binding to :0 then releasing.
pub fn free_udp_port() -> anyhow::Result<u16> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

/// A running `benchd` process that is killed on drop.
pub struct BenchProcess {
    child: Child,
    port: u16,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

impl BenchProcess {
    /// Spawn the daemon with one configured slot and wait until the HTTP
    /// API answers.
    pub async fn spawn() -> anyhow::Result<Self> {
        ensure_crypto();
        let dir = tempfile::tempdir()?;
        let port = free_port()?;
        let udp_port = free_udp_port()?;
        let proxy_port = free_port()?;

        let slot_map = dir.path().join("slots.json");
        std::fs::write(
            &slot_map,
            format!(
                r#"{{"slots":[{{"label":"SLOT1","slot_key":"usb-1.1","tcp_port":{proxy_port}}}]}}"#
            ),
        )?;
        let dev_root = dir.path().join("dev");
        std::fs::create_dir_all(&dev_root)?;
        let sysfs = dir.path().join("sys");
        std::fs::create_dir_all(sysfs.join("class/tty"))?;

        let child = Command::new(benchd_binary())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--udp-log-port")
            .arg(udp_port.to_string())
            .arg("--slot-map")
            .arg(&slot_map)
            .arg("--dev-root")
            .arg(&dev_root)
            .arg("--sysfs-root")
            .arg(&sysfs)
            .arg("--firmware-dir")
            .arg(dir.path().join("firmware"))
            .arg("--run-dir")
            .arg(dir.path().join("run"))
            .arg("--log-level")
            .arg("warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let process = Self { child, port, dir };
        process.wait_ready().await?;
        Ok(process)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn wait_ready(&self) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Ok(resp) = client.get(self.url("/api/health")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                anyhow::bail!("benchd did not become ready on port {}", self.port);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// GET a path and parse the JSON body.
    pub async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let resp = reqwest::Client::new().get(self.url(path)).send().await?;
        Ok(resp.json().await?)
    }

    /// POST a JSON body and return (status, body).
    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let resp = reqwest::Client::new().post(self.url(path)).json(&body).send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await?))
    }
}

impl Drop for BenchProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
