// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Production [`RadioBackend`] that drives the stock Linux wireless stack:
//! `hostapd` + `dnsmasq` for the AP role, `wpa_supplicant` + a DHCP client
//! for the station role, `iw` for scanning.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::backend::{ApConfig, RadioBackend, ScanNetwork, StaLease};

/// DHCP clients tried in order for the station role.
const DHCP_CLIENTS: &[&str] = &["dhcpcd", "dhclient", "udhcpc"];

#[derive(Default)]
struct Children {
    hostapd: Option<Child>,
    dnsmasq: Option<Child>,
    supplicant: Option<Child>,
}

pub struct SystemRadio {
    interface: String,
    run_dir: PathBuf,
    /// Script handed to dnsmasq's `--dhcp-script` so lease changes reach
    /// the lease-event endpoint (wired up by the installer).
    lease_script: Option<PathBuf>,
    children: Mutex<Children>,
}

impl SystemRadio {
    pub fn new(interface: &str, run_dir: PathBuf, lease_script: Option<PathBuf>) -> Self {
        Self {
            interface: interface.to_owned(),
            run_dir,
            lease_script,
            children: Mutex::new(Children::default()),
        }
    }

    fn ctrl_dir(&self) -> PathBuf {
        self.run_dir.join("wpa")
    }

    async fn flush_interface(&self) -> anyhow::Result<()> {
        run("ip", &["addr", "flush", "dev", &self.interface]).await?;
        Ok(())
    }

    async fn kill(child: Option<Child>) {
        let Some(mut child) = child else {
            return;
        };
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

impl RadioBackend for SystemRadio {
    fn start_ap(&self, config: ApConfig) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.run_dir).await?;
            let conf_path = self.run_dir.join("hostapd.conf");
            tokio::fs::write(&conf_path, hostapd_conf(&config)).await?;

            self.flush_interface().await?;
            run("ip", &["addr", "add", &format!("{}/24", config.ip), "dev", &self.interface])
                .await?;
            run("ip", &["link", "set", &self.interface, "up"]).await?;

            let hostapd = Command::new("hostapd")
                .arg(&conf_path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("spawning hostapd")?;

            let range = format!(
                "{},{},{}s",
                config.dhcp_range_start, config.dhcp_range_end, config.lease_secs
            );
            let mut dnsmasq = Command::new("dnsmasq");
            dnsmasq
                .arg("--no-daemon")
                .arg("--port=0")
                .arg(format!("--interface={}", self.interface))
                .arg("--bind-interfaces")
                .arg(format!("--dhcp-range={range}"))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(ref script) = self.lease_script {
                dnsmasq.arg(format!("--dhcp-script={}", script.display()));
            }
            let dnsmasq = dnsmasq.spawn().context("spawning dnsmasq")?;

            let mut children = self.children.lock();
            children.hostapd = Some(hostapd);
            children.dnsmasq = Some(dnsmasq);
            Ok(())
        })
    }

    fn stop_ap(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let (hostapd, dnsmasq) = {
                let mut children = self.children.lock();
                (children.hostapd.take(), children.dnsmasq.take())
            };
            Self::kill(hostapd).await;
            Self::kill(dnsmasq).await;
            self.flush_interface().await
        })
    }

    fn start_station(
        &self,
        ssid: String,
        password: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let ctrl = self.ctrl_dir();
            tokio::fs::create_dir_all(&ctrl).await?;
            // A stale control socket from a crashed supplicant blocks the
            // new one from binding.
            let stale = ctrl.join(&self.interface);
            let _ = tokio::fs::remove_file(&stale).await;

            let conf_path = self.run_dir.join("wpa_supplicant.conf");
            tokio::fs::write(&conf_path, supplicant_conf(&ctrl, &ssid, password.as_deref()))
                .await?;

            let supplicant = Command::new("wpa_supplicant")
                .arg("-i")
                .arg(&self.interface)
                .arg("-c")
                .arg(&conf_path)
                .arg("-Dnl80211,wext")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("spawning wpa_supplicant")?;
            self.children.lock().supplicant = Some(supplicant);
            Ok(())
        })
    }

    fn station_state(&self) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            let ctrl = self.ctrl_dir();
            let output = run(
                "wpa_cli",
                &["-p", &ctrl.display().to_string(), "-i", &self.interface, "status"],
            )
            .await?;
            for line in output.lines() {
                if let Some(state) = line.strip_prefix("wpa_state=") {
                    return Ok(state.trim().to_owned());
                }
            }
            Ok("UNKNOWN".to_owned())
        })
    }

    fn acquire_lease(&self) -> BoxFuture<'_, anyhow::Result<StaLease>> {
        Box::pin(async move {
            let mut last_err = None;
            for client in DHCP_CLIENTS {
                let args: Vec<&str> = match *client {
                    "dhcpcd" => vec!["-4", "-t", "15", &self.interface],
                    "dhclient" => vec!["-1", &self.interface],
                    _ => vec!["-i", &self.interface, "-n", "-q"],
                };
                match run(client, &args).await {
                    Ok(_) => {
                        let ip = self
                            .interface_address()
                            .await?
                            .context("no address after DHCP")?;
                        let gateway = self.default_gateway().await?;
                        return Ok(StaLease { ip: ip.to_string(), gateway });
                    }
                    Err(e) => {
                        debug!("{client} failed: {e:#}");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no DHCP client available")))
        })
    }

    fn stop_station(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let supplicant = self.children.lock().supplicant.take();
            Self::kill(supplicant).await;
            self.flush_interface().await
        })
    }

    fn scan(&self) -> BoxFuture<'_, anyhow::Result<Vec<ScanNetwork>>> {
        Box::pin(async move {
            let output = run("iw", &["dev", &self.interface, "scan"]).await?;
            Ok(parse_iw_scan(&output))
        })
    }

    fn interface_ip(&self) -> BoxFuture<'_, anyhow::Result<Option<IpAddr>>> {
        Box::pin(async move { self.interface_address().await })
    }
}

impl SystemRadio {
    async fn interface_address(&self) -> anyhow::Result<Option<IpAddr>> {
        let output = run("ip", &["-4", "addr", "show", "dev", &self.interface]).await?;
        Ok(parse_inet_addr(&output))
    }

    async fn default_gateway(&self) -> anyhow::Result<String> {
        let output = run("ip", &["route", "show", "default", "dev", &self.interface]).await?;
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some("default") && parts.next() == Some("via") {
                if let Some(gw) = parts.next() {
                    return Ok(gw.to_owned());
                }
            }
        }
        anyhow::bail!("no default route on {}", self.interface)
    }
}

/// Run a command to completion, returning stdout on success.
async fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("running {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("{program} {args:?} failed: {}", stderr.trim());
        anyhow::bail!("{program} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn hostapd_conf(config: &ApConfig) -> String {
    let mut conf = format!(
        "interface={}\nssid={}\nhw_mode=g\nchannel={}\nmacaddr_acl=0\nignore_broadcast_ssid=0\n",
        config.interface, config.ssid, config.channel
    );
    if let Some(ref password) = config.password {
        conf.push_str("auth_algs=1\nwpa=2\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
        conf.push_str(&format!("wpa_passphrase={password}\n"));
    }
    conf
}

/// Supplicant config with a `ctrl_interface=` line so `wpa_cli` can poll
/// association state.
fn supplicant_conf(ctrl_dir: &std::path::Path, ssid: &str, password: Option<&str>) -> String {
    let network = match password {
        Some(password) => format!(
            "network={{\n    ssid=\"{ssid}\"\n    psk=\"{password}\"\n}}\n"
        ),
        None => format!(
            "network={{\n    ssid=\"{ssid}\"\n    key_mgmt=NONE\n}}\n"
        ),
    };
    format!("ctrl_interface={}\n{network}", ctrl_dir.display())
}

/// Parse the first `inet a.b.c.d/nn` from `ip -4 addr show` output.
fn parse_inet_addr(output: &str) -> Option<IpAddr> {
    for line in output.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("inet ") {
            let addr = rest.split(['/', ' ']).next()?;
            if let Ok(ip) = addr.parse() {
                return Some(ip);
            }
        }
    }
    None
}

/// Parse `iw dev <if> scan` output into networks.
fn parse_iw_scan(output: &str) -> Vec<ScanNetwork> {
    let mut networks = Vec::new();
    let mut current: Option<ScanNetwork> = None;
    for line in output.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("BSS ") {
            if let Some(done) = current.take() {
                if !done.ssid.is_empty() {
                    networks.push(done);
                }
            }
            current = Some(ScanNetwork {
                ssid: String::new(),
                signal_dbm: i32::MIN,
                channel: None,
                secured: false,
            });
        } else if let Some(ref mut network) = current {
            if let Some(rest) = trimmed.strip_prefix("signal: ") {
                if let Some(value) = rest.split_whitespace().next() {
                    if let Ok(dbm) = value.parse::<f32>() {
                        network.signal_dbm = dbm.round() as i32;
                    }
                }
            } else if let Some(rest) = trimmed.strip_prefix("SSID: ") {
                network.ssid = rest.to_owned();
            } else if let Some(rest) = trimmed.strip_prefix("DS Parameter set: channel ") {
                network.channel = rest.trim().parse().ok();
            } else if trimmed.starts_with("RSN:") || trimmed.starts_with("WPA:") {
                network.secured = true;
            }
        }
    }
    if let Some(done) = current.take() {
        if !done.ssid.is_empty() {
            networks.push(done);
        }
    }
    networks
}

#[cfg(test)]
#[path = "system_tests.rs"]
mod tests;
