// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-slot serial proxy: one TCP listener bridging a device node to a
//! single network client with RFC 2217 modem-control pass-through.
//!
//! The proxy is one task owning both the listener and the device fd for
//! its whole lifetime. Raw device bytes are also fanned out on a broadcast
//! tap so the monitor operation can read alongside a flashing client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::comport::{encode, ComPortCodec, SerialAction};
use crate::serial::{SerialDevice, OPEN_RELEASE_HOLD};
use crate::slot::{DeviceFamily, SlotPhase, SlotStatus};

/// Broadcast tap depth in chunks. Slow monitor readers lag and lose data
/// rather than backpressure the device.
const TAP_CAPACITY: usize = 256;

/// Handle to a running proxy, owned by its slot.
pub struct ProxyHandle {
    pub port: u16,
    pub devnode: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    tap: tokio::sync::broadcast::Sender<Bytes>,
    client_connected: Arc<AtomicBool>,
}

impl ProxyHandle {
    /// Subscribe to raw device output.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Bytes> {
        self.tap.subscribe()
    }

    pub fn client_connected(&self) -> bool {
        self.client_connected.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the proxy and wait for the task to release the listener and fd.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Bind the slot's port, open the device, and start the proxy task.
pub async fn start(
    devnode: &str,
    tcp_port: u16,
    status: Arc<Mutex<SlotStatus>>,
) -> anyhow::Result<ProxyHandle> {
    let family = DeviceFamily::classify(devnode);
    let listener = TcpListener::bind(("0.0.0.0", tcp_port))
        .await
        .with_context(|| format!("binding proxy port {tcp_port}"))?;
    let device = SerialDevice::open(std::path::Path::new(devnode), family)
        .with_context(|| format!("opening {devnode}"))?;

    let (tap, _) = tokio::sync::broadcast::channel(TAP_CAPACITY);
    let cancel = CancellationToken::new();
    let client_connected = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run(
        device,
        listener,
        tap.clone(),
        cancel.clone(),
        Arc::clone(&client_connected),
        status,
    ));

    Ok(ProxyHandle {
        port: tcp_port,
        devnode: devnode.to_owned(),
        cancel,
        task,
        tap,
        client_connected,
    })
}

async fn run(
    device: SerialDevice,
    listener: TcpListener,
    tap: tokio::sync::broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    client_connected: Arc<AtomicBool>,
    status: Arc<Mutex<SlotStatus>>,
) {
    // Native-USB chips get their boot window: DTR/RTS stay released for a
    // beat before any client traffic can touch the port.
    if device.family() == DeviceFamily::NativeUsb {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(OPEN_RELEASE_HOLD) => {}
        }
    }

    let mut client: Option<TcpStream> = None;
    let mut codec = ComPortCodec::new();
    let mut device_buf = vec![0u8; 4096];
    let mut client_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            // New connections: first client wins, extras are turned away.
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if client.is_some() {
                            debug!(%peer, "proxy busy, rejecting client");
                            drop(stream);
                        } else {
                            debug!(%peer, "proxy client connected");
                            let _ = stream.set_nodelay(true);
                            client = Some(stream);
                            codec = ComPortCodec::new();
                            client_connected.store(true, Ordering::Release);
                            let mut s = status.lock();
                            if s.phase == SlotPhase::Idle {
                                s.phase = SlotPhase::Flashing;
                            }
                        }
                    }
                    Err(e) => warn!("proxy accept failed: {e}"),
                }
            }

            // Device output: tap always, client when attached.
            read = device.read_chunk(&mut device_buf) => {
                match read {
                    Ok(0) => {
                        debug!(devnode = device.path(), "device EOF");
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&device_buf[..n]);
                        let _ = tap.send(chunk.clone());
                        let mut client_gone = false;
                        if let Some(stream) = client.as_mut() {
                            client_gone = stream.write_all(&encode(&chunk)).await.is_err();
                        }
                        if client_gone {
                            client = None;
                            client_connected.store(false, Ordering::Release);
                            clear_flashing(&status);
                        }
                    }
                    Err(e) => {
                        // EIO means the device went away mid-read; the
                        // hotplug remove will tear the slot down.
                        debug!(devnode = device.path(), "device read failed: {e}");
                        status.lock().last_error = Some(format!("serial read: {e}"));
                        break;
                    }
                }
            }

            // Client input: decode framing, apply control, forward data.
            read = async {
                match client.as_mut() {
                    Some(stream) => stream.read(&mut client_buf).await,
                    None => std::future::pending().await,
                }
            }, if client.is_some() => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!("proxy client disconnected");
                        client = None;
                        client_connected.store(false, Ordering::Release);
                        clear_flashing(&status);
                    }
                    Ok(n) => {
                        let mut actions = Vec::new();
                        let mut replies = Vec::new();
                        codec.decode(&client_buf[..n], &mut actions, &mut replies);
                        if !replies.is_empty() {
                            if let Some(stream) = client.as_mut() {
                                let _ = stream.write_all(&replies).await;
                            }
                        }
                        if apply_actions(&device, actions).await.is_err() {
                            status.lock().last_error =
                                Some("serial write failed".to_owned());
                            break;
                        }
                    }
                }
            }
        }
    }

    client_connected.store(false, Ordering::Release);
    clear_flashing(&status);
}

fn clear_flashing(status: &Arc<Mutex<SlotStatus>>) {
    let mut s = status.lock();
    if s.phase == SlotPhase::Flashing {
        s.phase = SlotPhase::Idle;
    }
}

/// Apply decoded client actions to the device, verbatim.
async fn apply_actions(device: &SerialDevice, actions: Vec<SerialAction>) -> std::io::Result<()> {
    for action in actions {
        match action {
            SerialAction::Data(bytes) => device.write_all(&bytes).await?,
            SerialAction::SetBaud(rate) => device.set_baud(rate)?,
            SerialAction::SetDataSize(bits) => device.set_line_data_size(bits)?,
            SerialAction::SetParity(parity) => device.set_line_parity(parity)?,
            SerialAction::SetStopSize(stop) => device.set_line_stop_bits(stop)?,
            SerialAction::SetDtr(on) => device.set_dtr(on)?,
            SerialAction::SetRts(on) => device.set_rts(on)?,
            SerialAction::SetBreak(on) => device.set_break(on)?,
            SerialAction::Purge => device.purge()?,
        }
    }
    Ok(())
}

/// Hold time before traffic flows after a reset-stop/start cycle.
pub fn settle_delay(family: DeviceFamily, post_add_delay: Duration) -> Duration {
    match family {
        DeviceFamily::NativeUsb => post_add_delay,
        DeviceFamily::UartBridge => Duration::ZERO,
    }
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
