// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! UDP log sink: DUTs fire UTF-8 datagrams at a fixed port; lines land in
//! a bounded ring keyed by source address.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpLine {
    pub ts_ms: u64,
    pub source: String,
    pub line: String,
}

/// Bounded drop-oldest ring of received lines.
pub struct UdpLogRing {
    clock: Arc<Clock>,
    capacity: usize,
    lines: Mutex<VecDeque<UdpLine>>,
}

impl UdpLogRing {
    pub fn new(clock: Arc<Clock>, capacity: usize) -> Self {
        Self { clock, capacity, lines: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Split a datagram into lines and push the non-empty ones.
    pub fn ingest(&self, source: &str, datagram: &[u8]) {
        let text = String::from_utf8_lossy(datagram);
        let ts_ms = self.clock.now_ms();
        let mut lines = self.lines.lock();
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(UdpLine {
                ts_ms,
                source: source.to_owned(),
                line: line.to_owned(),
            });
        }
    }

    /// Filtered query: newest-last, bounded by `limit` from the end.
    pub fn query(&self, since_ms: u64, source: Option<&str>, limit: usize) -> Vec<UdpLine> {
        let lines = self.lines.lock();
        let filtered: Vec<UdpLine> = lines
            .iter()
            .filter(|l| l.ts_ms > since_ms)
            .filter(|l| source.map(|s| l.source.starts_with(s)).unwrap_or(true))
            .cloned()
            .collect();
        if filtered.len() > limit {
            filtered[filtered.len() - limit..].to_vec()
        } else {
            filtered
        }
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Receive loop; runs until cancelled. The socket is dropped on exit.
pub async fn run(socket: UdpSocket, ring: Arc<UdpLogRing>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("udp log sink stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, addr)) => ring.ingest(&addr.to_string(), &buf[..n]),
                    Err(e) => {
                        warn!("udp log recv failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "udplog_tests.rs"]
mod tests;
