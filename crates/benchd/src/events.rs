// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-consumer long-poll queue of wireless lifecycle events.
//!
//! Station lease callbacks push; one diagnostic client drains. Concurrent
//! drains are serialised so no event is observed by two callers.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WirelessEventKind {
    #[serde(rename = "STA_CONNECT")]
    StaConnect,
    #[serde(rename = "STA_DISCONNECT")]
    StaDisconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirelessEvent {
    pub kind: WirelessEventKind,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub ts_ms: u64,
}

/// FIFO with a blocking drain.
#[derive(Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<WirelessEvent>>,
    notify: Notify,
    consumer: tokio::sync::Mutex<()>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: WirelessEvent) {
        self.queue.lock().push_back(event);
        self.notify.notify_one();
    }

    fn take_all(&self) -> Vec<WirelessEvent> {
        self.queue.lock().drain(..).collect()
    }

    /// Drain pending events, or block up to `timeout` for the first one.
    ///
    /// Returns an empty vec on timeout. Only one caller drains at a time;
    /// a second concurrent caller queues behind the first.
    pub async fn drain(&self, timeout: Duration) -> Vec<WirelessEvent> {
        let _consumer = self.consumer.lock().await;
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the wakeup before checking the queue so a push between
            // the check and the await is not lost.
            let notified = self.notify.notified();
            let events = self.take_all();
            if !events.is_empty() {
                return events;
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.take_all();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
