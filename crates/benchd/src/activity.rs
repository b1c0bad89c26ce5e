// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded in-memory activity log.
//!
//! Every significant action appends here; the dashboard polls with a
//! `since` cursor. Appends are non-blocking and mirrored to `tracing`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::clock::{format_ms, Clock};

/// Default ring capacity in entries.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Ok,
    Error,
    Step,
}

impl ActivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Step => "step",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub ts_ms: u64,
    pub ts: String,
    pub level: ActivityLevel,
    pub tag: String,
    pub message: String,
}

/// Bounded deque of timestamped entries, oldest dropped first.
pub struct ActivityLog {
    clock: Arc<Clock>,
    capacity: usize,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn new(clock: Arc<Clock>, capacity: usize) -> Self {
        Self { clock, capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Append an entry. Never blocks on anything but the ring mutex.
    pub fn push(&self, level: ActivityLevel, tag: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            ActivityLevel::Error => error!(tag, "{message}"),
            ActivityLevel::Step => debug!(tag, "{message}"),
            _ => info!(tag, "{message}"),
        }
        let ts_ms = self.clock.now_ms();
        let entry = ActivityEntry {
            ts_ms,
            ts: format_ms(ts_ms),
            level,
            tag: tag.to_owned(),
            message,
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries with `ts_ms > since_ms`, in insertion order.
    pub fn since(&self, since_ms: u64) -> Vec<ActivityEntry> {
        self.entries.lock().iter().filter(|e| e.ts_ms > since_ms).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "activity_tests.rs"]
mod tests;
