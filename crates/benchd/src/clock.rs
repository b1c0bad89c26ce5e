// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Monotonic millisecond clock and the global hotplug sequence counter.
//!
//! Every hotplug event and activity entry is stamped from here, so one
//! process-wide instance gives total ordering across slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the unix epoch.
fn unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Process-wide clock: monotone-non-decreasing timestamps plus the global
/// event sequence counter.
#[derive(Debug, Default)]
pub struct Clock {
    seq: AtomicU64,
    last_ms: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current timestamp in milliseconds, clamped so that successive calls
    /// never go backwards even if the wall clock steps.
    pub fn now_ms(&self) -> u64 {
        let wall = unix_ms();
        let prev = self.last_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }

    /// Allocate the next global sequence number (first value is 1).
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last allocated sequence number (0 if none yet).
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

/// Format a millisecond timestamp as RFC 3339 with millisecond precision.
pub fn format_ms(ms: u64) -> String {
    let t = UNIX_EPOCH + Duration::from_millis(ms);
    humantime::format_rfc3339_millis(t).to_string()
}

/// Parse a `since` query value: either epoch milliseconds or an RFC 3339
/// timestamp. Returns `None` for unparseable input.
pub fn parse_since(raw: &str) -> Option<u64> {
    if let Ok(ms) = raw.parse::<u64>() {
        return Some(ms);
    }
    let t = humantime::parse_rfc3339_weak(raw).ok()?;
    Some(t.duration_since(UNIX_EPOCH).ok()?.as_millis() as u64)
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
