// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn log_with_capacity(capacity: usize) -> ActivityLog {
    ActivityLog::new(Arc::new(Clock::new()), capacity)
}

#[test]
fn appends_preserve_order() {
    let log = log_with_capacity(16);
    log.push(ActivityLevel::Info, "slot", "first");
    log.push(ActivityLevel::Ok, "slot", "second");
    log.push(ActivityLevel::Step, "wifi", "third");

    let entries = log.since(0);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].message, "first");
    assert_eq!(entries[1].message, "second");
    assert_eq!(entries[2].message, "third");
}

#[test]
fn timestamps_are_monotone() {
    let log = log_with_capacity(64);
    for i in 0..50 {
        log.push(ActivityLevel::Info, "t", format!("entry {i}"));
    }
    let entries = log.since(0);
    for pair in entries.windows(2) {
        assert!(pair[0].ts_ms <= pair[1].ts_ms);
    }
}

#[test]
fn ring_drops_oldest_at_capacity() {
    let log = log_with_capacity(3);
    for i in 0..5 {
        log.push(ActivityLevel::Info, "t", format!("entry {i}"));
    }
    let entries = log.since(0);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].message, "entry 2");
    assert_eq!(entries[2].message, "entry 4");
}

#[test]
fn since_filters_older_entries() {
    let log = log_with_capacity(16);
    log.push(ActivityLevel::Info, "t", "old");
    let cutoff = log.since(0)[0].ts_ms;
    std::thread::sleep(std::time::Duration::from_millis(5));
    log.push(ActivityLevel::Info, "t", "new");

    let newer = log.since(cutoff);
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].message, "new");
    assert!(newer[0].ts_ms > cutoff);
}

#[test]
fn levels_serialize_lowercase() -> anyhow::Result<()> {
    let json = serde_json::to_string(&ActivityLevel::Step)?;
    assert_eq!(json, "\"step\"");
    let json = serde_json::to_string(&ActivityLevel::Ok)?;
    assert_eq!(json, "\"ok\"");
    Ok(())
}
