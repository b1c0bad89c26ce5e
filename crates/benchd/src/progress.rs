// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test-run progress reporting: the currently-running test script posts
//! updates, the dashboard polls them.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Freeform phase name, e.g. "flashing" or "wifi-tests".
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_ms: u64,
}

pub struct ProgressState {
    clock: Arc<Clock>,
    report: Mutex<ProgressReport>,
}

impl ProgressState {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self { clock, report: Mutex::new(ProgressReport::default()) }
    }

    pub fn update(&self, mut report: ProgressReport) {
        report.updated_ms = self.clock.now_ms();
        *self.report.lock() = report;
    }

    pub fn snapshot(&self) -> ProgressReport {
        self.report.lock().clone()
    }
}

#[cfg(test)]
#[path = "progress_tests.rs"]
mod tests;
