// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Blocking human-confirmation rendezvous.
//!
//! A test script posts a message and blocks; an operator confirms or
//! cancels it from the dashboard. One outstanding request at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::clock::Clock;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Confirmed,
    Cancelled,
}

/// Outcome returned to the blocked requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanOutcome {
    pub confirmed: bool,
    pub timeout: bool,
}

/// Status snapshot for the operator UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanStatus {
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

struct Pending {
    id: u64,
    message: String,
    deadline_ms: u64,
    resolve: oneshot::Sender<Resolution>,
}

pub struct HumanGate {
    clock: Arc<Clock>,
    pending: Mutex<Option<Pending>>,
}

impl HumanGate {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self { clock, pending: Mutex::new(None) }
    }

    /// Block until an operator resolves the request or the timeout expires.
    ///
    /// A second request while one is pending fails with `conflict`.
    pub async fn request(
        &self,
        message: &str,
        timeout: std::time::Duration,
    ) -> Result<HumanOutcome, ApiError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                return Err(ApiError::conflict("human confirmation already pending"));
            }
            let id = self.clock.next_seq();
            let deadline_ms = self.clock.now_ms() + timeout.as_millis() as u64;
            *pending = Some(Pending {
                id,
                message: message.to_owned(),
                deadline_ms,
                resolve: tx,
            });
            id
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Resolution::Confirmed)) => Ok(HumanOutcome { confirmed: true, timeout: false }),
            Ok(Ok(Resolution::Cancelled)) => Ok(HumanOutcome { confirmed: false, timeout: false }),
            // Sender dropped without an answer; treat like a cancel.
            Ok(Err(_)) => Ok(HumanOutcome { confirmed: false, timeout: false }),
            Err(_elapsed) => {
                let mut pending = self.pending.lock().await;
                if pending.as_ref().map(|p| p.id) == Some(id) {
                    *pending = None;
                }
                Ok(HumanOutcome { confirmed: false, timeout: true })
            }
        }
    }

    /// Operator confirmation. Fails with `conflict` when nothing is pending.
    pub async fn done(&self) -> Result<(), ApiError> {
        self.resolve(Resolution::Confirmed).await
    }

    /// Operator cancellation. Fails with `conflict` when nothing is pending.
    pub async fn cancel(&self) -> Result<(), ApiError> {
        self.resolve(Resolution::Cancelled).await
    }

    async fn resolve(&self, resolution: Resolution) -> Result<(), ApiError> {
        let taken = self.pending.lock().await.take();
        match taken {
            Some(pending) => {
                let _ = pending.resolve.send(resolution);
                Ok(())
            }
            None => Err(ApiError::conflict("no human confirmation pending")),
        }
    }

    pub async fn status(&self) -> HumanStatus {
        let pending = self.pending.lock().await;
        match pending.as_ref() {
            Some(p) => HumanStatus {
                pending: true,
                message: Some(p.message.clone()),
                deadline_ms: Some(p.deadline_ms),
            },
            None => HumanStatus { pending: false, message: None, deadline_ms: None },
        }
    }
}

#[cfg(test)]
#[path = "human_tests.rs"]
mod tests;
