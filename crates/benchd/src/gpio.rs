// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allowlisted GPIO bit-bang driver.
//!
//! Clients may only touch pins on the allowlist; recovery sequences use
//! the driver directly for the bench's own boot/reset wiring.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ApiError;

/// Requested pin level: driven low, driven high, or released (high-Z).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
    HighZ,
}

impl Serialize for PinLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Low => serializer.serialize_u64(0),
            Self::High => serializer.serialize_u64(1),
            Self::HighZ => serializer.serialize_str("z"),
        }
    }
}

struct PinLevelVisitor;

impl Visitor<'_> for PinLevelVisitor {
    type Value = PinLevel;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("0, 1, or \"z\"")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<PinLevel, E> {
        match value {
            0 => Ok(PinLevel::Low),
            1 => Ok(PinLevel::High),
            other => Err(E::custom(format!("invalid pin value: {other}"))),
        }
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<PinLevel, E> {
        u64::try_from(value)
            .map_err(|_| E::custom(format!("invalid pin value: {value}")))
            .and_then(|v| self.visit_u64(v))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<PinLevel, E> {
        match value {
            "z" | "Z" => Ok(PinLevel::HighZ),
            "0" => Ok(PinLevel::Low),
            "1" => Ok(PinLevel::High),
            other => Err(E::custom(format!("invalid pin value: {other:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for PinLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PinLevelVisitor)
    }
}

/// Low-level pin driver.
pub trait GpioDriver: Send + Sync {
    fn set(&self, pin: u32, level: PinLevel) -> anyhow::Result<()>;
}

/// sysfs GPIO driver: export the pin, then drive or release it.
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn ensure_exported(&self, pin: u32) -> anyhow::Result<()> {
        if self.pin_dir(pin).exists() {
            return Ok(());
        }
        std::fs::write(self.root.join("export"), pin.to_string())?;
        Ok(())
    }
}

impl GpioDriver for SysfsGpio {
    fn set(&self, pin: u32, level: PinLevel) -> anyhow::Result<()> {
        self.ensure_exported(pin)?;
        let dir = self.pin_dir(pin);
        match level {
            PinLevel::Low => {
                std::fs::write(dir.join("direction"), "out")?;
                std::fs::write(dir.join("value"), "0")?;
            }
            PinLevel::High => {
                std::fs::write(dir.join("direction"), "out")?;
                std::fs::write(dir.join("value"), "1")?;
            }
            // Releasing means switching the line back to an input.
            PinLevel::HighZ => {
                std::fs::write(dir.join("direction"), "in")?;
            }
        }
        Ok(())
    }
}

/// Allowlist-enforcing wrapper with a readback table.
pub struct GpioBank {
    allowed: BTreeSet<u32>,
    driver: Box<dyn GpioDriver>,
    states: Mutex<BTreeMap<u32, PinLevel>>,
}

impl GpioBank {
    pub fn new(allowed: impl IntoIterator<Item = u32>, driver: Box<dyn GpioDriver>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            driver,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Client-facing set: pin must be on the allowlist.
    pub fn set(&self, pin: u32, level: PinLevel) -> Result<(), ApiError> {
        if !self.allowed.contains(&pin) {
            return Err(ApiError::bad_request(format!("pin {pin} not in allowlist")));
        }
        self.force(pin, level).map_err(|e| ApiError::internal(format!("gpio set: {e:#}")))
    }

    /// Internal set for bench wiring (recovery boot/reset lines); bypasses
    /// the client allowlist.
    pub fn force(&self, pin: u32, level: PinLevel) -> anyhow::Result<()> {
        self.driver.set(pin, level)?;
        self.states.lock().insert(pin, level);
        Ok(())
    }

    /// Last commanded level per pin.
    pub fn status(&self) -> BTreeMap<u32, PinLevel> {
        self.states.lock().clone()
    }

    pub fn allowed(&self) -> Vec<u32> {
        self.allowed.iter().copied().collect()
    }
}

#[cfg(test)]
#[path = "gpio_tests.rs"]
mod tests;
