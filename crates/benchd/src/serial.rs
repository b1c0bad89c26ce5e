// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial device-node access: raw termios setup, modem-control ioctls,
//! and non-blocking async IO over the open fd.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::libc;
use rustix::termios::{self, ControlModes, OptionalActions};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::slot::DeviceFamily;

/// Default line rate applied on open; clients change it over the wire.
pub const DEFAULT_BAUD: u32 = 115_200;

/// How long the native-USB families hold DTR/RTS released after open before
/// traffic is allowed, so the chip's boot window can pass undisturbed.
pub const OPEN_RELEASE_HOLD: Duration = Duration::from_millis(100);

/// An open serial device node with raw termios and exclusive access.
///
/// The fd is owned by the embedded [`File`]; dropping the value closes it
/// on every exit path.
pub struct SerialDevice {
    io: AsyncFd<File>,
    family: DeviceFamily,
    path: String,
}

impl SerialDevice {
    /// Open and configure the device.
    ///
    /// The port comes up raw, `HUPCL` cleared (no DTR pulse on close) and
    /// `TIOCEXCL` taken. Native-USB devices additionally get DTR and RTS
    /// released immediately, before the driver's open-time assertion can
    /// hold the chip in its bootloader.
    pub fn open(path: &Path, family: DeviceFamily) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;

        configure_raw(&file)?;
        set_exclusive(&file)?;

        let device = Self {
            io: AsyncFd::with_interest(file, Interest::READABLE | Interest::WRITABLE)?,
            family,
            path: path.display().to_string(),
        };
        if family == DeviceFamily::NativeUsb {
            device.set_modem(false, false)?;
        }
        Ok(device)
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read a chunk of bytes, waiting for readiness.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, waiting for readiness as needed.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| (&*inner.get_ref()).write(&data[offset..])) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub fn set_dtr(&self, on: bool) -> io::Result<()> {
        self.modem_bits(on, libc::TIOCM_DTR)
    }

    pub fn set_rts(&self, on: bool) -> io::Result<()> {
        self.modem_bits(on, libc::TIOCM_RTS)
    }

    /// Set DTR and RTS together in one ioctl pair.
    pub fn set_modem(&self, dtr: bool, rts: bool) -> io::Result<()> {
        self.set_dtr(dtr)?;
        self.set_rts(rts)
    }

    // Modem-control line ioctls require unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    fn modem_bits(&self, set: bool, bits: libc::c_int) -> io::Result<()> {
        let request = if set { libc::TIOCMBIS } else { libc::TIOCMBIC };
        // SAFETY: TIOCMBIS/TIOCMBIC read a c_int bitmask from the pointer;
        // `bits` lives for the duration of the call.
        let ret = unsafe { libc::ioctl(self.io.as_raw_fd(), request, &bits) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    // Break ioctls require unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn set_break(&self, on: bool) -> io::Result<()> {
        let request = if on { libc::TIOCSBRK } else { libc::TIOCCBRK };
        // SAFETY: TIOCSBRK/TIOCCBRK take no argument.
        let ret = unsafe { libc::ioctl(self.io.as_raw_fd(), request) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Discard unread input and unsent output.
    pub fn purge(&self) -> io::Result<()> {
        termios::tcflush(self.io.get_ref(), termios::QueueSelector::IOFlush)?;
        Ok(())
    }

    pub fn set_baud(&self, rate: u32) -> io::Result<()> {
        let file = self.io.get_ref();
        let mut t = termios::tcgetattr(file)?;
        t.set_speed(rate)?;
        termios::tcsetattr(file, OptionalActions::Now, &t)?;
        Ok(())
    }

    /// Set the character size (5..=8 data bits).
    pub fn set_line_data_size(&self, data_bits: u8) -> io::Result<()> {
        self.update_control_modes(|modes| {
            modes.remove(ControlModes::CSIZE);
            modes.insert(match data_bits {
                5 => ControlModes::CS5,
                6 => ControlModes::CS6,
                7 => ControlModes::CS7,
                _ => ControlModes::CS8,
            });
        })
    }

    /// Set parity using RFC 2217 encoding (1 = none, 2 = odd, 3 = even).
    pub fn set_line_parity(&self, parity: u8) -> io::Result<()> {
        self.update_control_modes(|modes| match parity {
            2 => {
                modes.insert(ControlModes::PARENB | ControlModes::PARODD);
            }
            3 => {
                modes.insert(ControlModes::PARENB);
                modes.remove(ControlModes::PARODD);
            }
            _ => {
                modes.remove(ControlModes::PARENB | ControlModes::PARODD);
            }
        })
    }

    /// Set stop bits (2 = two stop bits, anything else = one).
    pub fn set_line_stop_bits(&self, stop_bits: u8) -> io::Result<()> {
        self.update_control_modes(|modes| {
            if stop_bits == 2 {
                modes.insert(ControlModes::CSTOPB);
            } else {
                modes.remove(ControlModes::CSTOPB);
            }
        })
    }

    fn update_control_modes(&self, apply: impl FnOnce(&mut ControlModes)) -> io::Result<()> {
        let file = self.io.get_ref();
        let mut t = termios::tcgetattr(file)?;
        apply(&mut t.control_modes);
        termios::tcsetattr(file, OptionalActions::Now, &t)?;
        Ok(())
    }
}

/// Raw mode at the default rate, with `HUPCL` cleared so closing the fd
/// does not pulse DTR and reset the chip.
fn configure_raw(file: &File) -> io::Result<()> {
    let mut t = termios::tcgetattr(file)?;
    t.make_raw();
    t.control_modes.remove(ControlModes::HUPCL);
    t.control_modes.insert(ControlModes::CLOCAL | ControlModes::CREAD);
    t.set_speed(DEFAULT_BAUD)?;
    termios::tcsetattr(file, OptionalActions::Now, &t)?;
    Ok(())
}

// TIOCEXCL requires unsafe for the libc::ioctl call
#[allow(unsafe_code)]
fn set_exclusive(file: &File) -> io::Result<()> {
    // SAFETY: TIOCEXCL takes no argument.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TIOCEXCL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Settle check for a freshly-enumerated device node.
///
/// Native-USB devices must not be opened here: the driver would assert
/// DTR+RTS and drop the chip into its bootloader. Existence is enough.
/// UART bridges get a non-blocking open/close probe.
pub async fn wait_for_device(path: &Path, family: DeviceFamily, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let ready = match family {
            DeviceFamily::NativeUsb => tokio::fs::metadata(path).await.is_ok(),
            DeviceFamily::UartBridge => probe_open(path),
        };
        if ready {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn probe_open(path: &Path) -> bool {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .is_ok()
}

/// Accumulates raw bytes and yields complete text lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the complete lines they closed, CR/LF trimmed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let mut raw = std::mem::take(&mut self.pending);
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                lines.push(String::from_utf8_lossy(&raw).into_owned());
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Take whatever partial line is buffered, if non-empty.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[cfg(test)]
#[path = "serial_tests.rs"]
mod tests;
