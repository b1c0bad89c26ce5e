// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builders and simulated backends for tests. Must be used from within a
//! tokio runtime (the BLE facade spawns its event watcher on build).

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::activity::ActivityLog;
use crate::ble::{
    BleAdvert, BleCentral, BleConnection, BleEvent, BluetoothBackend, GattCharacteristic,
    GattService,
};
use crate::clock::Clock;
use crate::config::SlotEntry;
use crate::coordinator::{BenchSettings, Coordinator};
use crate::events::EventQueue;
use crate::firmware::FirmwareStore;
use crate::flap::UsbControl;
use crate::gpio::{GpioBank, GpioDriver, PinLevel};
use crate::human::HumanGate;
use crate::progress::ProgressState;
use crate::radio::{ApConfig, RadioArbiter, RadioBackend, RadioSettings, ScanNetwork, StaLease};
use crate::slot::SlotMap;
use crate::udplog::UdpLogRing;

// -- Simulated radio ----------------------------------------------------------

#[derive(Debug, Default)]
pub struct SimRadioState {
    pub ap: Option<ApConfig>,
    pub station_ssid: Option<String>,
    pub associated: bool,
}

/// In-memory radio backend with scriptable failures.
pub struct SimRadio {
    pub state: Mutex<SimRadioState>,
    pub scan_results: Mutex<Vec<ScanNetwork>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_ap: AtomicBool,
    pub fail_association: AtomicBool,
    pub fail_dhcp: AtomicBool,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimRadioState::default()),
            scan_results: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_ap: AtomicBool::new(false),
            fail_association: AtomicBool::new(false),
            fail_dhcp: AtomicBool::new(false),
        }
    }
}

impl SimRadio {
    pub fn ap_active(&self) -> bool {
        self.state.lock().ap.is_some()
    }

    pub fn station_active(&self) -> bool {
        self.state.lock().station_ssid.is_some()
    }
}

impl RadioBackend for SimRadio {
    fn start_ap(&self, config: ApConfig) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().push(format!("start_ap {}", config.ssid));
            if self.fail_ap.load(Ordering::Acquire) {
                anyhow::bail!("hostapd refused to start");
            }
            self.state.lock().ap = Some(config);
            Ok(())
        })
    }

    fn stop_ap(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().push("stop_ap".to_owned());
            self.state.lock().ap = None;
            Ok(())
        })
    }

    fn start_station(
        &self,
        ssid: String,
        _password: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().push(format!("start_station {ssid}"));
            let mut state = self.state.lock();
            state.station_ssid = Some(ssid);
            state.associated = !self.fail_association.load(Ordering::Acquire);
            Ok(())
        })
    }

    fn station_state(&self) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            let associated = self.state.lock().associated;
            Ok(if associated { "COMPLETED".to_owned() } else { "SCANNING".to_owned() })
        })
    }

    fn acquire_lease(&self) -> BoxFuture<'_, anyhow::Result<StaLease>> {
        Box::pin(async move {
            self.calls.lock().push("acquire_lease".to_owned());
            if self.fail_dhcp.load(Ordering::Acquire) {
                anyhow::bail!("no DHCP offer");
            }
            Ok(StaLease { ip: "192.168.1.50".to_owned(), gateway: "192.168.1.1".to_owned() })
        })
    }

    fn stop_station(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.calls.lock().push("stop_station".to_owned());
            let mut state = self.state.lock();
            state.station_ssid = None;
            state.associated = false;
            Ok(())
        })
    }

    fn scan(&self) -> BoxFuture<'_, anyhow::Result<Vec<ScanNetwork>>> {
        Box::pin(async move {
            self.calls.lock().push("scan".to_owned());
            Ok(self.scan_results.lock().clone())
        })
    }

    fn interface_ip(&self) -> BoxFuture<'_, anyhow::Result<Option<IpAddr>>> {
        Box::pin(async move { Ok(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))) })
    }
}

// -- Simulated bluetooth ------------------------------------------------------

pub struct SimBluetooth {
    pub adverts: Mutex<Vec<BleAdvert>>,
    pub services: Mutex<Vec<GattService>>,
    pub writes: Mutex<Vec<(String, Vec<u8>, bool)>>,
    pub connected: Mutex<Option<String>>,
    events: broadcast::Sender<BleEvent>,
}

impl Default for SimBluetooth {
    fn default() -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            adverts: Mutex::new(vec![BleAdvert {
                address: "C0:FF:EE:00:00:01".to_owned(),
                name: Some("bench-dut".to_owned()),
                rssi: -52,
            }]),
            services: Mutex::new(vec![GattService {
                uuid: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_owned(),
                characteristics: vec![GattCharacteristic {
                    uuid: "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_owned(),
                    properties: vec!["write".to_owned(), "write-without-response".to_owned()],
                }],
            }]),
            writes: Mutex::new(Vec::new()),
            connected: Mutex::new(None),
            events,
        }
    }
}

impl SimBluetooth {
    /// Simulate a remote-initiated disconnect.
    pub fn emit_disconnect(&self, address: &str) {
        *self.connected.lock() = None;
        let _ = self.events.send(BleEvent::Disconnected { address: address.to_owned() });
    }
}

impl BluetoothBackend for SimBluetooth {
    fn scan(&self, _timeout: Duration) -> BoxFuture<'_, anyhow::Result<Vec<BleAdvert>>> {
        Box::pin(async move { Ok(self.adverts.lock().clone()) })
    }

    fn connect(&self, address: String) -> BoxFuture<'_, anyhow::Result<BleConnection>> {
        Box::pin(async move {
            *self.connected.lock() = Some(address);
            Ok(BleConnection {
                name: Some("bench-dut".to_owned()),
                services: self.services.lock().clone(),
            })
        })
    }

    fn write(
        &self,
        characteristic: String,
        payload: Vec<u8>,
        with_response: bool,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.writes.lock().push((characteristic, payload, with_response));
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            *self.connected.lock() = None;
            Ok(())
        })
    }

    fn events(&self) -> broadcast::Receiver<BleEvent> {
        self.events.subscribe()
    }
}

// -- In-memory GPIO -----------------------------------------------------------

#[derive(Default)]
pub struct MemGpio {
    pub calls: Mutex<Vec<(u32, PinLevel)>>,
}

impl GpioDriver for MemGpio {
    fn set(&self, pin: u32, level: PinLevel) -> anyhow::Result<()> {
        self.calls.lock().push((pin, level));
        Ok(())
    }
}

// -- Coordinator builder ------------------------------------------------------

/// A fully-built coordinator over simulated backends, plus handles to poke
/// them from tests. Keep the value alive: it owns the temp directories.
pub struct TestBench {
    pub coord: Arc<Coordinator>,
    pub radio: Arc<SimRadio>,
    pub ble: Arc<SimBluetooth>,
    pub gpio: Arc<MemGpio>,
    pub dir: tempfile::TempDir,
}

pub struct CoordinatorBuilder {
    slots: Vec<SlotEntry>,
    flap_threshold: usize,
    flap_window_ms: u64,
    flap_cooldown: Duration,
    flap_max_retries: u32,
    settle_timeout: Duration,
    post_add_delay: Duration,
    scan_results: Vec<ScanNetwork>,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            flap_threshold: 6,
            flap_window_ms: 30_000,
            flap_cooldown: Duration::from_millis(20),
            flap_max_retries: 2,
            settle_timeout: Duration::from_millis(500),
            post_add_delay: Duration::ZERO,
            scan_results: Vec::new(),
        }
    }

    pub fn slot(mut self, label: &str, slot_key: &str, tcp_port: u16) -> Self {
        self.slots.push(SlotEntry {
            label: label.to_owned(),
            slot_key: slot_key.to_owned(),
            tcp_port,
            boot_pin: None,
            reset_pin: None,
        });
        self
    }

    pub fn slot_with_gpio(
        mut self,
        label: &str,
        slot_key: &str,
        tcp_port: u16,
        boot_pin: u32,
        reset_pin: u32,
    ) -> Self {
        self.slots.push(SlotEntry {
            label: label.to_owned(),
            slot_key: slot_key.to_owned(),
            tcp_port,
            boot_pin: Some(boot_pin),
            reset_pin: Some(reset_pin),
        });
        self
    }

    pub fn flap(mut self, threshold: usize, window_ms: u64) -> Self {
        self.flap_threshold = threshold;
        self.flap_window_ms = window_ms;
        self
    }

    pub fn flap_cooldown(mut self, cooldown: Duration) -> Self {
        self.flap_cooldown = cooldown;
        self
    }

    pub fn settle_timeout(mut self, settle: Duration) -> Self {
        self.settle_timeout = settle;
        self
    }

    pub fn scan_results(mut self, results: Vec<ScanNetwork>) -> Self {
        self.scan_results = results;
        self
    }

    pub fn build(self) -> anyhow::Result<TestBench> {
        crate::run::ensure_crypto();
        let dir = tempfile::tempdir()?;
        let sysfs_root = dir.path().join("sys");
        std::fs::create_dir_all(sysfs_root.join("bus/usb/drivers/usb"))?;
        std::fs::create_dir_all(sysfs_root.join("class/tty"))?;
        let dev_root = dir.path().join("dev");
        std::fs::create_dir_all(&dev_root)?;

        let clock = Arc::new(Clock::new());
        let activity = Arc::new(ActivityLog::new(Arc::clone(&clock), 256));
        let events = Arc::new(EventQueue::new());
        let slots = Arc::new(SlotMap::new(&self.slots));

        let radio_backend = Arc::new(SimRadio {
            scan_results: Mutex::new(self.scan_results),
            ..SimRadio::default()
        });
        let radio = Arc::new(RadioArbiter::new(
            RadioSettings {
                interface: "wlan0".to_owned(),
                ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            },
            Arc::clone(&radio_backend) as Arc<dyn RadioBackend>,
            Arc::clone(&events),
            Arc::clone(&activity),
            Arc::clone(&clock),
        ));

        let ble_backend = Arc::new(SimBluetooth::default());
        let ble = BleCentral::new(
            Arc::clone(&ble_backend) as Arc<dyn BluetoothBackend>,
            Arc::clone(&activity),
        );

        let gpio_driver = Arc::new(MemGpio::default());
        let gpio = Arc::new(GpioBank::new([5, 6, 13, 19, 26], Box::new(SharedGpio(Arc::clone(
            &gpio_driver,
        )))));

        let settings = BenchSettings {
            advertise_host: "bench.local".to_owned(),
            hostname: "bench".to_owned(),
            flap_window_ms: self.flap_window_ms,
            flap_threshold: self.flap_threshold,
            flap_cooldown: self.flap_cooldown,
            flap_max_retries: self.flap_max_retries,
            settle_timeout: self.settle_timeout,
            post_add_delay: self.post_add_delay,
            dev_root,
            sysfs_root: sysfs_root.clone(),
            wifi_interface: "wlan0".to_owned(),
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            ble_scan_timeout: Duration::from_millis(100),
            udp_log_port: 0,
        };

        let coord = Arc::new(Coordinator {
            settings,
            clock: Arc::clone(&clock),
            activity: Arc::clone(&activity),
            events,
            slots,
            radio,
            ble,
            gpio,
            firmware: Arc::new(FirmwareStore::new(dir.path().join("firmware"))),
            udplog: Arc::new(UdpLogRing::new(Arc::clone(&clock), 128)),
            human: Arc::new(HumanGate::new(Arc::clone(&clock))),
            progress: Arc::new(ProgressState::new(clock)),
            usb: UsbControl::new(sysfs_root),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        Ok(TestBench { coord, radio: radio_backend, ble: ble_backend, gpio: gpio_driver, dir })
    }
}

/// Adapter so the bank can own a driver the test also holds.
struct SharedGpio(Arc<MemGpio>);

impl GpioDriver for SharedGpio {
    fn set(&self, pin: u32, level: PinLevel) -> anyhow::Result<()> {
        self.0.set(pin, level)
    }
}

/// Find a currently-free TCP port by binding to :0 and releasing.
pub fn free_tcp_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A PTY pair standing in for a USB-serial device node. The slave side is
/// a real tty, so termios setup in the proxy works against it; the master
/// side plays the firmware. The master is non-blocking so tests can poll
/// it from a single-threaded runtime.
pub struct FakePty {
    pub master: std::fs::File,
    _slave: std::os::fd::OwnedFd,
    pub path: std::path::PathBuf,
}

pub fn fake_pty() -> anyhow::Result<FakePty> {
    use std::os::fd::AsRawFd;

    let pty = nix::pty::openpty(None, None)?;
    let path = std::fs::read_link(format!("/proc/self/fd/{}", pty.slave.as_raw_fd()))?;
    let flags = rustix::fs::fcntl_getfl(&pty.master)?;
    rustix::fs::fcntl_setfl(&pty.master, flags | rustix::fs::OFlags::NONBLOCK)?;
    Ok(FakePty { master: std::fs::File::from(pty.master), _slave: pty.slave, path })
}
