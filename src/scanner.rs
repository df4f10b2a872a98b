//! Device discovery across baud rates.
//!
//! The [`Scanner`] borrows a [`Master`], reconnects it at each candidate baud rate
//! and probes a range of slave IDs. Progress is reported through [`ScanEvent`]s and
//! the outcome is collected into a [`ScanReport`].
//!
//! A device can show up at more than one baud rate when it is misconfigured or
//! when noise is taken for a valid exception response. Such duplicates are kept.

use crate::{
    error::Result,
    master::Master,
    protocol::BaudRate,
    transport::{SerialConfig, Transport},
};
use log::*;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Per-request timeout used for scanning when nothing else is configured.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(200);

/// A responder found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiscoveredDevice {
    pub slave_id: u8,
    pub baud_rate: BaudRate,
    /// Name of the response classification, e.g. `Illegal Data Address`.
    pub response: String,
}

/// What to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub port: String,
    pub baud_rates: Vec<BaudRate>,
    pub slave_ids: RangeInclusive<u8>,
    pub timeout: Duration,
}

impl ScanOptions {
    /// All slave IDs at the default scan baud rates.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rates: BaudRate::DEFAULT_SCAN.to_vec(),
            slave_ids: 1..=247,
            timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

/// Progress notifications for a presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    BaudRateStarted(BaudRate),
    /// The connection could not be opened at this baud rate; it is skipped.
    BaudRateFailed { baud_rate: BaudRate, reason: String },
    Probing { slave_id: u8, total: usize },
    DeviceFound(DiscoveredDevice),
    BaudRateFinished { baud_rate: BaudRate, found: usize },
    /// Overall progress in percent of all slave ID / baud rate combinations.
    Progress(f64),
    Finished { found: usize, stopped: bool },
}

/// Result of a complete scan.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ScanReport {
    pub port: String,
    pub first_slave_id: u8,
    pub last_slave_id: u8,
    pub baud_rates: Vec<BaudRate>,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub timeout: Duration,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub started: SystemTime,
    /// `true` if the scan was stopped before all baud rates were tried.
    pub stopped: bool,
    pub devices: Vec<DiscoveredDevice>,
}

impl ScanReport {
    /// Renders the report as YAML.
    #[cfg(feature = "serde")]
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Scans a bus through a borrowed [`Master`].
pub struct Scanner<'a, T> {
    master: &'a Master<T>,
    keep_running: Arc<AtomicBool>,
}

impl<'a, T: Transport> Scanner<'a, T> {
    pub fn new(master: &'a Master<T>) -> Self {
        Self {
            master,
            keep_running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag shared with other threads; clearing it stops the scan after the
    /// current probe.
    pub fn keep_running(&self) -> Arc<AtomicBool> {
        self.keep_running.clone()
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::Relaxed)
    }

    /// Connects the master at `baud_rate`, unless it is already connected to
    /// `port` at that rate.
    pub fn configure_for_baudrate(
        &self,
        port: &str,
        baud_rate: BaudRate,
        timeout: Duration,
    ) -> Result<()> {
        if self.master.is_connected() {
            if let Some(config) = self.master.config() {
                if config.port() == port && config.baud_rate() == baud_rate {
                    return Ok(());
                }
            }
        }
        self.master
            .connect(SerialConfig::new(port, baud_rate).with_timeout(timeout))
    }

    /// Probes `slave_ids` at one baud rate.
    pub fn scan_at_baudrate(
        &self,
        port: &str,
        baud_rate: BaudRate,
        slave_ids: RangeInclusive<u8>,
        timeout: Duration,
        progress: impl FnMut(u8, usize),
    ) -> Result<Vec<DiscoveredDevice>> {
        self.configure_for_baudrate(port, baud_rate, timeout)?;
        Ok(self
            .master
            .scan_slaves_while(slave_ids, progress, &self.keep_running)
            .into_iter()
            .map(|(slave_id, response)| DiscoveredDevice {
                slave_id,
                baud_rate,
                response: response.exception_name(),
            })
            .collect())
    }

    /// Runs a full scan over all baud rates of `options`.
    pub fn scan(&self, options: &ScanOptions, mut on_event: impl FnMut(ScanEvent)) -> ScanReport {
        let started = SystemTime::now();
        let per_baud_rate = options.slave_ids.clone().count();
        let total = options.baud_rates.len() * per_baud_rate;
        let mut completed = 0;
        let mut devices = Vec::new();

        info!(
            "Scanning {} for slave IDs {}-{} at {:?}",
            options.port,
            options.slave_ids.start(),
            options.slave_ids.end(),
            options.baud_rates
        );

        for &baud_rate in &options.baud_rates {
            if !self.is_running() {
                break;
            }
            on_event(ScanEvent::BaudRateStarted(baud_rate));

            let found = self.scan_at_baudrate(
                &options.port,
                baud_rate,
                options.slave_ids.clone(),
                options.timeout,
                |slave_id, total| on_event(ScanEvent::Probing { slave_id, total }),
            );
            match found {
                Ok(found) => {
                    on_event(ScanEvent::BaudRateFinished {
                        baud_rate,
                        found: found.len(),
                    });
                    for device in found {
                        on_event(ScanEvent::DeviceFound(device.clone()));
                        devices.push(device);
                    }
                }
                Err(err) => {
                    warn!("Skipping {baud_rate} baud: {err}");
                    on_event(ScanEvent::BaudRateFailed {
                        baud_rate,
                        reason: err.to_string(),
                    });
                }
            }

            completed += per_baud_rate;
            if total > 0 {
                on_event(ScanEvent::Progress(completed as f64 * 100.0 / total as f64));
            }
        }

        let stopped = !self.is_running();
        on_event(ScanEvent::Finished {
            found: devices.len(),
            stopped,
        });
        ScanReport {
            port: options.port.clone(),
            first_slave_id: *options.slave_ids.start(),
            last_slave_id: *options.slave_ids.end(),
            baud_rates: options.baud_rates.clone(),
            timeout: options.timeout,
            started,
            stopped,
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::append_crc;
    use crate::transport::fake::FakeTransport;
    use assert_matches::assert_matches;

    /// A bus with slave 3 at 19200 baud; at any other rate every probe times out.
    fn bus() -> (Master<FakeTransport>, Arc<std::sync::Mutex<Option<BaudRate>>>) {
        let current = Arc::new(std::sync::Mutex::new(None::<BaudRate>));
        let baud = current.clone();
        let transport = FakeTransport::with_responder(move |request| {
            let at_19200 = *baud.lock().unwrap() == Some(BaudRate::B19200);
            (at_19200 && request[0] == 3).then(|| append_crc(vec![3, 0x83, 0x02]))
        });
        (Master::new(transport), current)
    }

    fn options() -> ScanOptions {
        ScanOptions {
            port: String::from("fake"),
            baud_rates: vec![BaudRate::B9600, BaudRate::B19200],
            slave_ids: 1..=4,
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn configure_skips_reconnect_on_same_settings() {
        let (master, _) = bus();
        let scanner = Scanner::new(&master);
        let timeout = Duration::from_millis(50);
        scanner
            .configure_for_baudrate("fake", BaudRate::B9600, timeout)
            .unwrap();
        scanner
            .configure_for_baudrate("fake", BaudRate::B9600, timeout)
            .unwrap();
        scanner
            .configure_for_baudrate("fake", BaudRate::B19200, timeout)
            .unwrap();
        drop(scanner);

        let transport = master.into_transport();
        let bauds: Vec<BaudRate> = transport
            .opened_with
            .iter()
            .map(|config| config.baud_rate())
            .collect();
        assert_eq!(bauds, vec![BaudRate::B9600, BaudRate::B19200]);
        assert_eq!(transport.opened_with[0].timeout(), timeout);
    }

    #[test]
    fn scan_tags_devices_with_baud_rate() {
        let (master, current) = bus();
        let scanner = Scanner::new(&master);
        let mut events = Vec::new();
        let report = scanner.scan(&options(), |event| {
            if let ScanEvent::BaudRateStarted(baud_rate) = event {
                *current.lock().unwrap() = Some(baud_rate);
            }
            events.push(event);
        });

        assert_eq!(
            report.devices,
            vec![DiscoveredDevice {
                slave_id: 3,
                baud_rate: BaudRate::B19200,
                response: String::from("Illegal Data Address"),
            }]
        );
        assert!(!report.stopped);
        assert_eq!((report.first_slave_id, report.last_slave_id), (1, 4));

        let probes = events
            .iter()
            .filter(|event| matches!(event, ScanEvent::Probing { total: 4, .. }))
            .count();
        assert_eq!(probes, 8);
        assert!(events.contains(&ScanEvent::BaudRateFinished {
            baud_rate: BaudRate::B9600,
            found: 0
        }));
        assert!(events.contains(&ScanEvent::Progress(50.0)));
        assert_eq!(
            events.last(),
            Some(&ScanEvent::Finished {
                found: 1,
                stopped: false
            })
        );
    }

    #[test]
    fn stop_request_ends_scan() {
        let (master, _) = bus();
        let scanner = Scanner::new(&master);
        let keep_running = scanner.keep_running();
        let mut probed = Vec::new();
        let report = scanner.scan(&options(), |event| {
            if let ScanEvent::Probing { slave_id, .. } = event {
                probed.push(slave_id);
                if slave_id == 2 {
                    keep_running.store(false, Ordering::Relaxed);
                }
            }
        });
        assert_eq!(probed, vec![1, 2]);
        assert!(report.stopped);
        assert!(report.devices.is_empty());
    }

    #[test]
    fn unavailable_port_skips_baud_rate() {
        let mut transport = FakeTransport::silent();
        transport.refuse_open = true;
        let master = Master::new(transport);
        let scanner = Scanner::new(&master);
        let mut events = Vec::new();
        let report = scanner.scan(&options(), |event| events.push(event));

        assert!(report.devices.is_empty());
        assert_matches!(
            events[1],
            ScanEvent::BaudRateFailed {
                baud_rate: BaudRate::B9600,
                ..
            }
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn report_as_yaml() {
        let report = ScanReport {
            port: String::from("/dev/ttyUSB0"),
            first_slave_id: 1,
            last_slave_id: 10,
            baud_rates: vec![BaudRate::B9600],
            timeout: Duration::from_millis(200),
            started: SystemTime::UNIX_EPOCH,
            stopped: false,
            devices: vec![DiscoveredDevice {
                slave_id: 7,
                baud_rate: BaudRate::B9600,
                response: String::from("Illegal Data Address"),
            }],
        };
        let yaml = report.to_yaml().unwrap();
        assert!(yaml.contains("port: /dev/ttyUSB0"));
        assert!(yaml.contains("timeout: 200ms"));
        assert!(yaml.contains("slave_id: 7"));
        assert!(yaml.contains("response: Illegal Data Address"));
    }
}
