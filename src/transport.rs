//! Serial transport used by the master, scanner and monitor.
//!
//! The engine only talks to the bus through the [`Transport`] trait: open and
//! close, a count of waiting bytes, non-blocking reads of what is buffered,
//! writes, and a monotonic clock with a sleep. All waiting happens in the calling
//! loops through [`Transport::sleep`], which lets tests drive the engine with a
//! virtual clock.
//!
//! [`SerialTransport`] implements the trait on top of `tokio-serial`.

use crate::{error::Error, error::Result, protocol::BaudRate};
use log::*;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tokio_serial::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

/// The parity used when nothing else is configured.
pub const PARITY: &Parity = &Parity::None;
/// The number of stop bits used when nothing else is configured.
pub const STOP_BITS: &StopBits = &StopBits::One;
/// The number of data bits used when nothing else is configured.
pub const DATA_BITS: &DataBits = &DataBits::Eight;
/// Read and write timeout used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Time a freshly opened port gets to settle before its buffers are cleared.
const OPEN_SETTLE_TIME: Duration = Duration::from_millis(100);

/// Immutable serial line configuration.
///
/// A value is created once per connection attempt. Reconnecting with other
/// settings means building a new value with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    port: String,
    baud_rate: BaudRate,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    timeout: Duration,
    write_timeout: Duration,
    xonxoff: bool,
    rtscts: bool,
    dsrdtr: bool,
    receive_only: bool,
}

impl SerialConfig {
    /// 8N1 without flow control and a two second timeout.
    pub fn new(port: impl Into<String>, baud_rate: BaudRate) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: *DATA_BITS,
            parity: *PARITY,
            stop_bits: *STOP_BITS,
            timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            xonxoff: false,
            rtscts: false,
            dsrdtr: false,
            receive_only: false,
        }
    }

    /// Receive-only listening posture: no flow control, RTS and DTR held low.
    pub fn passive(port: impl Into<String>, baud_rate: BaudRate, timeout: Duration) -> Self {
        Self {
            receive_only: true,
            ..Self::new(port, baud_rate).with_timeout(timeout)
        }
    }

    pub fn with_baud_rate(self, baud_rate: BaudRate) -> Self {
        Self { baud_rate, ..self }
    }

    /// Sets both the read and the write timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout,
            write_timeout: timeout,
            ..self
        }
    }

    pub fn with_write_timeout(self, write_timeout: Duration) -> Self {
        Self {
            write_timeout,
            ..self
        }
    }

    pub fn with_framing(self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
        Self {
            data_bits,
            parity,
            stop_bits,
            ..self
        }
    }

    pub fn with_flow_control(self, xonxoff: bool, rtscts: bool, dsrdtr: bool) -> Self {
        Self {
            xonxoff,
            rtscts,
            dsrdtr,
            ..self
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.baud_rate
    }

    pub fn data_bits(&self) -> DataBits {
        self.data_bits
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }

    /// Overall response timeout, also the read timeout of the port.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn xonxoff(&self) -> bool {
        self.xonxoff
    }

    pub fn rtscts(&self) -> bool {
        self.rtscts
    }

    pub fn dsrdtr(&self) -> bool {
        self.dsrdtr
    }

    pub fn is_receive_only(&self) -> bool {
        self.receive_only
    }

    /// Silence that ends a frame at the configured baud rate.
    pub fn inter_frame_timeout(&self) -> Duration {
        self.baud_rate.inter_frame_timeout()
    }

    /// Flow control as understood by the serial driver. Hardware handshake wins
    /// over software handshake; DSR/DTR has no driver equivalent.
    pub fn flow_control(&self) -> FlowControl {
        if self.rtscts {
            FlowControl::Hardware
        } else if self.xonxoff {
            FlowControl::Software
        } else {
            FlowControl::None
        }
    }
}

/// Creates a `tokio_serial::SerialPortBuilder` from a [`SerialConfig`].
pub fn serial_port_builder(config: &SerialConfig) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(config.port(), config.baud_rate().into())
        .parity(config.parity())
        .stop_bits(config.stop_bits())
        .data_bits(config.data_bits())
        .flow_control(config.flow_control())
        .timeout(config.timeout())
}

/// Byte stream capability consumed by the Modbus engine.
pub trait Transport: Send {
    /// Opens the line with `config`, closing a previously open line first.
    fn open(&mut self, config: &SerialConfig) -> Result<()>;

    /// Closes the line. Closing a closed line does nothing.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Number of received bytes waiting to be read.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Reads up to `max` of the waiting bytes without waiting for more.
    fn read(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Writes and flushes `bytes`, bounded by the write timeout.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Drops everything received so far.
    fn clear_input(&mut self) -> Result<()>;

    /// Monotonic clock used for all timing decisions.
    fn now(&self) -> Instant;

    fn sleep(&mut self, duration: Duration);
}

/// [`Transport`] over a real serial port.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
    write_timeout: Duration,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(Error::NotConnected)
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port.as_ref().and_then(|port| port.name()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, config: &SerialConfig) -> Result<()> {
        self.close();
        if config.dsrdtr() {
            warn!("DSR/DTR flow control is not supported by the serial driver, ignored");
        }
        let mut port = serial_port_builder(config).open()?;
        std::thread::sleep(OPEN_SETTLE_TIME);
        port.clear(ClearBuffer::All)?;
        if config.is_receive_only() {
            port.write_request_to_send(false)?;
            port.write_data_terminal_ready(false)?;
        }
        self.timeout = config.timeout();
        self.write_timeout = config.write_timeout();
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            debug!("Closing serial port {:?}", port.name());
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        let port = self.port()?;
        let waiting = (port.bytes_to_read()? as usize).min(max);
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; waiting];
        let read = match port.read(&mut buffer) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(err) => return Err(err.into()),
        };
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let (timeout, write_timeout) = (self.timeout, self.write_timeout);
        let port = self.port()?;
        port.set_timeout(write_timeout)?;
        let written = port.write_all(bytes).and_then(|()| port.flush());
        port.set_timeout(timeout)?;
        Ok(written?)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.port()?.clear(ClearBuffer::Input)?)
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A serial port as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    pub port: String,
    pub description: String,
    pub hwid: String,
    pub manufacturer: String,
}

impl From<tokio_serial::SerialPortInfo> for PortInfo {
    fn from(info: tokio_serial::SerialPortInfo) -> Self {
        let (description, hwid, manufacturer) = match info.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => (
                usb.product.unwrap_or_else(|| String::from("USB Serial Device")),
                format!(
                    "USB VID:PID={:04X}:{:04X} SER={}",
                    usb.vid,
                    usb.pid,
                    usb.serial_number.as_deref().unwrap_or("")
                ),
                usb.manufacturer.unwrap_or_else(|| String::from("Unknown")),
            ),
            tokio_serial::SerialPortType::PciPort => (
                String::from("PCI Serial Port"),
                String::from("PCI"),
                String::from("Unknown"),
            ),
            tokio_serial::SerialPortType::BluetoothPort => (
                String::from("Bluetooth Serial Port"),
                String::from("BLUETOOTH"),
                String::from("Unknown"),
            ),
            tokio_serial::SerialPortType::Unknown => (
                String::from("n/a"),
                String::from("n/a"),
                String::from("Unknown"),
            ),
        };
        Self {
            port: info.port_name,
            description,
            hwid,
            manufacturer,
        }
    }
}

/// Description keywords of common USB to RS485 adapters.
const RS485_KEYWORDS: [&str; 7] = ["RS485", "RS-485", "USB-485", "SERIAL", "FTDI", "CH340", "CP210"];

impl PortInfo {
    /// `true` if the description suggests an RS485 adapter.
    pub fn looks_like_rs485(&self) -> bool {
        let description = self.description.to_uppercase();
        RS485_KEYWORDS
            .iter()
            .any(|keyword| description.contains(keyword))
    }
}

/// Lists all serial ports of the system.
pub fn list_available_ports() -> Result<Vec<PortInfo>> {
    Ok(tokio_serial::available_ports()?
        .into_iter()
        .map(PortInfo::from)
        .collect())
}

/// Lists the ports that might be RS485 adapters.
pub fn find_rs485_ports() -> Result<Vec<PortInfo>> {
    Ok(list_available_ports()?
        .into_iter()
        .filter(PortInfo::looks_like_rs485)
        .collect())
}

/// Picks the first RS485-looking port, falling back to the first port at all.
pub fn auto_detect_port() -> Result<String> {
    select_port(list_available_ports()?)
}

fn select_port(ports: Vec<PortInfo>) -> Result<String> {
    if let Some(port) = ports.iter().find(|port| port.looks_like_rs485()) {
        info!("Found potential RS485 adapter: {}", port.port);
        return Ok(port.port.clone());
    }
    match ports.into_iter().next() {
        Some(port) => {
            warn!(
                "No RS485 adapter found, using first available: {}",
                port.port
            );
            Ok(port.port)
        }
        None => Err(Error::NoPortFound),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;

    fn port(name: &str, description: &str) -> PortInfo {
        PortInfo {
            port: name.to_string(),
            description: description.to_string(),
            hwid: String::from("n/a"),
            manufacturer: String::from("Unknown"),
        }
    }

    #[test]
    fn serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyUSB0", BaudRate::B19200);
        assert_eq!(config.port(), "/dev/ttyUSB0");
        assert_eq!(config.baud_rate(), BaudRate::B19200);
        assert_eq!(config.data_bits(), DataBits::Eight);
        assert_eq!(config.parity(), Parity::None);
        assert_eq!(config.stop_bits(), StopBits::One);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.flow_control(), FlowControl::None);
        assert!(!config.is_receive_only());
    }

    #[test]
    fn serial_config_builders_produce_new_values() {
        let base = SerialConfig::new("COM3", BaudRate::B9600);
        let faster = base.clone().with_baud_rate(BaudRate::B115200);
        assert_eq!(base.baud_rate(), BaudRate::B9600);
        assert_eq!(faster.baud_rate(), BaudRate::B115200);

        let hardware = base.clone().with_flow_control(true, true, false);
        assert_eq!(hardware.flow_control(), FlowControl::Hardware);
        let software = base.with_flow_control(true, false, false);
        assert_eq!(software.flow_control(), FlowControl::Software);

        let passive = SerialConfig::passive("COM3", BaudRate::B9600, Duration::from_secs(1));
        assert!(passive.is_receive_only());
        assert_eq!(passive.flow_control(), FlowControl::None);
        assert_eq!(passive.write_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn rs485_port_selection() {
        assert!(port("COM4", "USB-SERIAL CH340 (COM4)").looks_like_rs485());
        assert!(port("/dev/ttyUSB0", "FT232R USB UART - FTDI").looks_like_rs485());
        assert!(!port("/dev/ttyACM0", "Arduino Uno").looks_like_rs485());

        let ports = vec![port("COM1", "Communications Port"), port("COM7", "USB-485 Adapter")];
        assert_eq!(select_port(ports).unwrap(), "COM7");

        let ports = vec![port("COM1", "Communications Port")];
        assert_eq!(select_port(ports).unwrap(), "COM1");

        assert!(matches!(select_port(Vec::new()), Err(Error::NoPortFound)));
    }

    #[test]
    fn fake_transport_delivers_on_virtual_time() {
        let mut transport = FakeTransport::with_responder(|request| Some(request.to_vec()));
        assert!(matches!(transport.bytes_available(), Err(Error::NotConnected)));

        transport
            .open(&SerialConfig::new("fake", BaudRate::B9600))
            .unwrap();
        transport.write(&[1, 2, 3]).unwrap();
        assert_eq!(transport.bytes_available().unwrap(), 0);

        transport.sleep(fake::REPLY_LATENCY);
        assert_eq!(transport.bytes_available().unwrap(), 3);
        assert_eq!(transport.read(2).unwrap(), vec![1, 2]);
        assert_eq!(transport.read(10).unwrap(), vec![3]);
        assert_eq!(transport.elapsed(), fake::REPLY_LATENCY);
    }
}
