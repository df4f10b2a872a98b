//! Modbus RTU master.
//!
//! [`Master`] serializes every request/response cycle on its transport behind a
//! single lock, so two operations on the same connection never interleave their
//! bytes. Expected failures (timeouts, CRC errors, exception responses) are
//! reported as values, never as hard errors.
//!
//! ## Example
//!
//! ```no_run
//! use rs485_lib::{
//!     master::Master,
//!     protocol::BaudRate,
//!     transport::{SerialConfig, SerialTransport},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let master = Master::new(SerialTransport::new());
//!     master.connect(SerialConfig::new("/dev/ttyUSB0", BaudRate::B9600))?;
//!
//!     let registers = master.read_holding_registers(1, 0, 4)?;
//!     println!("Registers: {registers:?}");
//!     println!("Success rate: {:.1}%", master.statistics().success_rate());
//!     Ok(())
//! }
//! ```

use crate::{
    error::{Error, Result},
    frame::{self, ModbusResponse, Outcome, PayloadError},
    protocol::{self as proto, ExceptionCode, FunctionCode},
    transport::{SerialConfig, Transport},
};
use log::*;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Register address used to provoke an "Illegal Data Address" reply.
pub const PROBE_ADDRESS: u16 = 0xFFFF;
/// Pause between two probes of a scan.
pub const SCAN_DELAY: Duration = Duration::from_millis(10);
/// Pause after draining the input buffer before a request goes out.
const PRE_REQUEST_SETTLE: Duration = Duration::from_millis(5);
/// Pause after closing a port before it is opened again.
const REOPEN_DELAY: Duration = Duration::from_millis(100);
/// Polling interval of the receive loop.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Addresses tried by [`Master::test_communication`].
pub const QUICK_TEST_ADDRESSES: [u16; 5] = [0, 1, 2048, 40001, 30001];
/// Addresses tried by [`Master::test_comprehensive_communication`].
pub const COMPREHENSIVE_TEST_ADDRESSES: [u16; 8] = [0, 1, 100, 1000, 2048, 2051, 40001, 30001];

/// Why a request did not produce the expected data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Request timeout")]
    Timeout,
    #[error("CRC error in response")]
    Crc,
    #[error("Modbus exception: {}", .0.name())]
    Exception(ExceptionCode),
    #[error("Invalid response data")]
    InvalidData,
    #[error("Incomplete register data")]
    IncompleteData,
    /// The request itself was invalid and was never sent.
    #[error(transparent)]
    Protocol(#[from] proto::Error),
}

impl From<PayloadError> for RequestError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Empty => Self::InvalidData,
            PayloadError::Incomplete => Self::IncompleteData,
        }
    }
}

/// Communication counters, accumulated until [`Master::reset_statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Statistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub exceptions: u64,
}

impl Statistics {
    /// Responses per request in percent, `0.0` before the first request.
    pub fn success_rate(&self) -> f64 {
        percent(self.responses_received, self.requests_sent)
    }

    /// Timeouts and CRC errors per request in percent, `0.0` before the first request.
    pub fn error_rate(&self) -> f64 {
        percent(self.timeouts + self.crc_errors, self.requests_sent)
    }

    fn record(&mut self, response: &ModbusResponse) {
        match response.outcome() {
            Outcome::Timeout => self.timeouts += 1,
            Outcome::CrcError => self.crc_errors += 1,
            Outcome::Exception(_) => {
                self.responses_received += 1;
                self.exceptions += 1;
            }
            Outcome::Data(_) => self.responses_received += 1,
        }
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 * 100.0) / total as f64
    }
}

/// One register that answered during a communication test.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegisterSample {
    pub address: u16,
    pub value: u16,
    pub response_time: Duration,
}

/// Outcome of [`Master::test_comprehensive_communication`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CommunicationReport {
    pub holding_registers: Vec<RegisterSample>,
    pub input_registers: Vec<RegisterSample>,
    pub failed_addresses: Vec<u16>,
}

impl CommunicationReport {
    pub fn success_count(&self) -> usize {
        self.holding_registers.len() + self.input_registers.len()
    }

    pub fn is_success(&self) -> bool {
        self.success_count() > 0
    }

    /// Mean response time of all successful reads.
    pub fn average_response_time(&self) -> Option<Duration> {
        let count = self.success_count();
        if count == 0 {
            return None;
        }
        let total: Duration = self
            .holding_registers
            .iter()
            .chain(&self.input_registers)
            .map(|sample| sample.response_time)
            .sum();
        Some(total / count as u32)
    }
}

/// A register changed by [`Master::block_read_modify_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterChange {
    pub address: u16,
    pub old_value: u16,
    pub new_value: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockWriteError {
    #[error("No register updates specified")]
    Empty,
    #[error("Registers {start} to {end} do not fit into one block write")]
    SpanTooLarge { start: u16, end: u16 },
    #[error("Failed to read current values: {0}")]
    Read(RequestError),
    #[error("Block write failed: {0}")]
    Write(RequestError),
}

/// Reasons to refuse a new slave ID / baud rate pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Slave ID must be between {} and {}", proto::SlaveId::MIN, proto::SlaveId::MAX)]
    SlaveIdOutOfRange(u8),
    #[error("Baud rate must be between 300 and 1,000,000")]
    BaudRateOutOfRange(u32),
    #[error("Slave ID {0} appears to already be in use")]
    SlaveIdInUse(u8),
}

/// Accepted range for a baud rate written into a device.
pub const CONFIGURABLE_BAUD_RATES: RangeInclusive<u32> = 300..=1_000_000;

struct Link<T> {
    transport: T,
    config: Option<SerialConfig>,
    connected: bool,
}

/// Modbus RTU master on top of a [`Transport`].
pub struct Master<T> {
    link: Mutex<Link<T>>,
    stats: Mutex<Statistics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Master<T> {
    /// Creates a disconnected master.
    pub fn new(transport: T) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                config: None,
                connected: false,
            }),
            stats: Mutex::new(Statistics::default()),
        }
    }

    /// Opens the transport with `config`, closing an open connection first.
    pub fn connect(&self, config: SerialConfig) -> Result<()> {
        let mut link = lock(&self.link);
        link.config = Some(config);
        Self::open(&mut link)
    }

    /// Opens the transport again with the last configuration.
    pub fn reconnect(&self) -> Result<()> {
        let mut link = lock(&self.link);
        Self::open(&mut link)
    }

    fn open(link: &mut Link<T>) -> Result<()> {
        let config = link.config.clone().ok_or(Error::NoConfiguration)?;
        if link.transport.is_open() {
            link.transport.close();
            link.transport.sleep(REOPEN_DELAY);
        }
        link.connected = false;
        match link
            .transport
            .open(&config)
            .and_then(|()| link.transport.clear_input())
        {
            Ok(()) => {
                link.connected = true;
                info!(
                    "Connected to {} at {} baud",
                    config.port(),
                    config.baud_rate()
                );
                Ok(())
            }
            Err(err) => {
                error!("Failed to connect to {}: {err}", config.port());
                link.transport.close();
                Err(err)
            }
        }
    }

    pub fn disconnect(&self) {
        let mut link = lock(&self.link);
        if link.connected {
            link.transport.close();
            if let Some(config) = &link.config {
                info!("Disconnected from {}", config.port());
            }
        }
        link.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).connected
    }

    /// The configuration of the current (or last) connection.
    pub fn config(&self) -> Option<SerialConfig> {
        lock(&self.link).config.clone()
    }

    /// Gives the transport back, closing it.
    pub fn into_transport(self) -> T {
        let mut link = self.link.into_inner().unwrap_or_else(PoisonError::into_inner);
        link.transport.close();
        link.transport
    }

    /// A copy of the communication counters.
    pub fn statistics(&self) -> Statistics {
        *lock(&self.stats)
    }

    pub fn reset_statistics(&self) {
        *lock(&self.stats) = Statistics::default();
    }

    /// Sends a complete frame and waits for the response.
    ///
    /// Never fails: a closed connection or a transport error yields a timeout
    /// response. Nothing is sent or counted while disconnected.
    pub fn send_frame(&self, frame: &[u8]) -> ModbusResponse {
        let mut link = lock(&self.link);
        let config = match (&link.config, link.connected) {
            (Some(config), true) => config.clone(),
            _ => return ModbusResponse::timeout(),
        };

        debug!("TX {}", frame::to_hex(frame));
        lock(&self.stats).requests_sent += 1;
        let received = Self::transmit(&mut link.transport, frame)
            .and_then(|()| Self::read_response(&mut link.transport, &config));
        drop(link);

        let response = match received {
            Ok(Some(bytes)) => {
                debug!("RX {}", frame::to_hex(&bytes));
                frame::parse_response(&bytes)
            }
            Ok(None) => ModbusResponse::timeout(),
            Err(err) => {
                error!("Communication error: {err}");
                ModbusResponse::timeout()
            }
        };
        lock(&self.stats).record(&response);
        response
    }

    fn transmit(transport: &mut T, frame: &[u8]) -> Result<()> {
        transport.clear_input()?;
        transport.sleep(PRE_REQUEST_SETTLE);
        transport.write(frame)
    }

    /// Collects one response frame.
    ///
    /// Stops when the completeness predicate is satisfied, when the line has been
    /// silent for the inter-frame timeout after data arrived, or when the overall
    /// timeout expires. Data arriving after such a silence belongs to another frame
    /// and is dropped.
    fn read_response(transport: &mut T, config: &SerialConfig) -> Result<Option<Vec<u8>>> {
        let frame_timeout = config.inter_frame_timeout();
        let start = transport.now();
        let mut last_byte = start;
        let mut buffer = Vec::new();

        while transport.now().duration_since(start) < config.timeout() {
            let waiting = transport.bytes_available()?;
            let chunk = if waiting > 0 {
                transport.read(waiting)?
            } else {
                Vec::new()
            };
            let gap = transport.now().duration_since(last_byte);
            if chunk.is_empty() {
                if !buffer.is_empty() && gap > frame_timeout {
                    break;
                }
                transport.sleep(POLL_INTERVAL);
                continue;
            }
            if !buffer.is_empty() && gap > frame_timeout {
                break;
            }
            buffer.extend_from_slice(&chunk);
            last_byte = transport.now();
            if frame::is_complete_frame(&buffer) {
                break;
            }
        }
        Ok((!buffer.is_empty()).then_some(buffer))
    }

    fn check(response: &ModbusResponse) -> std::result::Result<(), RequestError> {
        match response.outcome() {
            Outcome::Timeout => Err(RequestError::Timeout),
            Outcome::CrcError => Err(RequestError::Crc),
            Outcome::Exception(code) => Err(RequestError::Exception(*code)),
            Outcome::Data(_) => Ok(()),
        }
    }

    fn read_payload(
        &self,
        slave_id: u8,
        function: FunctionCode,
        start: u16,
        count: u16,
        limit: u16,
    ) -> std::result::Result<Vec<u8>, RequestError> {
        if count == 0 || count > limit {
            return Err(proto::Error::QuantityOutOfRange(count).into());
        }
        let response = self.send_frame(&frame::read_request(slave_id, function, start, count));
        Self::check(&response)?;
        match response.data() {
            Some(data) if !data.is_empty() => Ok(data.to_vec()),
            _ => Err(RequestError::InvalidData),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> std::result::Result<(), RequestError> {
        Self::check(&self.send_frame(frame))
    }

    /// Reads holding registers (function `0x03`).
    pub fn read_holding_registers(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, RequestError> {
        let data = self.read_payload(
            slave_id,
            FunctionCode::ReadHoldingRegisters,
            start,
            count,
            frame::MAX_READ_REGISTERS,
        )?;
        Ok(frame::decode_registers(&data)?)
    }

    /// Reads input registers (function `0x04`).
    pub fn read_input_registers(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, RequestError> {
        let data = self.read_payload(
            slave_id,
            FunctionCode::ReadInputRegisters,
            start,
            count,
            frame::MAX_READ_REGISTERS,
        )?;
        Ok(frame::decode_registers(&data)?)
    }

    /// Reads coils (function `0x01`).
    pub fn read_coils(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<bool>, RequestError> {
        let data = self.read_payload(
            slave_id,
            FunctionCode::ReadCoils,
            start,
            count,
            frame::MAX_READ_COILS,
        )?;
        Ok(frame::decode_bits(&data, count)?)
    }

    /// Reads discrete inputs (function `0x02`).
    pub fn read_discrete_inputs(
        &self,
        slave_id: u8,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<bool>, RequestError> {
        let data = self.read_payload(
            slave_id,
            FunctionCode::ReadDiscreteInputs,
            start,
            count,
            frame::MAX_READ_COILS,
        )?;
        Ok(frame::decode_bits(&data, count)?)
    }

    /// Writes one holding register (function `0x06`).
    pub fn write_single_register(
        &self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> std::result::Result<(), RequestError> {
        self.write_frame(&frame::write_single_register_request(slave_id, address, value))
    }

    /// Writes consecutive holding registers (function `0x10`).
    pub fn write_multiple_registers(
        &self,
        slave_id: u8,
        start: u16,
        values: &[u16],
    ) -> std::result::Result<(), RequestError> {
        self.write_frame(&frame::write_multiple_registers_request(
            slave_id, start, values,
        )?)
    }

    /// Switches one coil (function `0x05`).
    pub fn write_single_coil(
        &self,
        slave_id: u8,
        address: u16,
        on: bool,
    ) -> std::result::Result<(), RequestError> {
        self.write_frame(&frame::write_single_coil_request(slave_id, address, on))
    }

    /// Switches consecutive coils (function `0x0F`).
    pub fn write_multiple_coils(
        &self,
        slave_id: u8,
        start: u16,
        coils: &[bool],
    ) -> std::result::Result<(), RequestError> {
        self.write_frame(&frame::write_multiple_coils_request(slave_id, start, coils)?)
    }

    /// Probes a device with a read of [`PROBE_ADDRESS`].
    ///
    /// A present device is expected to answer with "Illegal Data Address", which
    /// proves its existence without knowing any of its registers.
    pub fn probe_device(&self, slave_id: u8) -> ModbusResponse {
        self.probe_device_at(slave_id, PROBE_ADDRESS)
    }

    pub fn probe_device_at(&self, slave_id: u8, test_address: u16) -> ModbusResponse {
        self.send_frame(&frame::read_request(
            slave_id,
            FunctionCode::ReadHoldingRegisters,
            test_address,
            1,
        ))
    }

    /// Probes every slave ID of `range` and collects the responders.
    ///
    /// `progress` is called with the slave ID about to be probed and the size of
    /// the range.
    pub fn scan_slaves(
        &self,
        range: RangeInclusive<u8>,
        progress: impl FnMut(u8, usize),
    ) -> Vec<(u8, ModbusResponse)> {
        self.scan_slaves_while(range, progress, &AtomicBool::new(true))
    }

    /// Like [`Master::scan_slaves`], stopping early once `keep_running` is cleared.
    ///
    /// Any valid response counts, exceptions included. Devices are keyed by the
    /// slave ID they report, so a device answering for several IDs appears once.
    pub fn scan_slaves_while(
        &self,
        range: RangeInclusive<u8>,
        mut progress: impl FnMut(u8, usize),
        keep_running: &AtomicBool,
    ) -> Vec<(u8, ModbusResponse)> {
        let total = range.clone().count();
        let mut found: Vec<(u8, ModbusResponse)> = Vec::new();

        for slave_id in range {
            if !keep_running.load(Ordering::Relaxed) {
                debug!("Scan stopped before slave ID {slave_id}");
                break;
            }
            progress(slave_id, total);

            let response = self.probe_device(slave_id);
            if let (true, Some(reported)) = (response.is_valid(), response.slave_id()) {
                if found.iter().all(|(id, _)| *id != reported) {
                    info!("Found device at slave ID {reported}");
                    found.push((reported, response));
                }
            }
            self.pause(SCAN_DELAY);
        }
        found
    }

    /// Sleeps on the transport clock while holding the line.
    pub fn pause(&self, duration: Duration) {
        lock(&self.link).transport.sleep(duration);
    }

    /// Tries a few common register addresses until one of them can be read.
    pub fn test_communication(&self, slave_id: u8) -> bool {
        QUICK_TEST_ADDRESSES.into_iter().any(|address| {
            if self.read_holding_registers(slave_id, address, 1).is_ok() {
                debug!("Communication test successful with slave {slave_id} at holding register {address}");
                return true;
            }
            if self.read_input_registers(slave_id, address, 1).is_ok() {
                debug!("Communication test successful with slave {slave_id} at input register {address}");
                return true;
            }
            false
        })
    }

    /// Reads each of [`COMPREHENSIVE_TEST_ADDRESSES`], falling back to input
    /// registers where the holding register read fails.
    pub fn test_comprehensive_communication(&self, slave_id: u8) -> CommunicationReport {
        let mut report = CommunicationReport::default();
        for address in COMPREHENSIVE_TEST_ADDRESSES {
            let (result, response_time) =
                self.timed(|master| master.read_holding_registers(slave_id, address, 1));
            if let Some(value) = result.ok().and_then(|values| values.first().copied()) {
                report.holding_registers.push(RegisterSample {
                    address,
                    value,
                    response_time,
                });
                continue;
            }
            let (result, response_time) =
                self.timed(|master| master.read_input_registers(slave_id, address, 1));
            match result.ok().and_then(|values| values.first().copied()) {
                Some(value) => report.input_registers.push(RegisterSample {
                    address,
                    value,
                    response_time,
                }),
                None => report.failed_addresses.push(address),
            }
        }
        report
    }

    fn timed<R>(&self, operation: impl FnOnce(&Self) -> R) -> (R, Duration) {
        let start = lock(&self.link).transport.now();
        let result = operation(self);
        let end = lock(&self.link).transport.now();
        (result, end.duration_since(start))
    }

    /// Reads the block of holding registers covering `updates`, patches it and
    /// writes it back in one request.
    pub fn block_read_modify_write(
        &self,
        slave_id: u8,
        updates: &BTreeMap<u16, u16>,
    ) -> std::result::Result<Vec<RegisterChange>, BlockWriteError> {
        let (Some(&start), Some(&end)) = (updates.keys().next(), updates.keys().next_back())
        else {
            return Err(BlockWriteError::Empty);
        };
        let count = u16::try_from(u32::from(end) - u32::from(start) + 1)
            .ok()
            .filter(|count| *count <= frame::MAX_WRITE_REGISTERS)
            .ok_or(BlockWriteError::SpanTooLarge { start, end })?;
        let mut values = self
            .read_holding_registers(slave_id, start, count)
            .map_err(BlockWriteError::Read)?;

        let mut changes = Vec::with_capacity(updates.len());
        for (&address, &new_value) in updates {
            if let Some(slot) = values.get_mut((address - start) as usize) {
                changes.push(RegisterChange {
                    address,
                    old_value: *slot,
                    new_value,
                });
                *slot = new_value;
            }
        }

        self.write_multiple_registers(slave_id, start, &values)
            .map_err(BlockWriteError::Write)?;
        Ok(changes)
    }

    /// Checks a new slave ID / baud rate pair before it is written into a device.
    ///
    /// When the slave ID changes, the new ID is probed; a valid answer means the
    /// ID is taken.
    pub fn validate_configuration(
        &self,
        slave_id: u8,
        new_slave_id: u8,
        new_baud_rate: u32,
    ) -> std::result::Result<(), ValidationError> {
        if !proto::SlaveId::is_plausible(new_slave_id) {
            return Err(ValidationError::SlaveIdOutOfRange(new_slave_id));
        }
        if !CONFIGURABLE_BAUD_RATES.contains(&new_baud_rate) {
            return Err(ValidationError::BaudRateOutOfRange(new_baud_rate));
        }
        if new_slave_id != slave_id && self.probe_device(new_slave_id).is_valid() {
            return Err(ValidationError::SlaveIdInUse(new_slave_id));
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for Master<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = lock(&self.link);
        f.debug_struct("Master")
            .field("config", &link.config)
            .field("connected", &link.connected)
            .field("stats", &*lock(&self.stats))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crc::append_crc;
    use crate::protocol::BaudRate;
    use crate::transport::fake::FakeTransport;
    use assert_matches::assert_matches;
    use std::sync::{Arc, Mutex as StdMutex};

    pub(crate) fn test_config() -> SerialConfig {
        SerialConfig::new("fake", BaudRate::B9600).with_timeout(Duration::from_millis(100))
    }

    /// Simulates a device with a block of holding registers starting at 0.
    pub(crate) fn register_device(
        slave_id: u8,
        registers: Arc<StdMutex<Vec<u16>>>,
    ) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
        move |request: &[u8]| {
            if request[0] != slave_id {
                return None;
            }
            let function = request[1];
            let address = u16::from_be_bytes([request[2], request[3]]) as usize;
            let mut registers = registers.lock().unwrap();
            let reply = match function {
                0x03 | 0x04 => {
                    let count = u16::from_be_bytes([request[4], request[5]]) as usize;
                    if address + count > registers.len() {
                        vec![slave_id, function | 0x80, 0x02]
                    } else {
                        let mut reply = vec![slave_id, function, (count * 2) as u8];
                        for value in &registers[address..address + count] {
                            reply.extend_from_slice(&value.to_be_bytes());
                        }
                        reply
                    }
                }
                0x06 => {
                    registers[address] = u16::from_be_bytes([request[4], request[5]]);
                    request[..6].to_vec()
                }
                0x10 => {
                    let count = u16::from_be_bytes([request[4], request[5]]) as usize;
                    for index in 0..count {
                        let offset = 7 + index * 2;
                        registers[address + index] =
                            u16::from_be_bytes([request[offset], request[offset + 1]]);
                    }
                    request[..6].to_vec()
                }
                _ => vec![slave_id, function | 0x80, 0x01],
            };
            Some(append_crc(reply))
        }
    }

    fn connected(transport: FakeTransport) -> Master<FakeTransport> {
        let master = Master::new(transport);
        master.connect(test_config()).unwrap();
        master
    }

    #[test]
    fn read_holding_registers_round_trip() {
        let registers = Arc::new(StdMutex::new(vec![0; 200]));
        registers.lock().unwrap()[100] = 1;
        registers.lock().unwrap()[101] = 2;
        let master = connected(FakeTransport::with_responder(register_device(
            17,
            registers.clone(),
        )));

        assert_eq!(master.read_holding_registers(17, 100, 2), Ok(vec![1, 2]));
        assert_eq!(master.read_input_registers(17, 100, 1), Ok(vec![1]));

        let stats = master.statistics();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.responses_received, 2);

        let transport = master.into_transport();
        assert_eq!(
            transport.written[0],
            frame::read_request(17, FunctionCode::ReadHoldingRegisters, 100, 2)
        );
    }

    #[test]
    fn writes_reach_the_device() {
        let registers = Arc::new(StdMutex::new(vec![0; 16]));
        let master = connected(FakeTransport::with_responder(register_device(
            3,
            registers.clone(),
        )));

        assert_eq!(master.write_single_register(3, 4, 0xBEEF), Ok(()));
        assert_eq!(master.write_multiple_registers(3, 8, &[7, 8, 9]), Ok(()));
        assert_eq!(
            registers.lock().unwrap()[4..11],
            [0xBEEF, 0, 0, 0, 7, 8, 9]
        );
        assert_matches!(
            master.write_multiple_registers(3, 0, &[]),
            Err(RequestError::Protocol(proto::Error::QuantityOutOfRange(0)))
        );
    }

    #[test]
    fn error_messages() {
        let master = connected(FakeTransport::with_responder(|request| {
            Some(append_crc(vec![request[0], request[1] | 0x80, 0x02]))
        }));
        let err = master.read_holding_registers(1, 0, 1).unwrap_err();
        assert_eq!(err, RequestError::Exception(ExceptionCode::IllegalDataAddress));
        assert_eq!(err.to_string(), "Modbus exception: Illegal Data Address");

        assert_eq!(RequestError::Timeout.to_string(), "Request timeout");
        assert_eq!(RequestError::Crc.to_string(), "CRC error in response");
        assert_eq!(RequestError::InvalidData.to_string(), "Invalid response data");
        assert_eq!(
            RequestError::IncompleteData.to_string(),
            "Incomplete register data"
        );
    }

    #[test]
    fn short_payloads() {
        // byte count of 4 but only two data bytes
        let master = connected(FakeTransport::with_responder(|request| {
            Some(append_crc(vec![request[0], 0x03, 0x04, 0x00, 0x01]))
        }));
        assert_eq!(
            master.read_holding_registers(1, 0, 2),
            Err(RequestError::IncompleteData)
        );
    }

    #[test]
    fn timeout_when_silent() {
        let master = connected(FakeTransport::silent());
        assert_eq!(
            master.read_holding_registers(1, 0, 1),
            Err(RequestError::Timeout)
        );
        let stats = master.statistics();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.timeouts, 1);

        let transport = master.into_transport();
        assert!(transport.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn disconnected_master_reports_timeout() {
        let master = Master::new(FakeTransport::silent());
        assert!(master.probe_device(1).is_timeout());
        assert!(matches!(master.reconnect(), Err(Error::NoConfiguration)));

        master.connect(test_config()).unwrap();
        assert!(master.is_connected());
        master.disconnect();
        assert!(!master.is_connected());
        assert!(master.probe_device(1).is_timeout());
    }

    #[test]
    fn disconnected_master_leaves_statistics_alone() {
        let master = Master::new(FakeTransport::silent());
        assert!(master.probe_device(1).is_timeout());
        assert_eq!(master.read_holding_registers(1, 0, 1), Err(RequestError::Timeout));
        assert_eq!(master.statistics(), Statistics::default());
        assert_eq!(master.statistics().error_rate(), 0.0);
        assert!(master.into_transport().written.is_empty());
    }

    #[test]
    fn failed_connect_is_a_hard_error() {
        let mut transport = FakeTransport::silent();
        transport.refuse_open = true;
        let master = Master::new(transport);
        assert!(matches!(master.connect(test_config()), Err(Error::Io(..))));
        assert!(!master.is_connected());
    }

    #[test]
    fn late_bytes_after_a_gap_are_dropped() {
        let mut transport = FakeTransport::silent();
        // half a frame, then the rest long after the inter-frame timeout
        let frame = append_crc(vec![1, 0x03, 0x02, 0x00, 0x2A]);
        transport.schedule(Duration::from_millis(6), &frame[..3]);
        transport.schedule(Duration::from_millis(40), &frame[3..]);
        let master = connected(transport);
        // the three early bytes form a short frame, reported as a timeout
        assert_eq!(
            master.read_holding_registers(1, 0, 1),
            Err(RequestError::Timeout)
        );
    }

    fn split_reply_master(baud_rate: BaudRate) -> Master<FakeTransport> {
        let mut transport = FakeTransport::silent();
        // the request goes out at 5 ms, the reply pauses for 2 ms after three bytes
        let frame = append_crc(vec![1, 0x03, 0x02, 0x00, 0x2A]);
        transport.schedule(Duration::from_millis(6), &frame[..3]);
        transport.schedule(Duration::from_millis(8), &frame[3..]);
        let master = Master::new(transport);
        master
            .connect(SerialConfig::new("fake", baud_rate).with_timeout(Duration::from_millis(100)))
            .unwrap();
        master
    }

    #[test]
    fn fast_baud_rates_use_the_minimum_frame_gap() {
        // 2 ms is above the 1.5 ms floor used at 115200 baud
        let master = split_reply_master(BaudRate::B115200);
        assert_eq!(
            master.read_holding_registers(1, 0, 1),
            Err(RequestError::Timeout)
        );

        // but below the 4 ms gap at 9600 baud
        let master = split_reply_master(BaudRate::B9600);
        assert_eq!(master.read_holding_registers(1, 0, 1), Ok(vec![0x2A]));
    }

    #[test]
    fn statistics_rates() {
        let mut calls = 0;
        let master = connected(FakeTransport::with_responder(move |request| {
            calls += 1;
            match calls {
                1..=7 => Some(append_crc(vec![request[0], 0x03, 0x02, 0x00, 0x01])),
                8 | 9 => None,
                _ => {
                    let mut reply = append_crc(vec![request[0], 0x03, 0x02, 0x00, 0x01]);
                    reply[4] ^= 0x10;
                    Some(reply)
                }
            }
        }));
        for _ in 0..10 {
            let _ = master.read_holding_registers(1, 0, 1);
        }
        let stats = master.statistics();
        assert_eq!(
            stats,
            Statistics {
                requests_sent: 10,
                responses_received: 7,
                timeouts: 2,
                crc_errors: 1,
                exceptions: 0,
            }
        );
        assert_eq!(stats.success_rate(), 70.0);
        assert_eq!(stats.error_rate(), 30.0);

        master.reset_statistics();
        assert_eq!(master.statistics(), Statistics::default());
        assert_eq!(master.statistics().success_rate(), 0.0);
        assert_eq!(master.statistics().error_rate(), 0.0);
    }

    #[test]
    fn probe_expects_illegal_data_address() {
        let registers = Arc::new(StdMutex::new(vec![0; 4]));
        let master = connected(FakeTransport::with_responder(register_device(5, registers)));
        let response = master.probe_device(5);
        assert!(response.is_valid());
        assert!(response.is_exception());
        assert_eq!(response.exception_name(), "Illegal Data Address");
        assert_eq!(master.statistics().exceptions, 1);

        let transport = master.into_transport();
        assert_eq!(&transport.written[0][2..6], &[0xFF, 0xFF, 0x00, 0x01]);
    }

    #[test]
    fn scan_deduplicates_reported_ids() {
        let master = connected(FakeTransport::with_responder(|request| match request[0] {
            // slave 4 misreports itself as slave 2
            2 | 4 => Some(append_crc(vec![2, 0x83, 0x02])),
            _ => None,
        }));
        let mut progress = Vec::new();
        let found = master.scan_slaves(1..=5, |slave_id, total| progress.push((slave_id, total)));

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 2);
        assert!(found[0].1.is_exception());
        assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        assert_eq!(master.statistics().requests_sent, 5);
    }

    #[test]
    fn scan_ignores_crc_errors_and_stops_on_request() {
        let master = connected(FakeTransport::with_responder(|request| {
            let mut reply = append_crc(vec![request[0], 0x83, 0x02]);
            if request[0] == 1 {
                reply[2] ^= 0x01;
            }
            Some(reply)
        }));
        let found = master.scan_slaves(1..=3, |_, _| ());
        let ids: Vec<u8> = found.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3]);

        let keep_running = AtomicBool::new(true);
        let found = master.scan_slaves_while(
            10..=20,
            |slave_id, _| {
                if slave_id == 12 {
                    keep_running.store(false, Ordering::Relaxed);
                }
            },
            &keep_running,
        );
        let ids: Vec<u8> = found.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn scan_pauses_between_slave_ids() {
        let responder = |request: &[u8]| Some(append_crc(vec![request[0], 0x83, 0x02]));

        let single = connected(FakeTransport::with_responder(responder));
        for slave_id in 1..=5 {
            assert!(single.probe_device(slave_id).is_valid());
        }
        let scanned = connected(FakeTransport::with_responder(responder));
        assert_eq!(scanned.scan_slaves(1..=5, |_, _| ()).len(), 5);

        let exchanges = single.into_transport().elapsed();
        let scan = scanned.into_transport().elapsed();
        assert_eq!(scan, exchanges + 5 * SCAN_DELAY);
        assert_eq!(SCAN_DELAY, Duration::from_millis(10));
    }

    #[test]
    fn communication_tests() {
        let registers = Arc::new(StdMutex::new(vec![7; 120]));
        let master = connected(FakeTransport::with_responder(register_device(9, registers)));
        assert!(master.test_communication(9));
        assert!(!master.test_communication(10));

        let report = master.test_comprehensive_communication(9);
        let addresses: Vec<u16> = report
            .holding_registers
            .iter()
            .map(|sample| sample.address)
            .collect();
        assert_eq!(addresses, vec![0, 1, 100]);
        assert!(report.input_registers.is_empty());
        assert_eq!(report.failed_addresses, vec![1000, 2048, 2051, 40001, 30001]);
        assert!(report.is_success());
        assert!(report.average_response_time().unwrap() > Duration::ZERO);
    }

    #[test]
    fn block_read_modify_write_patches_block() {
        let registers = Arc::new(StdMutex::new((0..32).collect::<Vec<u16>>()));
        let master = connected(FakeTransport::with_responder(register_device(
            1,
            registers.clone(),
        )));

        let updates = BTreeMap::from([(10, 42), (13, 9600)]);
        let changes = master.block_read_modify_write(1, &updates).unwrap();
        assert_eq!(
            changes,
            vec![
                RegisterChange {
                    address: 10,
                    old_value: 10,
                    new_value: 42
                },
                RegisterChange {
                    address: 13,
                    old_value: 13,
                    new_value: 9600
                },
            ]
        );
        assert_eq!(registers.lock().unwrap()[9..15], [9, 42, 11, 12, 9600, 14]);

        assert_eq!(
            master.block_read_modify_write(1, &BTreeMap::new()),
            Err(BlockWriteError::Empty)
        );
        let far = BTreeMap::from([(40, 1)]);
        assert_matches!(
            master.block_read_modify_write(1, &far),
            Err(BlockWriteError::Read(RequestError::Exception(..)))
        );
    }

    #[test]
    fn block_read_modify_write_rejects_wide_spans() {
        let registers = Arc::new(StdMutex::new(vec![0; 200]));
        let master = connected(FakeTransport::with_responder(register_device(1, registers)));

        let whole_range = BTreeMap::from([(0, 1), (u16::MAX, 2)]);
        assert_eq!(
            master.block_read_modify_write(1, &whole_range),
            Err(BlockWriteError::SpanTooLarge {
                start: 0,
                end: u16::MAX
            })
        );
        let one_too_many = BTreeMap::from([(0, 1), (frame::MAX_WRITE_REGISTERS, 2)]);
        assert_matches!(
            master.block_read_modify_write(1, &one_too_many),
            Err(BlockWriteError::SpanTooLarge { .. })
        );
        assert_eq!(master.statistics().requests_sent, 0);

        let widest = BTreeMap::from([(0, 1), (frame::MAX_WRITE_REGISTERS - 1, 2)]);
        assert_eq!(master.block_read_modify_write(1, &widest).map(|c| c.len()), Ok(2));
    }

    #[test]
    fn configuration_validation() {
        let registers = Arc::new(StdMutex::new(vec![0; 4]));
        let master = connected(FakeTransport::with_responder(register_device(8, registers)));

        assert_eq!(master.validate_configuration(1, 2, 19200), Ok(()));
        assert_eq!(master.validate_configuration(1, 1, 9600), Ok(()));
        assert_eq!(
            master.validate_configuration(1, 0, 9600),
            Err(ValidationError::SlaveIdOutOfRange(0))
        );
        assert_eq!(
            master.validate_configuration(1, 2, 100),
            Err(ValidationError::BaudRateOutOfRange(100))
        );
        assert_eq!(
            master.validate_configuration(1, 8, 9600),
            Err(ValidationError::SlaveIdInUse(8))
        );
    }
}
