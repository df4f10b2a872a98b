//! Modbus RTU protocol value types.
//!
//! Strongly typed wrappers for the values that travel on the bus or configure the
//! serial line: slave addresses, baud rates, function codes and exception codes.
//! Out-of-range values are rejected here, before any I/O is attempted.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Errors for values that can not be used on a Modbus RTU bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The slave ID is outside of `1..=247`.
    #[error("Slave ID {0} is out of range ({min}..={max})", min = SlaveId::MIN, max = SlaveId::MAX)]
    SlaveIdOutOfRange(u8),

    /// The baud rate is not one of the supported rates.
    #[error("Unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),

    /// The number of registers or coils does not fit into a single request.
    #[error("Quantity {0} is out of range for a single request")]
    QuantityOutOfRange(u16),

    /// The value does not fit into a 16-bit register.
    #[error("Value {0} does not fit into a 16-bit register")]
    RegisterValueOutOfRange(u32),
}

/// A Modbus RTU slave address.
///
/// Addresses `0` (broadcast) and `248..=255` (reserved) can not identify a single
/// responding device and are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct SlaveId(u8);

impl SlaveId {
    /// The lowest assignable slave ID.
    pub const MIN: u8 = 1;
    /// The highest assignable slave ID.
    pub const MAX: u8 = 247;

    /// Returns `true` if `value` is a plausible slave ID.
    pub fn is_plausible(value: u8) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }
}

impl std::ops::Deref for SlaveId {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for SlaveId {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for SlaveId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if Self::is_plausible(value) {
            Ok(Self(value))
        } else {
            Err(Error::SlaveIdOutOfRange(value))
        }
    }
}

impl From<SlaveId> for u8 {
    fn from(slave: SlaveId) -> u8 {
        slave.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serial line speeds used by RS485 field devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u32", into = "u32"))]
#[repr(u32)]
pub enum BaudRate {
    B300 = 300,
    B600 = 600,
    B1200 = 1200,
    B2400 = 2400,
    B4800 = 4800,
    B9600 = 9600,
    B19200 = 19200,
    B38400 = 38400,
    B57600 = 57600,
    B115200 = 115200,
    B230400 = 230400,
}

impl BaudRate {
    /// Every supported baud rate in ascending order.
    pub const ALL: [BaudRate; 11] = [
        BaudRate::B300,
        BaudRate::B600,
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B230400,
    ];

    /// Candidates for passive auto-detection, most likely first.
    pub const COMMON: [BaudRate; 8] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B4800,
        BaudRate::B2400,
        BaudRate::B1200,
    ];

    /// Rates selected for a discovery scan when none are given.
    pub const DEFAULT_SCAN: [BaudRate; 5] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
    ];

    /// Silence that terminates an RTU frame at this baud rate.
    pub fn inter_frame_timeout(&self) -> Duration {
        inter_frame_timeout(*self as u32)
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::B9600
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|rate| *rate as u32 == value)
            .ok_or(Error::UnsupportedBaudRate(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> u32 {
        rate as u32
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// Bits per character assumed for RTU timing: start, 8 data, parity or stop, stop.
const BITS_PER_CHAR: f64 = 11.0;
/// Lower bound for the inter-frame silence.
const MIN_INTER_FRAME_TIMEOUT: Duration = Duration::from_micros(1_500);

/// Calculates the inter-frame silence for `baud_rate`: `max(1.5ms, 3.5 * 11 / baud)`.
pub fn inter_frame_timeout(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return MIN_INTER_FRAME_TIMEOUT;
    }
    let seconds = 3.5 * BITS_PER_CHAR / baud_rate as f64;
    Duration::from_secs_f64(seconds).max(MIN_INTER_FRAME_TIMEOUT)
}

/// Bit set on the function code of an exception response.
pub const EXCEPTION_BIT: u8 = 0x80;

/// The Modbus function codes this crate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub const ALL: [FunctionCode; 8] = [
        FunctionCode::ReadCoils,
        FunctionCode::ReadDiscreteInputs,
        FunctionCode::ReadHoldingRegisters,
        FunctionCode::ReadInputRegisters,
        FunctionCode::WriteSingleCoil,
        FunctionCode::WriteSingleRegister,
        FunctionCode::WriteMultipleCoils,
        FunctionCode::WriteMultipleRegisters,
    ];

    /// Looks up a plain (non-exception) function code.
    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|function| *function as u8 == code)
    }

    /// Returns `true` if `code` is a known function code, with or without the exception bit.
    pub fn is_recognized(code: u8) -> bool {
        Self::from_u8(code & !EXCEPTION_BIT).is_some()
    }

    /// Read functions answer with a byte-count prefixed payload.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// Write functions answer with a fixed eight byte echo.
    pub fn is_write(&self) -> bool {
        !self.is_read()
    }
}

impl From<FunctionCode> for u8 {
    fn from(function: FunctionCode) -> u8 {
        function as u8
    }
}

/// The reason code carried by an exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ExceptionCode {
    /// Human readable name, `Unknown Exception (N)` for unmapped codes.
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Self::IllegalFunction => "Illegal Function".into(),
            Self::IllegalDataAddress => "Illegal Data Address".into(),
            Self::IllegalDataValue => "Illegal Data Value".into(),
            Self::SlaveDeviceFailure => "Slave Device Failure".into(),
            Self::Acknowledge => "Acknowledge".into(),
            Self::SlaveDeviceBusy => "Slave Device Busy".into(),
            Self::MemoryParityError => "Memory Parity Error".into(),
            Self::GatewayPathUnavailable => "Gateway Path Unavailable".into(),
            Self::GatewayTargetFailed => "Gateway Target Failed".into(),
            Self::Unknown(code) => format!("Unknown Exception ({code})").into(),
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::IllegalFunction,
            2 => Self::IllegalDataAddress,
            3 => Self::IllegalDataValue,
            4 => Self::SlaveDeviceFailure,
            5 => Self::Acknowledge,
            6 => Self::SlaveDeviceBusy,
            8 => Self::MemoryParityError,
            10 => Self::GatewayPathUnavailable,
            11 => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        match code {
            ExceptionCode::IllegalFunction => 1,
            ExceptionCode::IllegalDataAddress => 2,
            ExceptionCode::IllegalDataValue => 3,
            ExceptionCode::SlaveDeviceFailure => 4,
            ExceptionCode::Acknowledge => 5,
            ExceptionCode::SlaveDeviceBusy => 6,
            ExceptionCode::MemoryParityError => 8,
            ExceptionCode::GatewayPathUnavailable => 10,
            ExceptionCode::GatewayTargetFailed => 11,
            ExceptionCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
