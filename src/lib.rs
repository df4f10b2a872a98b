//! A library for talking to and listening on RS485 buses with Modbus RTU devices.
//!
//! This crate provides three ways to work with a bus:
//!
//! 1.  **Master**: A thread-safe Modbus RTU master that reads and writes registers
//!     and coils, probes for devices and keeps communication statistics. See
//!     [`master::Master`] (blocking) and `tokio_async_master::AsyncMaster` (`async`,
//!     feature `tokio-async`).
//!
//! 2.  **Scanner**: Finds devices by probing a range of slave IDs at one or more
//!     baud rates. See [`scanner::Scanner`].
//!
//! 3.  **Passive Monitor**: Listens without transmitting, detects the protocol,
//!     measures how often each slave is polled and groups traffic into waves. See
//!     [`monitor::PassiveMonitor`].
//!
//! ## Features
//!
//! - **Own RTU codec**: CRC16, request builders and a completeness predicate that
//!   knows the response length of each function code.
//! - **Adaptive timing**: The inter-frame timeout follows the baud rate.
//! - **Testable transport**: All I/O and all waiting go through the
//!   [`transport::Transport`] trait.
//! - **Strongly-Typed API**: Utilizes Rust's type system for protocol correctness (e.g., `SlaveId`, `BaudRate`, `ExceptionCode`).
//!
//! ## Quick Start
//!
//! ```no_run
//! use rs485_lib::{
//!     master::Master,
//!     protocol::BaudRate,
//!     scanner::{ScanOptions, Scanner},
//!     transport::SerialTransport,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let master = Master::new(SerialTransport::new());
//!     let scanner = Scanner::new(&master);
//!
//!     let mut options = ScanOptions::new("/dev/ttyUSB0");
//!     options.baud_rates = vec![BaudRate::B9600, BaudRate::B19200];
//!     let report = scanner.scan(&options, |_| ());
//!
//!     for device in &report.devices {
//!         println!("Slave {} at {} baud", device.slave_id, device.baud_rate);
//!     }
//!     Ok(())
//! }
//! ```

pub mod crc;
pub mod error;
pub mod frame;
pub mod master;
pub mod monitor;
pub mod profile;
pub mod protocol;
pub mod scanner;
pub mod stats;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "tokio-async")))]
#[cfg(feature = "tokio-async")]
pub mod tokio_async_master;

pub use error::{Error, Result};
