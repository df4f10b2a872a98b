use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rs485_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_slave_id(s: &str) -> Result<proto::SlaveId, String> {
    let slave_id =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid slave ID format: {e}"))?;
    proto::SlaveId::try_from(slave_id).map_err(|e| e.to_string())
}

fn parse_register(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid register format: {e}"))
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

/// Register table to read from.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Holding registers (function 0x03)
    Holding,
    /// Input registers (function 0x04)
    Input,
    /// Coils (function 0x01)
    Coils,
    /// Discrete inputs (function 0x02)
    Discrete,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the serial ports of this system.
    ListPorts {
        /// Only show ports that look like RS485 adapters.
        #[arg(long)]
        rs485_only: bool,
    },

    /// Scan the bus for devices by probing a range of slave IDs at one or more
    /// baud rates. Every valid answer counts, Modbus exceptions included.
    #[clap(verbatim_doc_comment)]
    Scan {
        /// First slave ID to probe.
        #[arg(long, default_value = "1", value_parser = parse_slave_id)]
        first: proto::SlaveId,

        /// Last slave ID to probe.
        #[arg(long, default_value = "247", value_parser = parse_slave_id)]
        last: proto::SlaveId,

        /// Baud rates to scan, comma separated.
        /// Default: 9600,19200,38400,57600,115200
        #[arg(long, value_delimiter = ',', value_parser = parse_baud_rate, verbatim_doc_comment)]
        baud_rates: Vec<proto::BaudRate>,

        /// Print the report as YAML.
        #[arg(long)]
        yaml: bool,
    },

    /// Probe a single slave ID by reading one holding register.
    Probe {
        /// The Modbus RTU slave ID (1 to 247).
        #[arg(value_parser = parse_slave_id)]
        slave: proto::SlaveId,

        /// Register to read. By default an address no device implements, so a
        /// present device answers with "Illegal Data Address".
        #[arg(long, value_parser = parse_register, verbatim_doc_comment)]
        address: Option<u16>,
    },

    /// Read registers, coils or discrete inputs.
    Read {
        /// The Modbus RTU slave ID (1 to 247).
        #[arg(value_parser = parse_slave_id)]
        slave: proto::SlaveId,

        /// First address, decimal or hexadecimal (e.g. "0x800").
        #[arg(value_parser = parse_register)]
        address: u16,

        /// Number of values to read.
        #[arg(short, long, default_value_t = 1)]
        count: u16,

        #[arg(short, long, value_enum, default_value_t = Table::Holding)]
        table: Table,

        /// Repeat the read, waiting --delay in between. Statistics are printed at the end.
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },

    /// Write holding registers or coils.
    /// One value uses a single write (0x06 / 0x05), more values a multiple write
    /// (0x10 / 0x0F) starting at the given address.
    #[clap(verbatim_doc_comment)]
    Write {
        /// The Modbus RTU slave ID (1 to 247).
        #[arg(value_parser = parse_slave_id)]
        slave: proto::SlaveId,

        /// First address, decimal or hexadecimal.
        #[arg(value_parser = parse_register)]
        address: u16,

        /// Values to write, decimal or hexadecimal.
        #[arg(required = true, value_parser = parse_register)]
        values: Vec<u16>,

        /// Write coils instead of registers, every value but 0 switches a coil on.
        #[arg(long)]
        coils: bool,
    },

    /// Test the communication with a device by reading common register addresses.
    Test {
        /// The Modbus RTU slave ID (1 to 247).
        #[arg(value_parser = parse_slave_id)]
        slave: proto::SlaveId,

        /// Read more addresses and measure the response times.
        #[arg(long)]
        comprehensive: bool,
    },

    /// Give a device a new slave ID and baud rate.
    /// The registers to write are taken from a device profile (see `profiles`).
    /// **Important:** Most devices apply the new settings only after a power cycle.
    #[clap(verbatim_doc_comment)]
    Configure {
        /// Current slave ID of the device.
        #[arg(value_parser = parse_slave_id)]
        slave: proto::SlaveId,

        /// The new slave ID (1 to 247).
        #[arg(value_parser = parse_slave_id)]
        new_slave: proto::SlaveId,

        /// The new baud rate.
        new_baud_rate: u32,

        /// Name of the device profile.
        #[arg(short, long, default_value = "Generic")]
        profile: String,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// List the known device profiles.
    Profiles,

    /// Listen on the bus without transmitting and show which slaves are polled
    /// and how often.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Only track these slave IDs, comma separated. Default: all.
        #[arg(long, value_delimiter = ',', value_parser = parse_slave_id)]
        slaves: Vec<proto::SlaveId>,

        /// Silence that ends a wave of messages (e.g. "500ms", "2s").
        #[arg(long, value_parser = humantime::parse_duration)]
        wave_gap: Option<Duration>,

        /// Stop after this time. Default: run until interrupted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Interval of the rate summary.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        summary_interval: Duration,

        /// Only print the rate summaries, not every frame.
        #[arg(long)]
        summary_only: bool,
    },

    /// Detect the baud rate of a busy bus by listening at common rates.
    DetectBaud {
        /// Baud rates to try in this order, comma separated.
        /// Default: 9600,19200,38400,57600,115200,4800,2400,1200
        #[arg(long, value_delimiter = ',', value_parser = parse_baud_rate, verbatim_doc_comment)]
        baud_rates: Vec<proto::BaudRate>,
    },
}

const fn about_text() -> &'static str {
    "RS485 toolkit - Modbus RTU master, bus scanner and passive bus monitor."
}

#[derive(Parser, Debug)]
#[command(name="rs485tool", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// YAML file with defaults for the options below and additional device profiles.
    /// Default: "rs485tool.yml" in the working directory, if present.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Serial port device name.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    /// Default: the first port that looks like an RS485 adapter.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub device: Option<String>,

    /// Baud rate for serial communication. Default: 9600
    #[arg(global = true, short, long, value_parser = parse_baud_rate)]
    pub baud_rate: Option<proto::BaudRate>,

    /// Modbus I/O timeout for a single request.
    /// Examples: "1s", "500ms". Default: 200ms
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Minimum delay between multiple Modbus commands sent to the same device.
    /// Important for Modbus RTU, especially with USB-to-RS485 converters that need time
    /// to switch between transmitting (TX) and receiving (RX) modes.
    /// Examples: "50ms", "100ms". Default: 50ms
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal() {
        let args = CliArgs::parse_from(["rs485tool", "read", "0x0A", "0x800", "-c", "2"]);
        assert_eq!(
            args.command,
            CliCommands::Read {
                slave: proto::SlaveId::try_from(10).unwrap(),
                address: 0x800,
                count: 2,
                table: Table::Holding,
                repeat: 1,
            }
        );
        assert_eq!(args.device, None);
    }

    #[test]
    fn global_options_after_subcommand() {
        let args = CliArgs::parse_from([
            "rs485tool",
            "scan",
            "--baud-rates",
            "9600,19200",
            "--device",
            "/dev/ttyUSB1",
            "--timeout",
            "100ms",
        ]);
        assert_eq!(args.device.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(args.timeout, Some(Duration::from_millis(100)));
        let CliCommands::Scan { baud_rates, .. } = args.command else {
            panic!("expected scan");
        };
        assert_eq!(baud_rates, vec![proto::BaudRate::B9600, proto::BaudRate::B19200]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(CliArgs::try_parse_from(["rs485tool", "probe", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["rs485tool", "probe", "248"]).is_err());
        assert!(CliArgs::try_parse_from(["rs485tool", "--baud-rate", "1234", "profiles"]).is_err());
        assert!(CliArgs::try_parse_from(["rs485tool", "write", "1", "0"]).is_err());
    }
}
