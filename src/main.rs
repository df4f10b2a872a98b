//! RS485 toolkit CLI
//!
//! A command-line interface (CLI) application for working with Modbus RTU devices
//! on an RS485 bus.
//!
//! This tool allows users to:
//! - List the serial ports of the system and spot RS485 adapters.
//! - Scan the bus for devices over a range of slave IDs and baud rates.
//! - Probe, read and write holding registers, input registers and coils.
//! - Test the communication with a device and measure response times.
//! - Give a device a new slave ID and baud rate using a device profile.
//! - Passively monitor a bus that is driven by another master, and detect its
//!   baud rate.
//!
//! The CLI leverages the `rs485_lib` crate for protocol handling and bus access.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rs485_lib::{
    master::Master,
    monitor::{MonitorHandle, MonitorState, PassiveMonitor},
    profile::DeviceProfiles,
    protocol as proto,
    scanner::{ScanEvent, ScanOptions, Scanner},
    transport::{self, SerialConfig, SerialTransport},
};
use std::collections::BTreeSet;
use std::io::{Write, stdout};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use std::panic;

mod commandline;
mod config;
mod report;

use commandline::{CliArgs, CliCommands, Table};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Checks if the user-provided RTU delay is sufficient; if not, uses the calculated minimum.
fn check_rtu_delay(user_delay: Duration, baud_rate: &proto::BaudRate) -> Duration {
    let min_rtu_delay = baud_rate.inter_frame_timeout();
    if user_delay < min_rtu_delay {
        warn!(
            "User-defined RTU delay of {user_delay:?} is below the recommended minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Commandline options merged over the config file.
#[derive(Debug)]
struct Settings {
    device: Option<String>,
    baud_rate: proto::BaudRate,
    timeout: Duration,
    delay: Duration,
    wave_gap: Duration,
    profiles: DeviceProfiles,
}

impl Settings {
    fn new(args: &CliArgs, config: config::Config) -> Self {
        let baud_rate = args.baud_rate.unwrap_or(config.baud_rate);
        let mut profiles = DeviceProfiles::default();
        profiles.extend(config.profiles);
        Self {
            device: args.device.clone().or(config.device),
            baud_rate,
            timeout: args.timeout.unwrap_or(config.timeout),
            delay: check_rtu_delay(args.delay.unwrap_or(config.delay), &baud_rate),
            wave_gap: config.wave_gap,
            profiles,
        }
    }

    /// The configured serial port, or the first one that looks like an RS485 adapter.
    fn device(&self) -> Result<String> {
        match &self.device {
            Some(device) => Ok(device.clone()),
            None => transport::auto_detect_port()
                .context("No serial port given with --device and none could be detected"),
        }
    }
}

/// Creates a master connected with the configured settings.
fn connect_master(settings: &Settings) -> Result<Master<SerialTransport>> {
    let device = settings.device()?;
    let baud_rate = settings.baud_rate;
    info!("Connecting to {device} at {baud_rate} baud...");
    let master = Master::new(SerialTransport::new());
    master
        .connect(SerialConfig::new(&device, baud_rate).with_timeout(settings.timeout))
        .with_context(|| format!("Cannot open serial port {device} at {baud_rate} baud"))?;
    Ok(master)
}

fn print_registers(start: u16, values: &[u16]) {
    for (offset, value) in values.iter().enumerate() {
        println!(
            "  {:>5}: {value:>5} (0x{value:04X})",
            u32::from(start) + offset as u32
        );
    }
}

fn print_bits(start: u16, values: &[bool]) {
    for (offset, value) in values.iter().enumerate() {
        let state = if *value { "ON" } else { "OFF" };
        println!("  {:>5}: {state}", u32::from(start) + offset as u32);
    }
}

fn handle_list_ports(rs485_only: bool) -> Result<()> {
    info!("Executing: List Ports");
    let ports = if rs485_only {
        transport::find_rs485_ports()
    } else {
        transport::list_available_ports()
    }
    .context("Cannot list serial ports")?;
    print!("{}", report::Ports(&ports));
    Ok(())
}

fn handle_scan(
    settings: &Settings,
    slave_ids: std::ops::RangeInclusive<u8>,
    baud_rates: &[proto::BaudRate],
    yaml: bool,
) -> Result<()> {
    if slave_ids.is_empty() {
        bail!(
            "Invalid slave ID range {}-{}",
            slave_ids.start(),
            slave_ids.end()
        );
    }
    let device = settings.device()?;
    info!("Starting scan on device: {device}");

    let mut options = ScanOptions::new(device);
    options.slave_ids = slave_ids;
    options.timeout = settings.timeout;
    if !baud_rates.is_empty() {
        options.baud_rates = baud_rates.to_vec();
    }

    let master = Master::new(SerialTransport::new());
    let scanner = Scanner::new(&master);
    let report = scanner.scan(&options, |event| match event {
        ScanEvent::BaudRateStarted(baud_rate) => {
            println!("Scanning at {baud_rate} baud on {} ...", options.port)
        }
        ScanEvent::BaudRateFailed { reason, .. } => println!("  skipped: {reason}"),
        ScanEvent::Probing { slave_id, total } => trace!("Probing slave {slave_id} of {total}"),
        ScanEvent::DeviceFound(device) => {
            println!("  Device found: slave {} ({})", device.slave_id, device.response)
        }
        ScanEvent::BaudRateFinished { baud_rate, found } => {
            println!("  {found} device(s) at {baud_rate} baud")
        }
        ScanEvent::Progress(percent) => debug!("Scan progress {percent:.1}%"),
        ScanEvent::Finished { found, stopped } => {
            info!("Scan finished with {found} device(s), stopped early: {stopped}")
        }
    });
    master.disconnect();

    println!();
    if yaml {
        print!("{}", report.to_yaml().context("Cannot render scan report")?);
    } else {
        print!("{}", report::Scan(&report));
    }
    debug!("Scan statistics:\n{}", report::Stats(&master.statistics()));
    Ok(())
}

fn handle_probe(
    master: &Master<SerialTransport>,
    slave: proto::SlaveId,
    address: Option<u16>,
) -> Result<()> {
    info!("Executing: Probe Slave {slave}");
    let response = match address {
        Some(address) => master.probe_device_at(*slave, address),
        None => master.probe_device(*slave),
    };
    if response.is_timeout() {
        bail!("No answer from slave {slave}");
    }
    if response.is_crc_error() {
        bail!("Answer from slave {slave} failed the CRC check");
    }
    println!("Slave {slave} answered: {}", response.exception_name());
    if let Some(frame) = response.raw_frame() {
        println!("  Frame: {}", rs485_lib::frame::to_hex(frame));
    }
    Ok(())
}

fn handle_read(
    master: &Master<SerialTransport>,
    delay: Duration,
    slave: proto::SlaveId,
    address: u16,
    count: u16,
    table: Table,
    repeat: u32,
) -> Result<()> {
    info!("Executing: Read {count} value(s) of {table:?} at {address} from slave {slave}");
    for round in 0..repeat.max(1) {
        if round > 0 {
            master.pause(delay);
        }
        let result = match table {
            Table::Holding => master
                .read_holding_registers(*slave, address, count)
                .map(|values| print_registers(address, &values)),
            Table::Input => master
                .read_input_registers(*slave, address, count)
                .map(|values| print_registers(address, &values)),
            Table::Coils => master
                .read_coils(*slave, address, count)
                .map(|values| print_bits(address, &values)),
            Table::Discrete => master
                .read_discrete_inputs(*slave, address, count)
                .map(|values| print_bits(address, &values)),
        };
        match result {
            Ok(()) => {}
            Err(err) if repeat <= 1 => {
                return Err(err).with_context(|| {
                    format!("Cannot read {count} value(s) at {address} from slave {slave}")
                });
            }
            Err(err) => println!("  Read {} failed: {err}", round + 1),
        }
    }
    if repeat > 1 {
        println!();
        print!("{}", report::Stats(&master.statistics()));
    }
    Ok(())
}

fn handle_write(
    master: &Master<SerialTransport>,
    slave: proto::SlaveId,
    address: u16,
    values: &[u16],
    coils: bool,
) -> Result<()> {
    info!("Executing: Write {} value(s) at {address} to slave {slave}", values.len());
    let result = if coils {
        let states: Vec<bool> = values.iter().map(|value| *value != 0).collect();
        match states.as_slice() {
            [on] => master.write_single_coil(*slave, address, *on),
            _ => master.write_multiple_coils(*slave, address, &states),
        }
    } else {
        match values {
            [value] => master.write_single_register(*slave, address, *value),
            _ => master.write_multiple_registers(*slave, address, values),
        }
    };
    result.with_context(|| format!("Failed to write to slave {slave} at {address}"))?;
    println!(
        "Wrote {} value(s) to slave {slave} starting at {address}.",
        values.len()
    );
    Ok(())
}

fn handle_test(
    master: &Master<SerialTransport>,
    slave: proto::SlaveId,
    comprehensive: bool,
) -> Result<()> {
    info!("Executing: Communication Test with Slave {slave}");
    let success = if comprehensive {
        println!("Testing communication with slave {slave}:");
        let report = master.test_comprehensive_communication(*slave);
        print!("{}", report::Communication(&report));
        report.is_success()
    } else {
        print!("Testing communication with slave {slave} ... ");
        stdout().flush().context("Failed to flush stdout")?;
        let success = master.test_communication(*slave);
        println!("{}", if success { "OK." } else { "failed." });
        success
    };
    println!();
    print!("{}", report::Stats(&master.statistics()));
    if !success {
        bail!("No communication with slave {slave}");
    }
    Ok(())
}

fn handle_configure(
    master: &Master<SerialTransport>,
    settings: &Settings,
    slave: proto::SlaveId,
    new_slave: proto::SlaveId,
    new_baud_rate: u32,
    profile_name: &str,
    yes: bool,
) -> Result<()> {
    info!("Executing: Configure Slave {slave} to ID {new_slave} at {new_baud_rate} baud");
    let profile = settings
        .profiles
        .get(profile_name)
        .with_context(|| format!("Unknown device profile '{profile_name}'"))?;

    master
        .validate_configuration(*slave, *new_slave, new_baud_rate)
        .context("Invalid new configuration")?;
    let updates = profile
        .register_updates(*new_slave, new_baud_rate)
        .with_context(|| format!("Profile '{}' can not store this configuration", profile.name))?;

    println!("Device profile: {} ({})", profile.name, profile.description);
    println!(
        "  Slave ID:  {slave} -> {new_slave} (register {})",
        profile.slave_id_register
    );
    println!(
        "  Baud rate: {} -> {new_baud_rate} (register {})",
        settings.baud_rate, profile.baud_rate_register
    );
    if !yes
        && !Confirm::new()
            .with_prompt("Write the new configuration to the device?")
            .default(false)
            .show_default(true)
            .interact()
            .context("Failed to get user confirmation.")?
    {
        info!("Configuration aborted by user.");
        return Ok(());
    }

    master.pause(settings.delay);
    let changes = master
        .block_read_modify_write(*slave, &updates)
        .with_context(|| format!("Failed to configure slave {slave}"))?;
    println!("Configuration written:");
    print!("{}", report::Changes(&changes));
    println!(
        "Important: Power cycle the device if required, then use slave ID {new_slave} at {new_baud_rate} baud."
    );
    Ok(())
}

fn print_rates<T>(handle: &MonitorHandle<T>) {
    let state = handle.snapshot();
    let rates = handle.current_rates();
    println!();
    print!(
        "{}",
        report::Rates {
            protocol: state.protocol_name(),
            rates: &rates,
        }
    );
    println!(
        "Frames captured: {}, dropped: {}",
        state.frames_captured(),
        state.frames_dropped()
    );
}

fn handle_monitor(
    settings: &Settings,
    slaves: &[proto::SlaveId],
    wave_gap: Option<Duration>,
    duration: Option<Duration>,
    summary_interval: Duration,
    summary_only: bool,
) -> Result<()> {
    let device = settings.device()?;
    info!("Executing: Monitor {device}");
    let filter = (!slaves.is_empty()).then(|| slaves.iter().map(|id| **id).collect::<BTreeSet<_>>());
    let state = MonitorState::new(filter, wave_gap.unwrap_or(settings.wave_gap));

    let mut monitor = PassiveMonitor::with_state(SerialTransport::new(), state);
    monitor
        .setup_passive_mode(&device, settings.baud_rate, settings.timeout)
        .with_context(|| format!("Cannot listen on {device} at {} baud", settings.baud_rate))?;
    let handle = monitor.start().context("Cannot start monitoring")?;
    println!(
        "Monitoring {device} at {} baud. Press Ctrl-C to stop.",
        settings.baud_rate
    );

    let started = Instant::now();
    let deadline = duration.map(|duration| started + duration);
    let mut next_summary = started + summary_interval;
    loop {
        let now = Instant::now();
        if deadline.is_some_and(|deadline| now >= deadline) {
            break;
        }
        let wake_up = deadline.map_or(next_summary, |deadline| deadline.min(next_summary));
        match handle
            .events()
            .recv_timeout(wake_up.saturating_duration_since(now))
        {
            Ok(event) if !summary_only => println!("{}", report::Frame(&event)),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Monitoring ended, the port may have been disconnected");
                break;
            }
        }
        if Instant::now() >= next_summary {
            print_rates(&handle);
            next_summary += summary_interval;
        }
    }

    print_rates(&handle);
    if handle.stop().is_none() {
        bail!("Monitoring failed");
    }
    Ok(())
}

fn handle_detect_baud(settings: &Settings, baud_rates: &[proto::BaudRate]) -> Result<()> {
    let device = settings.device()?;
    info!("Executing: Detect Baud Rate on {device}");
    let candidates = if baud_rates.is_empty() {
        proto::BaudRate::COMMON.to_vec()
    } else {
        baud_rates.to_vec()
    };
    println!(
        "Listening on {device} at {} baud rate(s), this may take a while...",
        candidates.len()
    );

    let mut monitor = PassiveMonitor::new(SerialTransport::new());
    match monitor.auto_detect_baudrate(&device, &candidates) {
        Some(baud_rate) => {
            println!(
                "Detected baud rate: {baud_rate} ({})",
                monitor.snapshot().protocol_name()
            );
            Ok(())
        }
        None => {
            bail!("Could not detect the baud rate on {device}. Is another master polling the bus?")
        }
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "RS485 toolkit started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Merge the config file with the commandline
    let config = config::load_config(args.config.as_deref())?;
    let settings = Settings::new(&args, config);
    debug!("Settings: {settings:?}");

    // 3. Commands that do not talk to a device as master
    match &args.command {
        CliCommands::ListPorts { rs485_only } => return handle_list_ports(*rs485_only),
        CliCommands::Profiles => {
            print!("{}", report::Profiles(&settings.profiles));
            return Ok(());
        }
        CliCommands::Scan {
            first,
            last,
            baud_rates,
            yaml,
        } => return handle_scan(&settings, **first..=**last, baud_rates, *yaml),
        CliCommands::Monitor {
            slaves,
            wave_gap,
            duration,
            summary_interval,
            summary_only,
        } => {
            return handle_monitor(
                &settings,
                slaves,
                *wave_gap,
                *duration,
                *summary_interval,
                *summary_only,
            );
        }
        CliCommands::DetectBaud { baud_rates } => {
            return handle_detect_baud(&settings, baud_rates);
        }
        _ => {}
    }

    // 4. Execute the command as master
    let master = connect_master(&settings)?;
    let result = match &args.command {
        CliCommands::Probe { slave, address } => handle_probe(&master, *slave, *address),
        CliCommands::Read {
            slave,
            address,
            count,
            table,
            repeat,
        } => handle_read(
            &master,
            settings.delay,
            *slave,
            *address,
            *count,
            *table,
            *repeat,
        ),
        CliCommands::Write {
            slave,
            address,
            values,
            coils,
        } => handle_write(&master, *slave, *address, values, *coils),
        CliCommands::Test {
            slave,
            comprehensive,
        } => handle_test(&master, *slave, *comprehensive),
        CliCommands::Configure {
            slave,
            new_slave,
            new_baud_rate,
            profile,
            yes,
        } => handle_configure(
            &master,
            &settings,
            *slave,
            *new_slave,
            *new_baud_rate,
            profile,
            *yes,
        ),
        CliCommands::ListPorts { .. }
        | CliCommands::Profiles
        | CliCommands::Scan { .. }
        | CliCommands::Monitor { .. }
        | CliCommands::DetectBaud { .. } => unreachable!("Handled before connecting."),
    };
    info!("Session statistics: {:?}", master.statistics());
    master.disconnect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_rtu_delay() {
        let br_9600 = proto::BaudRate::B9600;
        let min_delay_9600 = br_9600.inter_frame_timeout();
        assert_eq!(min_delay_9600.as_micros(), 4010);

        assert_eq!(
            check_rtu_delay(Duration::from_millis(3), &br_9600),
            min_delay_9600
        );
        assert_eq!(
            check_rtu_delay(Duration::from_millis(5), &br_9600),
            Duration::from_millis(5)
        );
        assert_eq!(check_rtu_delay(min_delay_9600, &br_9600), min_delay_9600);
    }

    #[test]
    fn test_check_rtu_delay_fast_baud_rates() {
        // 38.5 / 115200 is about 334us, the 1.5ms floor applies
        let br_115200 = proto::BaudRate::B115200;
        assert_eq!(
            check_rtu_delay(Duration::from_micros(500), &br_115200),
            Duration::from_micros(1500)
        );
        assert_eq!(
            check_rtu_delay(Duration::from_millis(2), &br_115200),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn commandline_overrides_config_file() {
        let config = config::Config::from_yaml(
            r#"
device: /dev/ttyS1
baud_rate: 19200
timeout: 1s
delay: 1ms
profiles:
  - name: Meter
    slave_id_register: 20
    baud_rate_register: 21
"#,
        )
        .unwrap();
        let args = CliArgs::parse_from(["rs485tool", "--baud-rate", "4800", "profiles"]);
        let settings = Settings::new(&args, config);

        assert_eq!(settings.device().unwrap(), "/dev/ttyS1");
        assert_eq!(settings.baud_rate, proto::BaudRate::B4800);
        assert_eq!(settings.timeout, Duration::from_secs(1));
        // 1ms is below 3.5 characters at 4800 baud
        assert_eq!(settings.delay, proto::BaudRate::B4800.inter_frame_timeout());
        assert_eq!(settings.delay.as_micros(), 8020);
        assert_eq!(settings.profiles.len(), 4);
        assert!(settings.profiles.get("meter").is_some());
    }
}
