//! Text rendering of library results for the terminal.

use rs485_lib::{
    master::{CommunicationReport, RegisterChange, Statistics},
    monitor::{FrameEvent, SlaveRate},
    profile::DeviceProfiles,
    scanner::ScanReport,
    transport::PortInfo,
};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

pub struct Ports<'a>(pub &'a [PortInfo]);

impl fmt::Display for Ports<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "No serial ports found.");
        }
        for port in self.0 {
            let marker = if port.looks_like_rs485() { " (RS485?)" } else { "" };
            writeln!(f, "{}{marker}", port.port)?;
            writeln!(f, "  Description:  {}", port.description)?;
            writeln!(f, "  Hardware ID:  {}", port.hwid)?;
            writeln!(f, "  Manufacturer: {}", port.manufacturer)?;
        }
        Ok(())
    }
}

pub struct Scan<'a>(pub &'a ScanReport);

impl fmt::Display for Scan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        let baud_rates: Vec<String> = report.baud_rates.iter().map(ToString::to_string).collect();
        writeln!(
            f,
            "Scan of {} started {}",
            report.port,
            humantime::format_rfc3339_seconds(report.started)
        )?;
        writeln!(
            f,
            "  Slave IDs {}-{} at {} baud, timeout {}",
            report.first_slave_id,
            report.last_slave_id,
            baud_rates.join(", "),
            humantime::format_duration(report.timeout)
        )?;
        if report.stopped {
            writeln!(f, "  Scan was stopped early.")?;
        }
        if report.devices.is_empty() {
            return writeln!(f, "No devices found.");
        }
        writeln!(f, "Found {} device(s):", report.devices.len())?;
        for device in &report.devices {
            writeln!(
                f,
                "  Slave {:>3} at {:>6} baud: {}",
                device.slave_id,
                u32::from(device.baud_rate),
                device.response
            )?;
        }
        Ok(())
    }
}

pub struct Stats<'a>(pub &'a Statistics);

impl fmt::Display for Stats<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.0;
        writeln!(f, "Requests sent:      {}", stats.requests_sent)?;
        writeln!(f, "Responses received: {}", stats.responses_received)?;
        writeln!(f, "Timeouts:           {}", stats.timeouts)?;
        writeln!(f, "CRC errors:         {}", stats.crc_errors)?;
        writeln!(f, "Exceptions:         {}", stats.exceptions)?;
        writeln!(
            f,
            "Success rate: {:.1}%, error rate: {:.1}%",
            stats.success_rate(),
            stats.error_rate()
        )
    }
}

pub struct Communication<'a>(pub &'a CommunicationReport);

impl fmt::Display for Communication<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        for (table, samples) in [
            ("Holding", &report.holding_registers),
            ("Input", &report.input_registers),
        ] {
            for sample in samples {
                writeln!(
                    f,
                    "  {table} register {:>5}: {:>5} (0x{:04X}) in {:.1} ms",
                    sample.address,
                    sample.value,
                    sample.value,
                    millis(sample.response_time)
                )?;
            }
        }
        if !report.failed_addresses.is_empty() {
            let failed: Vec<String> = report
                .failed_addresses
                .iter()
                .map(ToString::to_string)
                .collect();
            writeln!(f, "  No answer for: {}", failed.join(", "))?;
        }
        match report.average_response_time() {
            Some(average) => writeln!(
                f,
                "{} successful read(s), average response time {:.1} ms",
                report.success_count(),
                millis(average)
            ),
            None => writeln!(f, "No successful reads."),
        }
    }
}

pub struct Changes<'a>(pub &'a [RegisterChange]);

impl fmt::Display for Changes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in self.0 {
            writeln!(
                f,
                "  Register {:>5}: {} -> {}",
                change.address, change.old_value, change.new_value
            )?;
        }
        Ok(())
    }
}

pub struct Profiles<'a>(pub &'a DeviceProfiles);

impl fmt::Display for Profiles<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20} {:>12} {:>13}  Description",
            "Name", "ID register", "Baud register"
        )?;
        for profile in self.0.iter() {
            writeln!(
                f,
                "{:<20} {:>12} {:>13}  {}",
                profile.name,
                profile.slave_id_register,
                profile.baud_rate_register,
                profile.description
            )?;
        }
        Ok(())
    }
}

pub struct Frame<'a>(pub &'a FrameEvent);

impl fmt::Display for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        write!(
            f,
            "{} slave {:>3} [{:>3} bytes] +{:>8.1} ms  {}",
            humantime::format_rfc3339_millis(event.timestamp),
            event.slave_id,
            event.length,
            millis(event.interval),
            event.frame
        )
    }
}

pub struct Rates<'a> {
    pub protocol: &'a str,
    pub rates: &'a BTreeMap<u8, SlaveRate>,
}

impl fmt::Display for Rates<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Protocol: {}", self.protocol)?;
        if self.rates.is_empty() {
            return writeln!(f, "No slaves seen yet.");
        }
        writeln!(
            f,
            "{:>5} {:>8} {:>10} {:>7} {:>10} {:>8} {:>6} {:>9}  {}",
            "Slave", "Rate Hz", "Period ms", "Count", "Last", "Status", "Waves", "Msg/wave", "Wave"
        )?;
        for (slave_id, rate) in self.rates {
            let last = rate.time_since_last.map_or_else(
                || String::from("never"),
                |silence| format!("{:.1}s", silence.as_secs_f64()),
            );
            writeln!(
                f,
                "{slave_id:>5} {:>8.2} {:>10.1} {:>7} {last:>10} {:>8} {:>6} {:>9.1}  {}",
                rate.rate_hz,
                rate.period_ms,
                rate.message_count,
                rate.status.to_string(),
                rate.total_waves,
                rate.average_messages_per_wave,
                rate.wave_status
            )?;
        }
        Ok(())
    }
}
