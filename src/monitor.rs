//! Passive RS485 bus monitor.
//!
//! The monitor never transmits. It splits the received byte stream into frames at
//! inter-frame gaps, filters out noise, and keeps per-slave polling and wave
//! statistics ([`crate::stats`]).
//!
//! [`PassiveMonitor::start`] moves the monitor onto a worker thread. The worker is
//! the only writer of the shared [`MonitorState`]; readers take snapshots through
//! the returned [`MonitorHandle`] and receive one [`FrameEvent`] per counted poll
//! over a channel.
//!
//! ## Example
//!
//! ```no_run
//! use rs485_lib::{monitor::PassiveMonitor, protocol::BaudRate, transport::SerialTransport};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut monitor = PassiveMonitor::new(SerialTransport::new());
//!     monitor.setup_passive_mode("/dev/ttyUSB0", BaudRate::B9600, Duration::from_secs(1))?;
//!     let handle = monitor.start()?;
//!     for event in handle.events().iter().take(10) {
//!         println!("slave {} after {:?}: {}", event.slave_id, event.interval, event.frame);
//!     }
//!     handle.stop();
//!     Ok(())
//! }
//! ```

use crate::{
    crc,
    error::{Error, Result},
    frame,
    protocol::{BaudRate, FunctionCode, SlaveId},
    stats::{SlaveStats, WaveStats, WaveStatus},
    transport::{SerialConfig, Transport},
};
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// Silence that separates two waves when nothing else is configured.
pub const DEFAULT_WAVE_GAP: Duration = Duration::from_millis(500);
/// Captured chunks shorter than this are noise.
pub const MIN_FRAME_LEN: usize = 4;
/// Frame boundary gap used when no connection configuration is known.
const FALLBACK_FRAME_TIMEOUT: Duration = Duration::from_millis(5);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const BATCH_FRAMES: usize = 50;
const BATCH_TIMEOUT: Duration = Duration::from_secs(1);
const BATCH_PAUSE: Duration = Duration::from_millis(100);

const DETECT_TIMEOUT: Duration = Duration::from_millis(500);
const DETECT_LISTEN: Duration = Duration::from_secs(3);
const DETECT_BATCH_FRAMES: usize = 10;
const DETECT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
const DETECT_MIN_VALID_FRAMES: usize = 2;

const ACTIVE_WITHIN: Duration = Duration::from_secs(1);
const SLOWING_WITHIN: Duration = Duration::from_secs(3);

/// Protocol a captured frame was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Known function code and matching CRC.
    ModbusRtu,
    /// Starts with the `:` start-of-frame marker.
    ModbusAscii,
    /// Something with a plausible address byte.
    Custom,
}

/// Classifies a captured frame, `None` for noise.
///
/// The first byte has to be a plausible slave ID for any kind. Everything that
/// passes this check and is neither RTU nor ASCII is reported as custom traffic.
pub fn classify_frame(frame: &[u8]) -> Option<FrameKind> {
    if frame.len() < MIN_FRAME_LEN || !SlaveId::is_plausible(frame[0]) {
        return None;
    }
    if FunctionCode::is_recognized(frame[1])
        && frame.len() >= frame::MIN_RESPONSE_LEN
        && crc::crc_matches(frame)
    {
        Some(FrameKind::ModbusRtu)
    } else if frame[0] == b':' {
        Some(FrameKind::ModbusAscii)
    } else {
        Some(FrameKind::Custom)
    }
}

/// Protocols seen so far. Flags are never cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedProtocols {
    pub modbus_rtu: bool,
    pub modbus_ascii: bool,
    pub custom: bool,
}

impl DetectedProtocols {
    fn mark(&mut self, kind: FrameKind) {
        match kind {
            FrameKind::ModbusRtu => self.modbus_rtu = true,
            FrameKind::ModbusAscii => self.modbus_ascii = true,
            FrameKind::Custom => self.custom = true,
        }
    }

    /// The most specific protocol seen.
    pub fn name(&self) -> &'static str {
        if self.modbus_rtu {
            "Modbus RTU"
        } else if self.modbus_ascii {
            "Modbus ASCII"
        } else if self.custom {
            "Custom/Unknown"
        } else {
            "Detecting..."
        }
    }
}

/// A frame cut from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    /// Transport clock time of the last byte.
    pub captured_at: Instant,
    pub timestamp: SystemTime,
}

/// Display event for a counted poll.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FrameEvent {
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub timestamp: SystemTime,
    pub slave_id: u8,
    /// Hex dump of the frame.
    pub frame: String,
    pub length: usize,
    /// Time since the previous poll of this slave, zero for its first frame.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub interval: Duration,
}

/// How recently a slave was polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ActivityStatus {
    Active,
    Slowing,
    Idle,
}

impl ActivityStatus {
    fn from_silence(silence: Option<Duration>) -> Self {
        match silence {
            Some(silence) if silence < ACTIVE_WITHIN => Self::Active,
            Some(silence) if silence < SLOWING_WITHIN => Self::Slowing,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "Active",
            Self::Slowing => "Slowing",
            Self::Idle => "Idle",
        })
    }
}

/// Live view of one slave.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SlaveRate {
    pub rate_hz: f64,
    pub period_ms: f64,
    pub message_count: u64,
    pub status: ActivityStatus,
    /// `None` if the slave was never seen.
    pub time_since_last: Option<Duration>,
    pub current_wave_messages: u32,
    pub total_waves: usize,
    pub average_messages_per_wave: f64,
    pub wave_status: WaveStatus,
}

/// Everything the monitor has learned about the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorState {
    wave_gap: Duration,
    filter: Option<BTreeSet<u8>>,
    slave_ids: BTreeSet<u8>,
    slave_stats: BTreeMap<u8, SlaveStats>,
    wave_stats: BTreeMap<u8, WaveStats>,
    protocols: DetectedProtocols,
    frames_captured: u64,
    frames_dropped: u64,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new(None, DEFAULT_WAVE_GAP)
    }
}

impl MonitorState {
    /// `filter` restricts tracking to the listed slave IDs; `None` tracks every
    /// slave that shows up.
    pub fn new(filter: Option<BTreeSet<u8>>, wave_gap: Duration) -> Self {
        Self {
            wave_gap,
            filter,
            slave_ids: BTreeSet::new(),
            slave_stats: BTreeMap::new(),
            wave_stats: BTreeMap::new(),
            protocols: DetectedProtocols::default(),
            frames_captured: 0,
            frames_dropped: 0,
        }
    }

    /// Updates the statistics with one captured frame.
    ///
    /// Returns a display event when the frame counted as a new poll.
    pub fn process_frame(&mut self, frame: &CapturedFrame) -> Option<FrameEvent> {
        self.frames_captured += 1;
        let Some(kind) = classify_frame(&frame.bytes) else {
            self.frames_dropped += 1;
            debug!("Dropping noise: {}", frame::to_hex(&frame.bytes));
            return None;
        };
        self.protocols.mark(kind);

        let slave_id = frame.bytes[0];
        if let Some(filter) = &self.filter {
            if !filter.contains(&slave_id) {
                return None;
            }
        }
        if self.slave_ids.insert(slave_id) {
            info!("Discovered new slave ID: {slave_id}");
        }

        self.wave_stats
            .entry(slave_id)
            .or_default()
            .record(frame.captured_at, self.wave_gap);
        let interval = self
            .slave_stats
            .entry(slave_id)
            .or_default()
            .record(frame.captured_at)?;

        Some(FrameEvent {
            timestamp: frame.timestamp,
            slave_id,
            frame: frame::to_hex(&frame.bytes),
            length: frame.bytes.len(),
            interval,
        })
    }

    /// Per-slave rates as seen at `now` (transport clock).
    ///
    /// Covers every discovered slave plus the ones named in the filter.
    pub fn current_rates(&self, now: Instant) -> BTreeMap<u8, SlaveRate> {
        let filtered = self.filter.iter().flatten();
        self.slave_ids
            .iter()
            .chain(filtered)
            .map(|&slave_id| (slave_id, self.rate_of(slave_id, now)))
            .collect()
    }

    fn rate_of(&self, slave_id: u8, now: Instant) -> SlaveRate {
        let default_stats = SlaveStats::default();
        let default_waves = WaveStats::default();
        let stats = self.slave_stats.get(&slave_id).unwrap_or(&default_stats);
        let waves = self.wave_stats.get(&slave_id).unwrap_or(&default_waves);

        let time_since_last = stats
            .last_seen()
            .map(|last_seen| now.saturating_duration_since(last_seen));
        SlaveRate {
            rate_hz: stats.rate_hz(),
            period_ms: stats
                .average_interval()
                .map_or(0.0, |period| period.as_secs_f64() * 1000.0),
            message_count: stats.count(),
            status: ActivityStatus::from_silence(time_since_last),
            time_since_last,
            current_wave_messages: waves.current_wave_messages(),
            total_waves: waves.total_waves(),
            average_messages_per_wave: waves.average_messages_per_wave(),
            wave_status: waves.status(now, self.wave_gap),
        }
    }

    pub fn protocols(&self) -> DetectedProtocols {
        self.protocols
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocols.name()
    }

    pub fn wave_gap(&self) -> Duration {
        self.wave_gap
    }

    /// Slave IDs seen on the bus (after filtering).
    pub fn slave_ids(&self) -> &BTreeSet<u8> {
        &self.slave_ids
    }

    pub fn slave_stats(&self, slave_id: u8) -> Option<&SlaveStats> {
        self.slave_stats.get(&slave_id)
    }

    pub fn wave_stats(&self, slave_id: u8) -> Option<&WaveStats> {
        self.wave_stats.get(&slave_id)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

fn read_state(state: &RwLock<MonitorState>) -> RwLockReadGuard<'_, MonitorState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &RwLock<MonitorState>) -> RwLockWriteGuard<'_, MonitorState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

fn cut_frame(frames: &mut Vec<CapturedFrame>, buffer: &mut Vec<u8>, captured_at: Instant) {
    if buffer.len() >= MIN_FRAME_LEN {
        frames.push(CapturedFrame {
            bytes: std::mem::take(buffer),
            captured_at,
            timestamp: SystemTime::now(),
        });
    } else {
        buffer.clear();
    }
}

/// Receive-only monitor on top of a [`Transport`].
pub struct PassiveMonitor<T> {
    transport: T,
    config: Option<SerialConfig>,
    state: Arc<RwLock<MonitorState>>,
    /// Bytes received after the last full batch, with the time of their last byte.
    carried: Option<(Vec<u8>, Instant)>,
}

impl<T: Transport> PassiveMonitor<T> {
    pub fn new(transport: T) -> Self {
        Self::with_state(transport, MonitorState::default())
    }

    pub fn with_state(transport: T, state: MonitorState) -> Self {
        Self {
            transport,
            config: None,
            state: Arc::new(RwLock::new(state)),
            carried: None,
        }
    }

    /// Opens the line in receive-only mode.
    pub fn setup_passive_mode(
        &mut self,
        port: &str,
        baud_rate: BaudRate,
        timeout: Duration,
    ) -> Result<()> {
        let config = SerialConfig::passive(port, baud_rate, timeout);
        self.transport.open(&config)?;
        self.transport.clear_input()?;
        self.carried = None;
        info!("Listening on {port} at {baud_rate} baud");
        self.config = Some(config);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.close();
        self.config = None;
        self.carried = None;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn config(&self) -> Option<&SerialConfig> {
        self.config.as_ref()
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> MonitorState {
        read_state(&self.state).clone()
    }

    /// Gives the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Reads frames until `max_frames` are collected or `timeout` expires.
    ///
    /// A frame ends at a silence longer than the inter-frame timeout. Bytes still
    /// buffered when the timeout expires form the last frame. Bytes buffered when
    /// the batch is full start the next call instead, so at most `max_frames` are
    /// returned. Chunks shorter than [`MIN_FRAME_LEN`] are dropped.
    pub fn capture_frames(
        &mut self,
        max_frames: usize,
        timeout: Duration,
    ) -> Result<Vec<CapturedFrame>> {
        let frame_timeout = self
            .config
            .as_ref()
            .map_or(FALLBACK_FRAME_TIMEOUT, SerialConfig::inter_frame_timeout);
        let transport = &mut self.transport;
        let start = transport.now();
        let (mut buffer, mut last_byte) = self.carried.take().unwrap_or((Vec::new(), start));
        let mut frames = Vec::new();

        while transport.now().duration_since(start) < timeout && frames.len() < max_frames {
            let waiting = transport.bytes_available()?;
            let chunk = if waiting > 0 {
                transport.read(waiting)?
            } else {
                Vec::new()
            };
            let gap = transport.now().duration_since(last_byte);
            if !chunk.is_empty() {
                if !buffer.is_empty() && gap > frame_timeout {
                    cut_frame(&mut frames, &mut buffer, last_byte);
                }
                buffer.extend_from_slice(&chunk);
                last_byte = transport.now();
            } else if !buffer.is_empty() && gap > frame_timeout {
                cut_frame(&mut frames, &mut buffer, last_byte);
            }
            transport.sleep(POLL_INTERVAL);
        }
        if frames.len() < max_frames {
            cut_frame(&mut frames, &mut buffer, last_byte);
        } else if !buffer.is_empty() {
            self.carried = Some((buffer, last_byte));
        }
        Ok(frames)
    }

    /// Listens at each candidate baud rate and returns the first one carrying at
    /// least two valid frames. The line is closed afterwards.
    pub fn auto_detect_baudrate(&mut self, port: &str, candidates: &[BaudRate]) -> Option<BaudRate> {
        for &baud_rate in candidates {
            if let Err(err) = self.setup_passive_mode(port, baud_rate, DETECT_TIMEOUT) {
                warn!("Can not listen at {baud_rate} baud: {err}");
                continue;
            }

            let start = self.transport.now();
            let mut valid_frames = 0;
            while self.transport.now().duration_since(start) < DETECT_LISTEN {
                let frames = match self.capture_frames(DETECT_BATCH_FRAMES, DETECT_BATCH_TIMEOUT) {
                    Ok(frames) => frames,
                    Err(err) => {
                        warn!("Capture failed at {baud_rate} baud: {err}");
                        break;
                    }
                };
                let mut state = write_state(&self.state);
                for frame in &frames {
                    if let Some(kind) = classify_frame(&frame.bytes) {
                        state.protocols.mark(kind);
                        valid_frames += 1;
                    }
                }
            }
            self.disconnect();

            if valid_frames >= DETECT_MIN_VALID_FRAMES {
                info!("Detected {baud_rate} baud ({valid_frames} valid frames)");
                return Some(baud_rate);
            }
            debug!("No valid data at {baud_rate} baud");
        }
        warn!("Could not detect the baud rate on {port}");
        None
    }
}

impl<T: Transport + 'static> PassiveMonitor<T> {
    /// Starts the worker thread. The line has to be open.
    pub fn start(self) -> Result<MonitorHandle<T>> {
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }
        let state = self.state.clone();
        let keep_running = Arc::new(AtomicBool::new(true));
        let (sender, events) = mpsc::channel();
        let worker = {
            let keep_running = keep_running.clone();
            std::thread::Builder::new()
                .name(String::from("rs485-monitor"))
                .spawn(move || self.run(&keep_running, &sender))?
        };
        Ok(MonitorHandle {
            state,
            events,
            keep_running,
            worker,
        })
    }

    fn run(mut self, keep_running: &AtomicBool, sender: &Sender<FrameEvent>) -> Self {
        info!("Starting passive monitoring");
        while keep_running.load(Ordering::Relaxed) {
            let frames = match self.capture_frames(BATCH_FRAMES, BATCH_TIMEOUT) {
                Ok(frames) => frames,
                Err(err) => {
                    error!("Monitoring stopped: {err}");
                    break;
                }
            };
            for frame in &frames {
                if !keep_running.load(Ordering::Relaxed) {
                    break;
                }
                let event = write_state(&self.state).process_frame(frame);
                if let Some(event) = event {
                    // a dropped receiver only means nobody is watching
                    let _ = sender.send(event);
                }
            }
            self.transport.sleep(BATCH_PAUSE);
        }
        info!("Monitoring stopped");
        self
    }
}

/// Control of a running monitor.
pub struct MonitorHandle<T> {
    state: Arc<RwLock<MonitorState>>,
    events: Receiver<FrameEvent>,
    keep_running: Arc<AtomicBool>,
    worker: JoinHandle<PassiveMonitor<T>>,
}

impl<T> MonitorHandle<T> {
    /// Events of counted polls, in capture order.
    pub fn events(&self) -> &Receiver<FrameEvent> {
        &self.events
    }

    /// A copy of the current state. It may lag the bus by one batch.
    pub fn snapshot(&self) -> MonitorState {
        read_state(&self.state).clone()
    }

    /// Rates as of now, for a monitor on a real serial port.
    pub fn current_rates(&self) -> BTreeMap<u8, SlaveRate> {
        read_state(&self.state).current_rates(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Asks the worker to stop and waits for it. Returns the monitor unless the
    /// worker panicked.
    pub fn stop(self) -> Option<PassiveMonitor<T>> {
        self.keep_running.store(false, Ordering::Relaxed);
        self.join()
    }

    /// Waits until the worker ends on its own, e.g. because the port went away.
    pub fn join(self) -> Option<PassiveMonitor<T>> {
        match self.worker.join() {
            Ok(monitor) => Some(monitor),
            Err(_) => {
                error!("Monitor worker panicked");
                None
            }
        }
    }
}
