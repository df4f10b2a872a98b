//! Polling and wave statistics of the passive monitor, one pair per slave.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Frames closer together than this belong to the same poll.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Number of intervals and waves kept per slave.
pub const HISTORY_LEN: usize = 100;

fn push_bounded<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(value);
}

fn mean(values: impl Iterator<Item = Duration>) -> Option<Duration> {
    let (sum, count) = values.fold((Duration::ZERO, 0u32), |(sum, count), value| {
        (sum + value, count + 1)
    });
    (count > 0).then(|| sum / count)
}

/// Poll intervals of one slave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveStats {
    count: u64,
    last_seen: Option<Instant>,
    intervals: VecDeque<Duration>,
    min_interval: Option<Duration>,
    max_interval: Option<Duration>,
}

impl SlaveStats {
    /// Records a frame seen at `at`.
    ///
    /// Returns the poll interval when the frame counts as a new poll: zero for the
    /// first frame, `None` for frames within [`MIN_POLL_INTERVAL`] of the last poll.
    /// Such frames leave the statistics untouched.
    pub fn record(&mut self, at: Instant) -> Option<Duration> {
        let Some(last_seen) = self.last_seen else {
            self.count = 1;
            self.last_seen = Some(at);
            return Some(Duration::ZERO);
        };
        let interval = at.saturating_duration_since(last_seen);
        if interval < MIN_POLL_INTERVAL {
            return None;
        }
        push_bounded(&mut self.intervals, interval);
        self.min_interval = Some(self.min_interval.map_or(interval, |min| min.min(interval)));
        self.max_interval = Some(self.max_interval.map_or(interval, |max| max.max(interval)));
        self.count += 1;
        self.last_seen = Some(at);
        Some(interval)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// The retained intervals, oldest first.
    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.intervals.iter().copied()
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval
    }

    /// Mean of the retained positive intervals.
    pub fn average_interval(&self) -> Option<Duration> {
        mean(self.intervals().filter(|interval| !interval.is_zero()))
    }

    /// Polls per second, `0.0` without intervals.
    pub fn rate_hz(&self) -> f64 {
        self.average_interval()
            .map_or(0.0, |period| 1.0 / period.as_secs_f64())
    }
}

/// A closed burst of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wave {
    pub start: Instant,
    /// Time of the last message of the wave.
    pub end: Instant,
    pub message_count: u32,
}

impl Wave {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Where a slave stands relative to its bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WaveStatus {
    InWave,
    WaveEnding,
    BetweenWaves,
}

impl fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InWave => "In Wave",
            Self::WaveEnding => "Wave Ending",
            Self::BetweenWaves => "Between Waves",
        })
    }
}

/// Burst detection of one slave.
///
/// Unlike [`SlaveStats`] every frame counts here, including the ones that follow
/// each other within [`MIN_POLL_INTERVAL`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveStats {
    waves: VecDeque<Wave>,
    current_start: Option<Instant>,
    current_messages: u32,
    last_message: Option<Instant>,
    wave_intervals: VecDeque<Duration>,
    min_wave_interval: Option<Duration>,
    max_wave_interval: Option<Duration>,
}

impl WaveStats {
    /// Records a message at `at`. A silence longer than `gap_threshold` closes the
    /// open wave and starts a new one.
    pub fn record(&mut self, at: Instant, gap_threshold: Duration) {
        match self.last_message {
            Some(last) if at.saturating_duration_since(last) > gap_threshold => {
                if let Some(start) = self.current_start {
                    self.close_wave(start, last);
                }
                self.current_start = Some(at);
                self.current_messages = 1;
            }
            Some(_) => self.current_messages += 1,
            None => {
                self.current_start = Some(at);
                self.current_messages = 1;
            }
        }
        self.last_message = Some(at);
    }

    fn close_wave(&mut self, start: Instant, end: Instant) {
        let previous_start = self.waves.back().map(|wave| wave.start);
        push_bounded(
            &mut self.waves,
            Wave {
                start,
                end,
                message_count: self.current_messages,
            },
        );
        if let Some(previous_start) = previous_start {
            let interval = start.saturating_duration_since(previous_start);
            push_bounded(&mut self.wave_intervals, interval);
            self.min_wave_interval =
                Some(self.min_wave_interval.map_or(interval, |min| min.min(interval)));
            self.max_wave_interval =
                Some(self.max_wave_interval.map_or(interval, |max| max.max(interval)));
        }
    }

    /// The retained closed waves, oldest first.
    pub fn waves(&self) -> impl Iterator<Item = &Wave> + '_ {
        self.waves.iter()
    }

    pub fn total_waves(&self) -> usize {
        self.waves.len()
    }

    /// Start of the open wave.
    pub fn current_wave_start(&self) -> Option<Instant> {
        self.current_start
    }

    /// Messages in the open wave.
    pub fn current_wave_messages(&self) -> u32 {
        self.current_messages
    }

    pub fn last_message(&self) -> Option<Instant> {
        self.last_message
    }

    pub fn wave_intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.wave_intervals.iter().copied()
    }

    pub fn average_wave_interval(&self) -> Option<Duration> {
        mean(self.wave_intervals())
    }

    pub fn min_wave_interval(&self) -> Option<Duration> {
        self.min_wave_interval
    }

    pub fn max_wave_interval(&self) -> Option<Duration> {
        self.max_wave_interval
    }

    /// Mean message count of the retained closed waves, `0.0` without waves.
    pub fn average_messages_per_wave(&self) -> f64 {
        if self.waves.is_empty() {
            return 0.0;
        }
        let total: u64 = self.waves.iter().map(|wave| wave.message_count as u64).sum();
        total as f64 / self.waves.len() as f64
    }

    pub fn status(&self, now: Instant, gap_threshold: Duration) -> WaveStatus {
        match self.last_message {
            Some(last) if now.saturating_duration_since(last) < gap_threshold => WaveStatus::InWave,
            Some(last) if now.saturating_duration_since(last) < gap_threshold * 3 => {
                WaveStatus::WaveEnding
            }
            _ => WaveStatus::BetweenWaves,
        }
    }
}
