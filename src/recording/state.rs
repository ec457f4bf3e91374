use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;

use super::registers::Registers;
use super::stats::{format_elapsed, SessionStats};
use crate::utils::fixed::to_fixed;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RecorderStatus {
    #[default]
    Idle,
    Recording,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    User,
    /// The link dropped while recording.
    ConnectionLost,
}

/// One sampled instant. Values are whatever the registers held at the tick,
/// not readings taken at that exact moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingRecord {
    pub elapsed_seconds: f64,
    /// `elapsed_seconds` rendered for display and export.
    pub timestamp_label: String,
    pub primary_value: f64,
    pub primary_average: f64,
    pub secondary_value: Option<f64>,
    pub secondary_average: Option<f64>,
}

impl ReadingRecord {
    pub fn new(
        elapsed_seconds: f64,
        label_decimals: usize,
        primary_value: f64,
        primary_average: f64,
        secondary_value: Option<f64>,
        secondary_average: Option<f64>,
    ) -> Self {
        Self {
            elapsed_seconds,
            timestamp_label: to_fixed(elapsed_seconds, label_decimals),
            primary_value,
            primary_average,
            secondary_value,
            secondary_average,
        }
    }

    pub fn from_registers(elapsed_seconds: f64, regs: &Registers, layout: &RecordLayout) -> Self {
        let (secondary_value, secondary_average) = if layout.track_secondary {
            (Some(regs.secondary), Some(regs.secondary_average))
        } else {
            (None, None)
        };
        Self::new(
            elapsed_seconds,
            layout.label_decimals,
            regs.primary,
            regs.primary_average,
            secondary_value,
            secondary_average,
        )
    }
}

/// Shape of the records a session produces.
#[derive(Debug, Clone, Copy)]
pub struct RecordLayout {
    pub live_capacity: usize,
    pub label_decimals: usize,
    pub track_secondary: bool,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            live_capacity: 200,
            label_decimals: 1,
            track_secondary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSnapshot {
    pub status: RecorderStatus,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub elapsed_secs: f64,
    pub elapsed_display: String,
    pub recorded_len: usize,
    pub live_len: usize,
    pub stats: SessionStats,
}

#[derive(Debug)]
pub struct RecorderState {
    pub status: RecorderStatus,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// Display clock; 0 whenever idle.
    pub elapsed_secs: f64,
    pub baseline: Registers,
    pub stats: SessionStats,
    layout: RecordLayout,
    running_anchor: Option<Instant>,
    live: VecDeque<ReadingRecord>,
    recorded: Vec<ReadingRecord>,
}

impl RecorderState {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            status: RecorderStatus::Idle,
            session_id: None,
            started_at: None,
            stopped_at: None,
            stop_reason: None,
            elapsed_secs: 0.0,
            baseline: Registers::default(),
            stats: SessionStats::default(),
            layout: RecordLayout {
                live_capacity: layout.live_capacity.max(1),
                ..layout
            },
            running_anchor: None,
            live: VecDeque::new(),
            recorded: Vec::new(),
        }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecorderStatus::Recording
    }

    /// Arms a new session, discarding the previous session's buffers.
    pub fn begin_session(
        &mut self,
        session_id: String,
        started_at: DateTime<Utc>,
        now: Instant,
        baseline: Registers,
    ) {
        self.status = RecorderStatus::Recording;
        self.session_id = Some(session_id);
        self.started_at = Some(started_at);
        self.stopped_at = None;
        self.stop_reason = None;
        self.elapsed_secs = 0.0;
        self.baseline = baseline;
        self.stats = SessionStats::seeded(&baseline);
        self.running_anchor = Some(now);
        self.live.clear();
        self.recorded.clear();
    }

    pub fn current_elapsed(&self, now: Instant) -> f64 {
        match (self.status, self.running_anchor) {
            (RecorderStatus::Recording, Some(anchor)) => {
                now.saturating_duration_since(anchor).as_secs_f64()
            }
            _ => 0.0,
        }
    }

    /// Appends one record built from `regs`. Returns `None` when idle, or when
    /// the clock has not moved past the previous sample.
    pub fn sample(&mut self, now: Instant, regs: &Registers) -> Option<ReadingRecord> {
        if !self.is_recording() {
            return None;
        }
        let elapsed = self.current_elapsed(now);
        if let Some(last) = self.recorded.last() {
            if elapsed <= last.elapsed_seconds {
                return None;
            }
        }

        let record = ReadingRecord::from_registers(elapsed, regs, &self.layout);
        self.elapsed_secs = elapsed;
        self.stats.observe(&record);
        self.recorded.push(record.clone());
        self.live.push_back(record.clone());
        while self.live.len() > self.layout.live_capacity {
            self.live.pop_front();
        }
        Some(record)
    }

    /// Freezes the recorded buffer. Returns false if nothing was recording.
    pub fn stop(&mut self, stopped_at: DateTime<Utc>, reason: StopReason) -> bool {
        if !self.is_recording() {
            return false;
        }
        self.status = RecorderStatus::Idle;
        self.stopped_at = Some(stopped_at);
        self.stop_reason = Some(reason);
        self.running_anchor = None;
        self.elapsed_secs = 0.0;
        true
    }

    pub fn recorded(&self) -> &[ReadingRecord] {
        &self.recorded
    }

    pub fn live(&self) -> impl Iterator<Item = &ReadingRecord> {
        self.live.iter()
    }

    pub fn snapshot(&self, now: Instant) -> RecorderSnapshot {
        let elapsed = self.current_elapsed(now);
        RecorderSnapshot {
            status: self.status,
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            stop_reason: self.stop_reason,
            elapsed_secs: elapsed,
            elapsed_display: format_elapsed(elapsed),
            recorded_len: self.recorded.len(),
            live_len: self.live.len(),
            stats: self.stats,
        }
    }
}
