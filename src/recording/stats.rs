use serde::Serialize;

use super::registers::Registers;
use super::state::ReadingRecord;

/// Running figures shown next to the charts while a session records.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub max_primary: f64,
    pub max_secondary: f64,
    pub duration_secs: f64,
}

impl SessionStats {
    /// Seeds the maxima from the registers captured at `start()`.
    pub fn seeded(baseline: &Registers) -> Self {
        Self {
            max_primary: baseline.primary,
            max_secondary: baseline.secondary,
            duration_secs: 0.0,
        }
    }

    pub fn observe(&mut self, record: &ReadingRecord) {
        self.max_primary = self.max_primary.max(record.primary_value);
        if let Some(secondary) = record.secondary_value {
            self.max_secondary = self.max_secondary.max(secondary);
        }
        self.duration_secs = record.elapsed_seconds;
    }
}

/// Range and mean of one channel across a buffer.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub points: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl ChannelSummary {
    pub fn has_data(&self) -> bool {
        self.points > 0
    }
}

pub fn summarize<I>(values: I) -> ChannelSummary
where
    I: IntoIterator<Item = f64>,
{
    let mut summary = ChannelSummary {
        points: 0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        mean: 0.0,
    };
    let mut sum = 0.0;
    for v in values {
        summary.points += 1;
        summary.min = summary.min.min(v);
        summary.max = summary.max.max(v);
        sum += v;
    }
    if summary.points == 0 {
        return ChannelSummary::default();
    }
    summary.mean = sum / summary.points as f64;
    summary
}

/// Pressure diagnostics: only samples with a strictly positive reading count,
/// so the zero a silent channel reads as does not drag the range down.
pub fn summarize_secondary(records: &[ReadingRecord]) -> ChannelSummary {
    summarize(
        records
            .iter()
            .filter_map(|r| r.secondary_value)
            .filter(|v| *v > 0.0),
    )
}

pub fn summarize_primary(records: &[ReadingRecord]) -> ChannelSummary {
    summarize(records.iter().map(|r| r.primary_value))
}

/// `mm:ss.s`, e.g. `01:05.3` for 65.3 seconds.
pub fn format_elapsed(seconds: f64) -> String {
    let tenths = (seconds.max(0.0) * 10.0).round() as u64;
    let minutes = tenths / 600;
    let rem = (tenths % 600) as f64 / 10.0;
    format!("{:02}:{:04.1}", minutes, rem)
}
