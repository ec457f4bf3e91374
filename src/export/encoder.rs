//! CSV rendering of a recorded session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DashError, Result};
use crate::recording::ReadingRecord;
use crate::utils::fixed::to_fixed;

pub const EMPTY_BUFFER_MESSAGE: &str = "No data available to export";

/// One exported channel. Each kind becomes its own document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportKind {
    Force,
    Pressure,
}

impl ExportKind {
    pub fn header(self) -> [&'static str; 3] {
        match self {
            ExportKind::Force => ["Time (s)", "Weight (g)", "Average Weight (g)"],
            ExportKind::Pressure => ["Time (s)", "Pressure (PSIG)", "Average Pressure (PSIG)"],
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            ExportKind::Force => "sensor",
            ExportKind::Pressure => "pressure",
        }
    }
}

/// Which channels an export action writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportSelection {
    Force,
    Pressure,
    #[default]
    Both,
}

impl ExportSelection {
    pub fn kinds(self) -> &'static [ExportKind] {
        match self {
            ExportSelection::Force => &[ExportKind::Force],
            ExportSelection::Pressure => &[ExportKind::Pressure],
            ExportSelection::Both => &[ExportKind::Force, ExportKind::Pressure],
        }
    }

    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "force" | "weight" => Some(ExportSelection::Force),
            "pressure" | "psi" => Some(ExportSelection::Pressure),
            "both" | "all" => Some(ExportSelection::Both),
            _ => None,
        }
    }
}

/// Decimal places per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFormat {
    pub time_decimals: usize,
    pub primary_decimals: usize,
    pub secondary_decimals: usize,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self {
            time_decimals: 1,
            primary_decimals: 2,
            secondary_decimals: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvDocument {
    pub kind: ExportKind,
    pub filename: String,
    pub contents: String,
}

/// `<kind>_data_<ISO-8601 with ':' and '.' replaced by '-'>.csv`
pub fn export_filename(kind: ExportKind, at: DateTime<Utc>) -> String {
    let stamp = at
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-");
    format!("{}_data_{}.csv", kind.file_prefix(), stamp)
}

/// Renders one document per selected channel.
///
/// Fails when there is nothing recorded. A pressure document is skipped when
/// no record carries a secondary value, unless it is the only one requested.
pub fn encode(
    records: &[ReadingRecord],
    selection: ExportSelection,
    format: ExportFormat,
    at: DateTime<Utc>,
) -> Result<Vec<CsvDocument>> {
    if records.is_empty() {
        return Err(DashError::Export(EMPTY_BUFFER_MESSAGE.into()));
    }

    let mut documents = Vec::new();
    for &kind in selection.kinds() {
        let rows = rows_for(records, kind, format);
        if rows.is_empty() {
            if selection.kinds().len() == 1 {
                return Err(DashError::Export(EMPTY_BUFFER_MESSAGE.into()));
            }
            continue;
        }
        documents.push(CsvDocument {
            kind,
            filename: export_filename(kind, at),
            contents: render(kind.header(), &rows)?,
        });
    }
    Ok(documents)
}

fn rows_for(records: &[ReadingRecord], kind: ExportKind, format: ExportFormat) -> Vec<[String; 3]> {
    let time = |r: &ReadingRecord| to_fixed(r.elapsed_seconds, format.time_decimals);
    match kind {
        ExportKind::Force => records
            .iter()
            .map(|r| {
                [
                    time(r),
                    to_fixed(r.primary_value, format.primary_decimals),
                    to_fixed(r.primary_average, format.primary_decimals),
                ]
            })
            .collect(),
        ExportKind::Pressure => records
            .iter()
            .filter_map(|r| {
                let value = r.secondary_value?;
                let average = r.secondary_average.unwrap_or(value);
                Some([
                    time(r),
                    to_fixed(value, format.secondary_decimals),
                    to_fixed(average, format.secondary_decimals),
                ])
            })
            .collect(),
    }
}

fn render(header: [&str; 3], rows: &[[String; 3]]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| DashError::Export(format!("Failed to export data: {}", err.error())))?;
    String::from_utf8(bytes)
        .map_err(|err| DashError::Export(format!("Failed to export data: {err}")))
}
