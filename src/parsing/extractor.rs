//! Turns one status line into typed register updates.
//!
//! Every label is matched independently and case-insensitively, so a line may
//! update several channels. A label whose value does not parse as a number is
//! dropped without touching any register.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::filter::MovingAverage;
use crate::recording::registers::{Channel, RegisterChange, Registers};

/// Affine map from sensor current (mA) to pressure (PSIG) on the current-loop
/// transducer: `max(0, 62.50 * mA - 250.0 - 5)`.
const PRESSURE_PER_MA: f64 = 62.50;
const PRESSURE_OFFSET: f64 = 250.0;
const PRESSURE_TRIM: f64 = 5.0;

pub fn pressure_from_current(current_ma: f64) -> f64 {
    (PRESSURE_PER_MA * current_ma - PRESSURE_OFFSET - PRESSURE_TRIM).max(0.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Label {
    CurrentWeight,
    AvgWeight,
    BusVoltage,
    ShuntVoltage,
    LoadVoltage,
    Current,
    Power,
    Psi,
    Weight,
}

impl Label {
    pub fn text(self) -> &'static str {
        match self {
            Label::CurrentWeight => "Current Weight:",
            Label::AvgWeight => "AvgWeight:",
            Label::BusVoltage => "Bus Voltage:",
            Label::ShuntVoltage => "Shunt Voltage:",
            Label::LoadVoltage => "Load Voltage:",
            Label::Current => "Current:",
            Label::Power => "Power:",
            Label::Psi => "Psi:",
            Label::Weight => "Weight:",
        }
    }

    pub fn channel(self) -> Channel {
        match self {
            Label::CurrentWeight | Label::Weight | Label::Current => Channel::Primary,
            Label::AvgWeight => Channel::PrimaryAverage,
            Label::BusVoltage => Channel::BusVoltage,
            Label::ShuntVoltage => Channel::ShuntVoltage,
            Label::LoadVoltage => Channel::LoadVoltage,
            Label::Power => Channel::Power,
            Label::Psi => Channel::Secondary,
        }
    }

    /// Longest first: a shorter label nested inside a longer one ("Weight:" in
    /// "Current Weight:") only matches where the longer one did not.
    const BY_PRIORITY: [Label; 9] = [
        Label::CurrentWeight,
        Label::ShuntVoltage,
        Label::LoadVoltage,
        Label::BusVoltage,
        Label::AvgWeight,
        Label::Current,
        Label::Weight,
        Label::Power,
        Label::Psi,
    ];
}

/// One parsed `label: number` field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldUpdate {
    pub label: Label,
    pub value: f64,
}

/// The compiled label patterns. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LineGrammar {
    patterns: Vec<(Label, Regex)>,
}

impl LineGrammar {
    pub fn compile() -> Result<Self, regex::Error> {
        let patterns = Label::BY_PRIORITY
            .iter()
            .map(|label| {
                let pattern = format!(
                    r"(?i){}\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)",
                    regex::escape(label.text())
                );
                Regex::new(&pattern).map(|re| (*label, re))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Every field the line carries, in label priority order.
    pub fn extract(&self, line: &str) -> Vec<FieldUpdate> {
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut updates = Vec::new();

        for (label, re) in &self.patterns {
            let hit = re.captures_iter(line).find_map(|caps| {
                let whole = caps.get(0)?;
                let span = (whole.start(), whole.end());
                let overlaps = claimed.iter().any(|(s, e)| span.0 < *e && *s < span.1);
                (!overlaps).then(|| (span, caps.get(1).map(|m| m.as_str())))
            });

            let Some((span, raw)) = hit else {
                continue;
            };
            claimed.push(span);

            match raw.map(str::parse::<f64>) {
                Some(Ok(value)) if value.is_finite() => updates.push(FieldUpdate {
                    label: *label,
                    value,
                }),
                _ => log::trace!("dropping unparseable {:?} field in {:?}", label, line),
            }
        }

        updates
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolVariant {
    /// HX711 firmware: `Current Weight:` / `AvgWeight:` lines, grams.
    LoadCell,
    /// INA219 firmware: voltages, `Current:` in mA, `Power:`, optional `Psi:`.
    #[default]
    CurrentSensor,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorConfig {
    pub variant: ProtocolVariant,
    pub derive_pressure_from_current: bool,
    pub average_window: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::CurrentSensor,
            derive_pressure_from_current: true,
            average_window: super::filter::DEFAULT_WINDOW,
        }
    }
}

/// Applies parsed fields to the registers and owns the smoothing windows.
///
/// One instance per connection: the windows survive across recording sessions
/// and start empty when a new link is acquired.
pub struct ReadingExtractor {
    grammar: LineGrammar,
    config: ExtractorConfig,
    secondary_window: MovingAverage,
    primary_window: MovingAverage,
}

impl ReadingExtractor {
    pub fn new(grammar: LineGrammar, config: ExtractorConfig) -> Self {
        Self {
            grammar,
            config,
            secondary_window: MovingAverage::new(config.average_window),
            primary_window: MovingAverage::new(config.average_window),
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Number of raw pressure readings currently in the smoothing window.
    pub fn secondary_window_len(&self) -> usize {
        self.secondary_window.len()
    }

    /// Parses `line` and writes the result into `regs`, returning the slots
    /// whose value changed. Blank lines are ignored.
    pub fn process_line(&mut self, line: &str, regs: &mut Registers) -> Vec<RegisterChange> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let updates = self.grammar.extract(line);
        let mut changes = Vec::new();
        let mut direct_pressure = false;
        let mut current_ma = None;

        for update in &updates {
            match update.label.channel() {
                Channel::Secondary => {
                    direct_pressure = true;
                    self.write_secondary(update.value, regs, &mut changes);
                }
                Channel::Primary => {
                    if update.label == Label::Current {
                        current_ma = Some(update.value);
                    }
                    changes.extend(regs.set(Channel::Primary, update.value));
                    if self.config.variant == ProtocolVariant::CurrentSensor {
                        let avg = self.primary_window.push(update.value);
                        changes.extend(regs.set(Channel::PrimaryAverage, avg));
                    }
                }
                channel => changes.extend(regs.set(channel, update.value)),
            }
        }

        if self.config.derive_pressure_from_current && !direct_pressure {
            if let Some(current) = current_ma {
                self.write_secondary(pressure_from_current(current), regs, &mut changes);
            }
        }

        changes
    }

    fn write_secondary(&mut self, value: f64, regs: &mut Registers, changes: &mut Vec<RegisterChange>) {
        changes.extend(regs.set(Channel::Secondary, value));
        let avg = self.secondary_window.push(value);
        changes.extend(regs.set(Channel::SecondaryAverage, avg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(variant: ProtocolVariant, derive: bool) -> ReadingExtractor {
        ReadingExtractor::new(
            LineGrammar::compile().unwrap(),
            ExtractorConfig {
                variant,
                derive_pressure_from_current: derive,
                average_window: 10,
            },
        )
    }

    #[test]
    fn test_current_line_derives_pressure() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, true);
        let mut regs = Registers::default();
        ex.process_line("Current: 12.5", &mut regs);

        assert_eq!(regs.primary, 12.5);
        assert_eq!(regs.secondary, 526.25);
        assert_eq!(regs.secondary_average, 526.25);
    }

    #[test]
    fn test_derived_pressure_clamps_at_zero() {
        assert_eq!(pressure_from_current(0.0), 0.0);
        assert_eq!(pressure_from_current(4.0), 0.0);
        assert_eq!(pressure_from_current(5.0), 57.5);
    }

    #[test]
    fn test_direct_psi_suppresses_fallback_on_same_line() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, true);
        let mut regs = Registers::default();
        ex.process_line("Psi: 30.0", &mut regs);
        assert_eq!(regs.secondary, 30.0);

        ex.process_line("Current: 10.0 Psi: 12.0", &mut regs);
        assert_eq!(regs.primary, 10.0);
        assert_eq!(regs.secondary, 12.0);
        assert_eq!(ex.secondary_window_len(), 2);
    }

    #[test]
    fn test_fallback_is_per_line_not_per_session() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, true);
        let mut regs = Registers::default();
        ex.process_line("Psi: 30.0", &mut regs);
        ex.process_line("Current: 8.0", &mut regs);
        assert_eq!(regs.secondary, pressure_from_current(8.0));
    }

    #[test]
    fn test_unparseable_value_is_dropped() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, true);
        let mut regs = Registers::default();
        ex.process_line("Psi: 20.0", &mut regs);

        assert!(ex.process_line("Psi: --", &mut regs).is_empty());
        assert!(ex.process_line("Psi: .", &mut regs).is_empty());
        assert_eq!(regs.secondary, 20.0);
        assert_eq!(ex.secondary_window_len(), 1);
        assert!(ex.process_line("garbage", &mut regs).is_empty());
        assert!(ex.process_line("   ", &mut regs).is_empty());
    }

    #[test]
    fn test_value_is_longest_numeric_prefix() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, true);
        let mut regs = Registers::default();

        ex.process_line("Psi: 30.0.", &mut regs);
        assert_eq!(regs.secondary, 30.0);

        ex.process_line("Psi: 1.2.3", &mut regs);
        assert_eq!(regs.secondary, 1.2);

        ex.process_line("Psi: .5 psi", &mut regs);
        assert_eq!(regs.secondary, 0.5);

        ex.process_line("Current: 12.5.", &mut regs);
        assert_eq!(regs.primary, 12.5);
        assert_eq!(regs.secondary, 526.25);
    }

    #[test]
    fn test_labels_are_case_insensitive() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, false);
        let mut regs = Registers::default();
        ex.process_line("BUS VOLTAGE: 4.98 V", &mut regs);
        ex.process_line("shunt voltage:0.25 mV", &mut regs);
        ex.process_line("Load Voltage:  5.23", &mut regs);
        ex.process_line("power: 42.5 mW", &mut regs);

        assert_eq!(regs.bus_voltage, 4.98);
        assert_eq!(regs.shunt_voltage, 0.25);
        assert_eq!(regs.load_voltage, 5.23);
        assert_eq!(regs.power, 42.5);
        assert_eq!(regs.secondary, 0.0);
    }

    #[test]
    fn test_nested_weight_label_does_not_double_match() {
        let grammar = LineGrammar::compile().unwrap();
        let fields = grammar.extract("Current Weight: 101.5 AvgWeight: 99.0");
        assert_eq!(
            fields,
            vec![
                FieldUpdate { label: Label::CurrentWeight, value: 101.5 },
                FieldUpdate { label: Label::AvgWeight, value: 99.0 },
            ]
        );

        let fields = grammar.extract("Weight: 3.5");
        assert_eq!(fields, vec![FieldUpdate { label: Label::Weight, value: 3.5 }]);
    }

    #[test]
    fn test_load_cell_uses_device_average() {
        let mut ex = extractor(ProtocolVariant::LoadCell, false);
        let mut regs = Registers::default();
        ex.process_line("Current Weight: 250.00 g", &mut regs);
        assert_eq!(regs.primary, 250.0);
        assert_eq!(regs.primary_average, 0.0);

        ex.process_line("AvgWeight: 248.75", &mut regs);
        assert_eq!(regs.primary_average, 248.75);
    }

    #[test]
    fn test_current_sensor_smooths_primary() {
        let mut ex = extractor(ProtocolVariant::CurrentSensor, false);
        let mut regs = Registers::default();
        ex.process_line("Current: 10.0", &mut regs);
        ex.process_line("Current: 20.0", &mut regs);
        assert_eq!(regs.primary, 20.0);
        assert_eq!(regs.primary_average, 15.0);
    }

    #[test]
    fn test_repeated_value_reports_no_change() {
        let mut ex = extractor(ProtocolVariant::LoadCell, false);
        let mut regs = Registers::default();
        assert_eq!(ex.process_line("Weight: 5", &mut regs).len(), 1);
        assert!(ex.process_line("Weight: 5", &mut regs).is_empty());
    }
}
