//! A software stand-in for the sensor rig.
//!
//! Emits the same status lines the firmware prints, cut into randomly sized
//! chunks the way a USB-serial adapter delivers them, and honours the tare
//! and calibrate commands.

use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::link::{ChunkSource, CommandSink, PortLink, PortProvider, ReadOutcome};
use crate::commands::DeviceCommand;
use crate::error::{DashError, Result};
use crate::parsing::ProtocolVariant;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

const EMIT_PERIOD: Duration = Duration::from_millis(50);
const MAX_CHUNK: usize = 24;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub variant: ProtocolVariant,
    /// 0 seeds from entropy.
    pub seed: u64,
    /// Close the stream after this many lines, to exercise reconnects.
    pub unplug_after_lines: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::CurrentSensor,
            seed: 0,
            unplug_after_lines: None,
        }
    }
}

pub struct SimulatedProvider {
    config: SimulationConfig,
}

impl SimulatedProvider {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortProvider for SimulatedProvider {
    async fn acquire(&self) -> Result<PortLink> {
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let rig = SimulatedRig::new(self.config.clone());
        tokio::spawn(rig.run(chunk_tx, cmd_rx, cancel.clone()));
        log_info!("simulated rig online ({:?})", self.config.variant);

        Ok(PortLink {
            description: "simulated rig".into(),
            reader: Box::new(SimulatedReader {
                rx: chunk_rx,
                cancel,
            }),
            writer: Box::new(SimulatedWriter { tx: Some(cmd_tx) }),
        })
    }
}

/// Gain error of a freshly powered rig; `calibrate` removes it.
const UNCALIBRATED_GAIN: f64 = 1.25;

/// Signal model: a slow ramp with Gaussian-ish jitter around it.
struct SimulatedRig {
    config: SimulationConfig,
    rng: StdRng,
    phase: f64,
    /// Raw sensor value subtracted by the last tare.
    tare_offset: f64,
    scale: f64,
    /// Raw primary value of the most recent block, before tare and gain.
    last_raw: f64,
    weight_avg: f64,
    lines_sent: usize,
}

impl SimulatedRig {
    fn new(config: SimulationConfig) -> Self {
        let rng = if config.seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(config.seed)
        };
        Self {
            config,
            rng,
            phase: 0.0,
            tare_offset: 0.0,
            scale: UNCALIBRATED_GAIN,
            last_raw: 0.0,
            weight_avg: 0.0,
            lines_sent: 0,
        }
    }

    fn jitter(&mut self, amplitude: f64) -> f64 {
        // Sum of uniforms approximates a normal distribution.
        let s: f64 = (0..4).map(|_| self.rng.gen_range(-1.0..1.0)).sum();
        s * amplitude / 2.0
    }

    fn raw_signal(&mut self) -> f64 {
        self.phase += EMIT_PERIOD.as_secs_f64() * 0.2;
        0.5 * (1.0 - self.phase.cos())
    }

    fn reported(&self, raw: f64) -> f64 {
        (raw - self.tare_offset) * self.scale
    }

    fn next_block(&mut self) -> Vec<String> {
        let level = self.raw_signal();
        match self.config.variant {
            ProtocolVariant::LoadCell => {
                self.last_raw = level * 500.0 + self.jitter(1.5);
                let weight = self.reported(self.last_raw);
                self.weight_avg = 0.9 * self.weight_avg + 0.1 * weight;
                vec![
                    format!("Current Weight: {:.2} g", weight),
                    format!("AvgWeight: {:.2}", self.weight_avg),
                ]
            }
            ProtocolVariant::CurrentSensor => {
                self.last_raw = 4.0 + level * 16.0 + self.jitter(0.05);
                let current_ma = self.reported(self.last_raw);
                let shunt_mv = current_ma * 0.1;
                let bus_v = 5.0 + self.jitter(0.01);
                let load_v = bus_v + shunt_mv / 1000.0;
                vec![
                    format!("Bus Voltage:   {:.3} V", bus_v),
                    format!("Shunt Voltage: {:.3} mV", shunt_mv),
                    format!("Load Voltage:  {:.3} V", load_v),
                    format!("Current:       {:.6} mA", current_ma),
                    format!("Power:         {:.3} mW", bus_v * current_ma),
                    String::new(),
                ]
            }
        }
    }

    fn apply_command(&mut self, byte: u8) {
        match DeviceCommand::from_byte(byte) {
            Some(DeviceCommand::Tare) => {
                self.tare_offset = self.last_raw;
                self.weight_avg = 0.0;
                log_info!("simulated rig: tare at raw {:.3}", self.last_raw);
            }
            Some(DeviceCommand::Calibrate) => {
                self.scale = 1.0;
                log_info!("simulated rig: calibrated");
            }
            None => log_debug!("simulated rig ignoring byte {:#04x}", byte),
        }
    }

    async fn run(
        mut self,
        chunks: mpsc::Sender<Vec<u8>>,
        mut commands: mpsc::Receiver<u8>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(EMIT_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(byte) = commands.recv() => self.apply_command(byte),
                _ = ticker.tick() => {
                    let mut text = String::new();
                    for line in self.next_block() {
                        text.push_str(&line);
                        text.push_str("\r\n");
                        self.lines_sent += 1;
                    }
                    let bytes = text.into_bytes();
                    let mut start = 0;
                    while start < bytes.len() {
                        let len = self.rng.gen_range(1..=MAX_CHUNK).min(bytes.len() - start);
                        if chunks.send(bytes[start..start + len].to_vec()).await.is_err() {
                            return;
                        }
                        start += len;
                    }
                    if let Some(limit) = self.config.unplug_after_lines {
                        if self.lines_sent >= limit {
                            log_info!("simulated rig: unplugged after {} lines", self.lines_sent);
                            break;
                        }
                    }
                }
            }
        }
    }
}

struct SimulatedReader {
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

#[async_trait]
impl ChunkSource for SimulatedReader {
    async fn next_chunk(&mut self) -> ReadOutcome {
        match self.rx.recv().await {
            Some(bytes) => ReadOutcome::Data(bytes),
            None => ReadOutcome::Closed,
        }
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.rx.close();
        Ok(())
    }
}

struct SimulatedWriter {
    tx: Option<mpsc::Sender<u8>>,
}

#[async_trait]
impl CommandSink for SimulatedWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(DashError::NotConnected)?;
        for byte in bytes {
            tx.send(*byte)
                .await
                .map_err(|_| DashError::Command("simulated rig is offline".into()))?;
        }
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::{ExtractorConfig, LineGrammar, LineReassembler, ReadingExtractor};
    use crate::recording::Registers;

    /// Primary value reported by the rig's next block.
    fn next_primary(rig: &mut SimulatedRig) -> f64 {
        let mut extractor =
            ReadingExtractor::new(LineGrammar::compile().unwrap(), ExtractorConfig {
                variant: rig.config.variant,
                ..ExtractorConfig::default()
            });
        let mut regs = Registers::default();
        for line in rig.next_block() {
            extractor.process_line(&line, &mut regs);
        }
        regs.primary
    }

    fn rig_at_half_scale(variant: ProtocolVariant) -> SimulatedRig {
        let mut rig = SimulatedRig::new(SimulationConfig {
            variant,
            seed: 11,
            unplug_after_lines: None,
        });
        rig.phase = std::f64::consts::FRAC_PI_2;
        rig
    }

    #[test]
    fn test_tare_zeroes_load_cell_reading() {
        let mut rig = rig_at_half_scale(ProtocolVariant::LoadCell);
        let before = next_primary(&mut rig);
        assert!(before > 290.0, "uncalibrated weight {before}");

        rig.apply_command(b't');
        let after = next_primary(&mut rig);
        assert!(after.abs() < 15.0, "weight after tare {after}");
    }

    #[test]
    fn test_tare_zeroes_current_reading() {
        let mut rig = rig_at_half_scale(ProtocolVariant::CurrentSensor);
        let before = next_primary(&mut rig);
        assert!(before > 14.0, "uncalibrated current {before}");

        rig.apply_command(b't');
        let after = next_primary(&mut rig);
        assert!(after.abs() < 0.5, "current after tare {after}");
    }

    #[test]
    fn test_calibrate_removes_gain_error() {
        let mut rig = rig_at_half_scale(ProtocolVariant::LoadCell);
        let before = next_primary(&mut rig);

        rig.apply_command(b'c');
        let after = next_primary(&mut rig);

        assert!(before > 290.0, "uncalibrated weight {before}");
        assert!((240.0..270.0).contains(&after), "calibrated weight {after}");
    }

    #[test]
    fn test_unknown_command_byte_changes_nothing() {
        let mut rig = rig_at_half_scale(ProtocolVariant::LoadCell);
        rig.apply_command(b'x');
        assert_eq!(rig.scale, UNCALIBRATED_GAIN);
        assert_eq!(rig.tare_offset, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_lines_parse() {
        let provider = SimulatedProvider::new(SimulationConfig {
            seed: 7,
            ..SimulationConfig::default()
        });
        let mut link = provider.acquire().await.unwrap();
        let mut reassembler = LineReassembler::new();
        let mut extractor =
            ReadingExtractor::new(LineGrammar::compile().unwrap(), ExtractorConfig::default());
        let mut regs = Registers::default();

        let mut lines = 0;
        while lines < 12 {
            match link.reader.next_chunk().await {
                ReadOutcome::Data(bytes) => {
                    for line in reassembler.push(&bytes) {
                        extractor.process_line(&line, &mut regs);
                        lines += 1;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert!(regs.primary >= 3.5);
        assert!(regs.bus_voltage > 4.9);
        link.reader.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplug_closes_stream() {
        let provider = SimulatedProvider::new(SimulationConfig {
            variant: ProtocolVariant::LoadCell,
            seed: 3,
            unplug_after_lines: Some(4),
        });
        let mut link = provider.acquire().await.unwrap();
        let mut saw_close = false;
        for _ in 0..200 {
            if link.reader.next_chunk().await == ReadOutcome::Closed {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
    }
}
