use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::export::ExportFormat;
use crate::parsing::{ExtractorConfig, ProtocolVariant};
use crate::recording::RecordLayout;
use crate::serial::SupervisorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// `None` picks the first USB serial port.
    pub name: Option<String>,
    pub baud_rate: u32,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            name: None,
            baud_rate: 115_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub variant: ProtocolVariant,
    pub derive_pressure_from_current: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::CurrentSensor,
            derive_pressure_from_current: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub interval_ms: u64,
    pub live_window: usize,
    pub moving_average_window: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            live_window: 200,
            moving_average_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_read_retries: u32,
    pub backoff_ms: u64,
    pub reconnect_delay_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_read_retries: 3,
            backoff_ms: 500,
            reconnect_delay_ms: 3000,
            auto_reconnect: true,
            max_reconnect_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub directory: PathBuf,
    pub dual_channel: bool,
    pub time_decimals: usize,
    pub primary_decimals: usize,
    pub secondary_decimals: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            dual_channel: true,
            time_decimals: 1,
            primary_decimals: 2,
            secondary_decimals: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashSettings {
    pub port: PortSettings,
    pub protocol: ProtocolSettings,
    pub sampling: SamplingSettings,
    pub retry: RetrySettings,
    pub export: ExportSettings,
}

impl DashSettings {
    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            variant: self.protocol.variant,
            derive_pressure_from_current: self.protocol.derive_pressure_from_current,
            average_window: self.sampling.moving_average_window,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_read_retries: self.retry.max_read_retries,
            retry_backoff: Duration::from_millis(self.retry.backoff_ms),
            reconnect_delay: Duration::from_millis(self.retry.reconnect_delay_ms),
            auto_reconnect: self.retry.auto_reconnect,
            max_reconnect_attempts: self.retry.max_reconnect_attempts,
            extractor: self.extractor_config(),
        }
    }

    pub fn record_layout(&self) -> RecordLayout {
        RecordLayout {
            live_capacity: self.sampling.live_window,
            label_decimals: self.export.time_decimals,
            track_secondary: self.export.dual_channel,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.interval_ms)
    }

    pub fn export_format(&self) -> ExportFormat {
        ExportFormat {
            time_decimals: self.export.time_decimals,
            primary_decimals: self.export.primary_decimals,
            secondary_decimals: self.export.secondary_decimals,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<DashSettings>,
}

impl SettingsStore {
    /// Loads `path`, falling back to defaults when it is missing or unreadable JSON.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring malformed settings in {}: {}", path.display(), err);
                DashSettings::default()
            })
        } else {
            DashSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> DashSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F>(&self, change: F) -> Result<DashSettings>
    where
        F: FnOnce(&mut DashSettings),
    {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    fn persist(&self, data: &DashSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let settings = store.current();

        assert_eq!(settings, DashSettings::default());
        assert_eq!(settings.port.baud_rate, 115_200);
        assert_eq!(settings.retry.reconnect_delay_ms, 3000);
        assert_eq!(settings.protocol.variant, ProtocolVariant::CurrentSensor);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "port": { "name": "/dev/ttyUSB1" }, "protocol": { "variant": "loadCell" } }"#,
        )
        .unwrap();

        let settings = SettingsStore::new(path).unwrap().current();
        assert_eq!(settings.port.name.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(settings.port.baud_rate, 115_200);
        assert_eq!(settings.protocol.variant, ProtocolVariant::LoadCell);
        assert_eq!(settings.sampling.live_window, 200);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.current(), DashSettings::default());
    }

    #[test]
    fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        store
            .update(|s| {
                s.retry.max_reconnect_attempts = Some(5);
                s.export.directory = PathBuf::from("out");
            })
            .unwrap();

        let reopened = SettingsStore::new(path.clone()).unwrap();
        assert_eq!(reopened.path(), path.as_path());
        assert_eq!(reopened.current().retry.max_reconnect_attempts, Some(5));
        assert_eq!(reopened.current().export.directory, PathBuf::from("out"));
        assert_eq!(store.current(), reopened.current());
    }

    #[test]
    fn test_derived_configs() {
        let settings = DashSettings::default();
        let supervisor = settings.supervisor_config();
        assert_eq!(supervisor.retry_backoff, Duration::from_millis(500));
        assert_eq!(supervisor.extractor.average_window, 10);
        assert_eq!(settings.record_layout().live_capacity, 200);
        assert_eq!(settings.sample_interval(), Duration::from_millis(100));
    }
}
