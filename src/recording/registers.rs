//! Latest-value registers: one slot per channel, overwritten on every reading.
//!
//! The read loop is the only writer; the sampler and any display read
//! snapshots. A channel that has not reported yet reads as zero.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// Weight (g) on the load cell, current (mA) on the current sensor.
    Primary,
    PrimaryAverage,
    /// Pressure (PSIG), reported directly or derived from current.
    Secondary,
    SecondaryAverage,
    BusVoltage,
    ShuntVoltage,
    LoadVoltage,
    Power,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::Primary,
        Channel::PrimaryAverage,
        Channel::Secondary,
        Channel::SecondaryAverage,
        Channel::BusVoltage,
        Channel::ShuntVoltage,
        Channel::LoadVoltage,
        Channel::Power,
    ];
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registers {
    pub primary: f64,
    pub primary_average: f64,
    pub secondary: f64,
    pub secondary_average: f64,
    pub bus_voltage: f64,
    pub shunt_voltage: f64,
    pub load_voltage: f64,
    pub power: f64,
}

/// A register whose value actually changed.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterChange {
    pub channel: Channel,
    pub previous: f64,
    pub value: f64,
}

impl Registers {
    pub fn get(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Primary => self.primary,
            Channel::PrimaryAverage => self.primary_average,
            Channel::Secondary => self.secondary,
            Channel::SecondaryAverage => self.secondary_average,
            Channel::BusVoltage => self.bus_voltage,
            Channel::ShuntVoltage => self.shunt_voltage,
            Channel::LoadVoltage => self.load_voltage,
            Channel::Power => self.power,
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut f64 {
        match channel {
            Channel::Primary => &mut self.primary,
            Channel::PrimaryAverage => &mut self.primary_average,
            Channel::Secondary => &mut self.secondary,
            Channel::SecondaryAverage => &mut self.secondary_average,
            Channel::BusVoltage => &mut self.bus_voltage,
            Channel::ShuntVoltage => &mut self.shunt_voltage,
            Channel::LoadVoltage => &mut self.load_voltage,
            Channel::Power => &mut self.power,
        }
    }

    /// Overwrites one slot. Returns the change only if the value differs.
    pub fn set(&mut self, channel: Channel, value: f64) -> Option<RegisterChange> {
        let slot = self.slot_mut(channel);
        let previous = *slot;
        if previous == value {
            return None;
        }
        *slot = value;
        Some(RegisterChange {
            channel,
            previous,
            value,
        })
    }
}

/// Shared handle over the registers of the current connection.
///
/// Backed by a `watch` channel: writers mutate in place and subscribers are
/// woken only when some slot changed.
#[derive(Clone)]
pub struct RegisterBank {
    tx: watch::Sender<Registers>,
}

impl RegisterBank {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Registers::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> Registers {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Registers> {
        self.tx.subscribe()
    }

    /// Runs `update` against the registers, notifying subscribers only if it
    /// reported at least one change.
    pub fn update<F>(&self, update: F) -> Vec<RegisterChange>
    where
        F: FnOnce(&mut Registers) -> Vec<RegisterChange>,
    {
        let mut changes = Vec::new();
        self.tx.send_if_modified(|regs| {
            changes = update(regs);
            !changes.is_empty()
        });
        changes
    }

    /// Back to all-zero, as when a fresh link is acquired.
    pub fn reset(&self) {
        self.tx.send_if_modified(|regs| {
            let modified = *regs != Registers::default();
            *regs = Registers::default();
            modified
        });
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_only_real_changes() {
        let mut regs = Registers::default();
        assert_eq!(regs.set(Channel::Primary, 0.0), None);

        let change = regs.set(Channel::Primary, 12.5).unwrap();
        assert_eq!(change.previous, 0.0);
        assert_eq!(change.value, 12.5);
        assert_eq!(regs.set(Channel::Primary, 12.5), None);
        assert_eq!(regs.get(Channel::Primary), 12.5);
    }

    #[test]
    fn test_unreported_channels_read_zero() {
        let regs = Registers::default();
        for channel in Channel::ALL {
            assert_eq!(regs.get(channel), 0.0);
        }
    }

    #[test]
    fn test_bank_notifies_on_change_only() {
        let bank = RegisterBank::new();
        let mut rx = bank.subscribe();
        assert!(!rx.has_changed().unwrap());

        let changes = bank.update(|regs| regs.set(Channel::Power, 0.0).into_iter().collect());
        assert!(changes.is_empty());
        assert!(!rx.has_changed().unwrap());

        bank.update(|regs| regs.set(Channel::Power, 1.5).into_iter().collect());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().power, 1.5);

        bank.reset();
        assert_eq!(bank.snapshot(), Registers::default());
    }
}
