//! Servo status snapshots, change detection and level-crossing diagnostics.

use serde::{Deserialize, Serialize};

pub const TEMPERATURE_DEADBAND_C: f64 = 1.0;
pub const VOLTAGE_DEADBAND_V: f64 = 0.1;
pub const LOAD_DEADBAND_PCT: f64 = 5.0;

pub const TEMPERATURE_WARN_C: f64 = 55.0;
pub const TEMPERATURE_ERROR_C: f64 = 70.0;
pub const VOLTAGE_MIN_V: f64 = 5.5;
pub const VOLTAGE_MAX_V: f64 = 8.0;

// Register values are decimal fractions; absorb the binary rounding so a
// 0.1 V step counts as 0.1 V.
const DEADBAND_EPSILON: f64 = 1e-9;

/// One status poll result for one servo. `None` means the value could not
/// be read this cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub temperature: Option<f64>,
    pub voltage: Option<f64>,
    pub load: Option<f64>,
    /// Hardware-error register with the torque-enabled bit already cleared.
    pub hardware_error: Option<u8>,
}

impl StatusSnapshot {
    /// Whether this snapshot is worth publishing after `previous`.
    pub fn differs_from(&self, previous: &StatusSnapshot) -> bool {
        moved(previous.temperature, self.temperature, TEMPERATURE_DEADBAND_C)
            || moved(previous.voltage, self.voltage, VOLTAGE_DEADBAND_V)
            || moved(previous.load, self.load, LOAD_DEADBAND_PCT)
            || previous.hardware_error != self.hardware_error
    }
}

fn moved(previous: Option<f64>, next: Option<f64>, deadband: f64) -> bool {
    match (previous, next) {
        (Some(a), Some(b)) => (a - b).abs() >= deadband - DEADBAND_EPSILON,
        (None, None) => false,
        _ => true,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TemperatureLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl TemperatureLevel {
    pub fn of(celsius: f64) -> Self {
        if celsius >= TEMPERATURE_ERROR_C {
            TemperatureLevel::Critical
        } else if celsius >= TEMPERATURE_WARN_C {
            TemperatureLevel::Warning
        } else {
            TemperatureLevel::Normal
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoltageLevel {
    Low,
    #[default]
    Normal,
    High,
}

impl VoltageLevel {
    pub fn of(volts: f64) -> Self {
        if volts < VOLTAGE_MIN_V {
            VoltageLevel::Low
        } else if volts > VOLTAGE_MAX_V {
            VoltageLevel::High
        } else {
            VoltageLevel::Normal
        }
    }
}

/// A threshold crossing, carrying the value that caused it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LevelChange {
    TemperatureCritical(f64),
    TemperatureWarning(f64),
    TemperatureRecovered(f64),
    VoltageLow(f64),
    VoltageHigh(f64),
    VoltageRecovered(f64),
}

/// Per-servo level state. Only transitions produce a [`LevelChange`], so a
/// value held inside a band reports once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelTracker {
    temperature: TemperatureLevel,
    voltage: VoltageLevel,
}

impl LevelTracker {
    pub fn temperature(&self) -> TemperatureLevel {
        self.temperature
    }

    pub fn voltage(&self) -> VoltageLevel {
        self.voltage
    }

    /// Feed one snapshot. Unknown values leave their level untouched.
    pub fn observe(&mut self, snapshot: &StatusSnapshot) -> Vec<LevelChange> {
        let mut changes = Vec::new();

        if let Some(t) = snapshot.temperature {
            let level = TemperatureLevel::of(t);
            let previous = std::mem::replace(&mut self.temperature, level);
            match (previous, level) {
                (p, l) if p == l => {}
                (_, TemperatureLevel::Critical) => changes.push(LevelChange::TemperatureCritical(t)),
                (TemperatureLevel::Normal, TemperatureLevel::Warning) => {
                    changes.push(LevelChange::TemperatureWarning(t))
                }
                // Cooling from critical into the warning band is not a new warning.
                (_, TemperatureLevel::Warning) => {}
                (_, TemperatureLevel::Normal) => changes.push(LevelChange::TemperatureRecovered(t)),
            }
        }

        if let Some(v) = snapshot.voltage {
            let level = VoltageLevel::of(v);
            let previous = std::mem::replace(&mut self.voltage, level);
            if previous != level {
                changes.push(match level {
                    VoltageLevel::Low => LevelChange::VoltageLow(v),
                    VoltageLevel::High => LevelChange::VoltageHigh(v),
                    VoltageLevel::Normal => LevelChange::VoltageRecovered(v),
                });
            }
        }

        changes
    }
}
