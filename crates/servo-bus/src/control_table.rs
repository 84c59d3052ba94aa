//! Register layout and unit conversion for a servo model.
//!
//! A [`ControlTable`] maps each named [`Param`] to its register address,
//! width, memory category and the conversion between the raw register
//! integer and a [`ParamValue`] in physical units.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{BusError, ParamValue, Result};

/// Steps per full revolution of the position encoder.
pub const STEPS_PER_REV: u32 = 4096;
/// Raw step at the mechanical centre.
pub const CENTER_STEP: u32 = 2048;
/// Largest valid raw position.
pub const MAX_STEP: u32 = STEPS_PER_REV - 1;

macro_rules! params {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Named servo parameter.
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Param {
            $($variant),*
        }

        impl Param {
            pub const ALL: &'static [Param] = &[$(Param::$variant),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Param::$variant => $name),*
                }
            }
        }

        impl FromStr for Param {
            type Err = BusError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Param::$variant),)*
                    other => Err(BusError::UnknownParam(other.to_string())),
                }
            }
        }
    };
}

params! {
    FirmwareMajor => "firmware_major",
    FirmwareMinor => "firmware_minor",
    ModelNumber => "model_number",
    Id => "id",
    BaudRate => "baud_rate",
    ReturnDelay => "return_delay",
    MinAngleLimit => "min_angle_limit",
    MaxAngleLimit => "max_angle_limit",
    MaxTemperatureLimit => "max_temperature_limit",
    MaxVoltageLimit => "max_voltage_limit",
    MinVoltageLimit => "min_voltage_limit",
    MaxTorque => "max_torque",
    PCoefficient => "p_coefficient",
    DCoefficient => "d_coefficient",
    ICoefficient => "i_coefficient",
    PositionOffset => "position_offset",
    OperatingMode => "operating_mode",
    TorqueEnable => "torque_enable",
    Acceleration => "acceleration",
    GoalPosition => "goal_position",
    GoalTime => "goal_time",
    GoalSpeed => "goal_speed",
    TorqueLimit => "torque_limit",
    Lock => "lock",
    PresentPosition => "present_position",
    PresentSpeed => "present_speed",
    PresentLoad => "present_load",
    PresentVoltage => "present_voltage",
    PresentTemperature => "present_temperature",
    HardwareError => "hardware_error",
    Moving => "moving",
    PresentCurrent => "present_current",
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter lives. EEPROM parameters persist and usually require
/// torque to be off before they may be written.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamCategory {
    Eeprom,
    Ram,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Plain register integer.
    Raw,
    /// 0 / 1 flag.
    Bool,
    /// Encoder steps <-> radians (step 0 = 0 rad).
    Position,
    /// Tenths of a volt.
    Voltage,
    /// Whole degrees Celsius.
    Temperature,
    /// Sign-magnitude tenths of a percent, sign in bit 10.
    Load,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub address: u16,
    pub len: u8,
    pub category: ParamCategory,
    pub access: Access,
    pub conversion: Conversion,
}

impl ParamSpec {
    const fn new(
        address: u16,
        len: u8,
        category: ParamCategory,
        access: Access,
        conversion: Conversion,
    ) -> Self {
        Self {
            address,
            len,
            category,
            access,
            conversion,
        }
    }

    fn max_raw(&self) -> u32 {
        if self.len >= 4 {
            u32::MAX
        } else {
            (1u32 << (8 * u32::from(self.len))) - 1
        }
    }

    pub fn decode(&self, raw: u32) -> ParamValue {
        match self.conversion {
            Conversion::Raw => ParamValue::Int(i64::from(raw)),
            Conversion::Bool => ParamValue::Bool(raw != 0),
            Conversion::Position => ParamValue::Float(steps_to_radians(raw)),
            Conversion::Voltage => ParamValue::Float(f64::from(raw) / 10.0),
            Conversion::Temperature => ParamValue::Float(f64::from(raw)),
            Conversion::Load => {
                let magnitude = f64::from(raw & 0x3FF) / 10.0;
                if raw & 0x400 != 0 {
                    ParamValue::Float(-magnitude)
                } else {
                    ParamValue::Float(magnitude)
                }
            }
        }
    }

    /// Encode a physical value into a register integer.
    ///
    /// For position parameters an `Int` is taken as raw steps and a `Float`
    /// as radians.
    pub fn encode(&self, param: Param, value: ParamValue) -> Result<u32> {
        let invalid = |reason: String| BusError::InvalidValue {
            param: param.to_string(),
            reason,
        };
        let raw: i64 = match (self.conversion, value) {
            (Conversion::Bool, v) => i64::from(v.as_bool()),
            (Conversion::Position, ParamValue::Float(rad)) => radians_to_steps(rad) as i64,
            (Conversion::Voltage, v) => (v.as_f64() * 10.0).round() as i64,
            (Conversion::Load, v) => {
                let pct = v.as_f64();
                let magnitude = ((pct.abs() * 10.0).round() as i64).min(0x3FF);
                if pct < 0.0 {
                    magnitude | 0x400
                } else {
                    magnitude
                }
            }
            (_, v) => v.as_i64(),
        };
        if raw < 0 || raw as u64 > u64::from(self.max_raw()) {
            return Err(invalid(format!(
                "{raw} does not fit in {} byte(s)",
                self.len
            )));
        }
        Ok(raw as u32)
    }
}

pub fn steps_to_radians(steps: u32) -> f64 {
    f64::from(steps) * core::f64::consts::TAU / f64::from(STEPS_PER_REV)
}

/// Radians to encoder steps, rounded and clamped to `0..=4095`.
pub fn radians_to_steps(rad: f64) -> u32 {
    let steps = (rad * f64::from(STEPS_PER_REV) / core::f64::consts::TAU).round();
    if steps.is_nan() {
        return CENTER_STEP;
    }
    steps.clamp(0.0, f64::from(MAX_STEP)) as u32
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlTable {
    pub name: String,
    entries: BTreeMap<Param, ParamSpec>,
}

impl ControlTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, param: Param, spec: ParamSpec) -> Self {
        self.entries.insert(param, spec);
        self
    }

    pub fn spec(&self, param: Param) -> Result<&ParamSpec> {
        self.entries
            .get(&param)
            .ok_or_else(|| BusError::UnknownParam(param.to_string()))
    }

    pub fn params(&self) -> impl Iterator<Item = (&Param, &ParamSpec)> {
        self.entries.iter()
    }

    pub fn decode(&self, param: Param, raw: u32) -> Result<ParamValue> {
        Ok(self.spec(param)?.decode(raw))
    }

    pub fn encode(&self, param: Param, value: ParamValue) -> Result<u32> {
        self.spec(param)?.encode(param, value)
    }

    /// Look up a table by model name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "sts3215" | "sts" => Some(Self::sts3215()),
            _ => None,
        }
    }

    /// Feetech STS3215 register map.
    pub fn sts3215() -> Self {
        use Access::*;
        use Conversion as C;
        use ParamCategory::*;

        let table = [
            (Param::FirmwareMajor, ParamSpec::new(0, 1, Eeprom, ReadOnly, C::Raw)),
            (Param::FirmwareMinor, ParamSpec::new(1, 1, Eeprom, ReadOnly, C::Raw)),
            (Param::ModelNumber, ParamSpec::new(3, 2, Eeprom, ReadOnly, C::Raw)),
            (Param::Id, ParamSpec::new(5, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::BaudRate, ParamSpec::new(6, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::ReturnDelay, ParamSpec::new(7, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::MinAngleLimit, ParamSpec::new(9, 2, Eeprom, ReadWrite, C::Position)),
            (Param::MaxAngleLimit, ParamSpec::new(11, 2, Eeprom, ReadWrite, C::Position)),
            (Param::MaxTemperatureLimit, ParamSpec::new(13, 1, Eeprom, ReadWrite, C::Temperature)),
            (Param::MaxVoltageLimit, ParamSpec::new(14, 1, Eeprom, ReadWrite, C::Voltage)),
            (Param::MinVoltageLimit, ParamSpec::new(15, 1, Eeprom, ReadWrite, C::Voltage)),
            (Param::MaxTorque, ParamSpec::new(16, 2, Eeprom, ReadWrite, C::Raw)),
            (Param::PCoefficient, ParamSpec::new(21, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::DCoefficient, ParamSpec::new(22, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::ICoefficient, ParamSpec::new(23, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::PositionOffset, ParamSpec::new(31, 2, Eeprom, ReadWrite, C::Raw)),
            (Param::OperatingMode, ParamSpec::new(33, 1, Eeprom, ReadWrite, C::Raw)),
            (Param::TorqueEnable, ParamSpec::new(40, 1, Ram, ReadWrite, C::Bool)),
            (Param::Acceleration, ParamSpec::new(41, 1, Ram, ReadWrite, C::Raw)),
            (Param::GoalPosition, ParamSpec::new(42, 2, Ram, ReadWrite, C::Position)),
            (Param::GoalTime, ParamSpec::new(44, 2, Ram, ReadWrite, C::Raw)),
            (Param::GoalSpeed, ParamSpec::new(46, 2, Ram, ReadWrite, C::Raw)),
            (Param::TorqueLimit, ParamSpec::new(48, 2, Ram, ReadWrite, C::Raw)),
            (Param::Lock, ParamSpec::new(55, 1, Ram, ReadWrite, C::Bool)),
            (Param::PresentPosition, ParamSpec::new(56, 2, Ram, ReadOnly, C::Position)),
            (Param::PresentSpeed, ParamSpec::new(58, 2, Ram, ReadOnly, C::Raw)),
            (Param::PresentLoad, ParamSpec::new(60, 2, Ram, ReadOnly, C::Load)),
            (Param::PresentVoltage, ParamSpec::new(62, 1, Ram, ReadOnly, C::Voltage)),
            (Param::PresentTemperature, ParamSpec::new(63, 1, Ram, ReadOnly, C::Temperature)),
            (Param::HardwareError, ParamSpec::new(65, 1, Ram, ReadOnly, C::Raw)),
            (Param::Moving, ParamSpec::new(66, 1, Ram, ReadOnly, C::Bool)),
            (Param::PresentCurrent, ParamSpec::new(69, 2, Ram, ReadOnly, C::Raw)),
        ];

        table
            .into_iter()
            .fold(Self::new("sts3215"), |t, (param, spec)| t.with(param, spec))
    }
}
