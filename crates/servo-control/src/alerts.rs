use serde::{Deserialize, Serialize};
use servo_bus::ServoId;
use std::collections::BTreeSet;
use std::fmt;

/// Bit 4 of the hardware-error register reports torque enabled, not a fault.
pub const TORQUE_ENABLED_BIT: u8 = 1 << 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    VoltageError,
    SensorError,
    TemperatureError,
    CurrentError,
    OverloadError,
}

impl AlertKind {
    pub const ALL: [AlertKind; 5] = [
        AlertKind::VoltageError,
        AlertKind::SensorError,
        AlertKind::TemperatureError,
        AlertKind::CurrentError,
        AlertKind::OverloadError,
    ];

    pub fn bit(&self) -> u8 {
        match self {
            AlertKind::VoltageError => 1 << 0,
            AlertKind::SensorError => 1 << 1,
            AlertKind::TemperatureError => 1 << 2,
            AlertKind::CurrentError => 1 << 3,
            AlertKind::OverloadError => 1 << 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::VoltageError => "voltage_error",
            AlertKind::SensorError => "sensor_error",
            AlertKind::TemperatureError => "temperature_error",
            AlertKind::CurrentError => "current_error",
            AlertKind::OverloadError => "overload_error",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clear the torque-enabled flag so only fault bits remain.
pub fn mask_hardware_error(raw: u8) -> u8 {
    raw & !TORQUE_ENABLED_BIT
}

/// Decode fault bits into alert tags. Bits without an assigned alert are
/// ignored.
pub fn decode_hardware_error(raw: u8) -> BTreeSet<AlertKind> {
    let masked = mask_hardware_error(raw);
    AlertKind::ALL
        .iter()
        .copied()
        .filter(|kind| masked & kind.bit() != 0)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareAlert {
    pub servo_id: ServoId,
    pub alerts: BTreeSet<AlertKind>,
    pub raw_value: u8,
}

impl HardwareAlert {
    /// Build an alert for a nonzero masked error value, or `None` when no
    /// fault bit is set.
    pub fn from_raw(servo_id: ServoId, raw_value: u8) -> Option<Self> {
        let alerts = decode_hardware_error(raw_value);
        if alerts.is_empty() {
            return None;
        }
        Some(Self {
            servo_id,
            alerts,
            raw_value,
        })
    }

    pub fn describe(&self) -> String {
        let tags: Vec<&str> = self.alerts.iter().map(AlertKind::as_str).collect();
        format!(
            "servo {} hardware error 0x{:02X}: {}",
            self.servo_id,
            self.raw_value,
            tags.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_0x25() {
        let tags = decode_hardware_error(0x25);
        let expected: BTreeSet<_> = [
            AlertKind::VoltageError,
            AlertKind::TemperatureError,
            AlertKind::OverloadError,
        ]
        .into_iter()
        .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_decode_0x31_excludes_torque_bit() {
        let tags = decode_hardware_error(0x31);
        let expected: BTreeSet<_> = [AlertKind::VoltageError, AlertKind::OverloadError]
            .into_iter()
            .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_torque_bit_alone_is_not_an_alert() {
        for raw in 0..=u8::MAX {
            let tags = decode_hardware_error(raw);
            assert!(tags.iter().all(|k| k.bit() & TORQUE_ENABLED_BIT == 0));
            assert_eq!(tags, decode_hardware_error(raw & !TORQUE_ENABLED_BIT));
        }
        let id = ServoId::new(1).unwrap();
        assert!(HardwareAlert::from_raw(id, TORQUE_ENABLED_BIT).is_none());
    }

    #[test]
    fn test_describe_lists_tags() {
        let id = ServoId::new(4).unwrap();
        let alert = HardwareAlert::from_raw(id, 0x09).unwrap();
        assert_eq!(
            alert.describe(),
            "servo 4 hardware error 0x09: voltage_error, current_error"
        );
    }
}
