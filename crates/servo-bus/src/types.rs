use core::fmt;
use serde::{Deserialize, Serialize};

/// Servo address on the bus. Valid range is 1..=253; 0 is reserved and
/// 254 is the broadcast address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ServoId(u8);

impl ServoId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 253;

    pub fn new(id: u8) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Some(Self(id))
        } else {
            None
        }
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ServoId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("servo id {value} outside 1..=253"))
    }
}

impl From<ServoId> for u8 {
    fn from(id: ServoId) -> Self {
        id.0
    }
}

impl fmt::Display for ServoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded parameter value in physical units.
///
/// Positions are radians where 0 rad is raw step 0 (so the mechanical
/// centre, step 2048, reads as pi). Voltage is volts, temperature is degrees
/// Celsius, load is percent of rated torque.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            ParamValue::Bool(b) => b,
            ParamValue::Int(v) => v != 0,
            ParamValue::Float(v) => v != 0.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            ParamValue::Bool(b) => i64::from(b),
            ParamValue::Int(v) => v,
            ParamValue::Float(v) => v.round() as i64,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:.4}"),
        }
    }
}

/// Reply to a ping: the servo answered and reported its status byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PingStatus {
    pub servo_id: ServoId,
    pub status: u8,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servo_id_range() {
        assert!(ServoId::new(0).is_none());
        assert!(ServoId::new(254).is_none());
        assert_eq!(ServoId::new(1).map(|id| id.raw()), Some(1));
        assert_eq!(ServoId::new(253).map(|id| id.raw()), Some(253));
    }

    #[test]
    fn servo_id_deserialize_rejects_broadcast() {
        let ok: Result<ServoId, _> = serde_json::from_str("12");
        assert!(ok.is_ok());
        let bad: Result<ServoId, _> = serde_json::from_str("254");
        assert!(bad.is_err());
    }

    #[test]
    fn param_value_coercions() {
        assert_eq!(ParamValue::Bool(true).as_f64(), 1.0);
        assert!(ParamValue::Int(3).as_bool());
        assert_eq!(ParamValue::Float(2.6).as_i64(), 3);
    }
}
