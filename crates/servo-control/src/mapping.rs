//! Joint-space angle <-> servo raw unit conversion.
//!
//! The servo encodes a full revolution in 4096 steps with the mechanical
//! centre at step 2048. A joint maps its `center_angle` onto that centre and
//! may run reversed.

use core::f64::consts::{PI, TAU};
use servo_bus::{CENTER_STEP, MAX_STEP, STEPS_PER_REV};

pub const RADIANS_PER_STEP: f64 = TAU / STEPS_PER_REV as f64;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointMapping {
    pub center_angle: f64,
    pub reverse: bool,
}

impl JointMapping {
    pub fn new(center_angle: f64, reverse: bool) -> Self {
        Self {
            center_angle,
            reverse,
        }
    }

    fn sign(&self) -> f64 {
        if self.reverse {
            -1.0
        } else {
            1.0
        }
    }

    /// Joint angle to raw steps, rounded and clamped to `0..=4095`.
    pub fn angle_to_raw(&self, angle: f64) -> u32 {
        let raw = (f64::from(CENTER_STEP)
            + self.sign() * (angle - self.center_angle) / RADIANS_PER_STEP)
            .round();
        raw.clamp(0.0, f64::from(MAX_STEP)) as u32
    }

    pub fn raw_to_angle(&self, raw: u32) -> f64 {
        self.center_angle
            + self.sign() * (f64::from(raw) - f64::from(CENTER_STEP)) * RADIANS_PER_STEP
    }

    /// Joint angle from a position the driver already decoded to radians,
    /// where the device centre reads as pi.
    pub fn position_to_angle(&self, position: f64) -> f64 {
        self.center_angle + self.sign() * (position - PI)
    }
}

pub fn clamp_angle(angle: f64, lower: f64, upper: f64) -> f64 {
    angle.clamp(lower, upper)
}

/// A deadband given in raw steps, expressed in radians.
pub fn deadband_radians(steps: u32) -> f64 {
    f64::from(steps) * RADIANS_PER_STEP
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    #[test]
    fn test_scenario_forward() {
        let m = JointMapping::new(0.0, false);
        assert_eq!(m.angle_to_raw(0.0), 2048);
        assert_eq!(m.angle_to_raw(FRAC_PI_4), 2560);
        assert_eq!(m.angle_to_raw(clamp_angle(PI, -FRAC_PI_2, FRAC_PI_2)), 3072);
    }

    #[test]
    fn test_scenario_reversed() {
        let m = JointMapping::new(0.0, true);
        assert_eq!(m.angle_to_raw(FRAC_PI_4), 1536);
        assert!((m.raw_to_angle(1536) - FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn test_raw_is_clamped_to_encoder_range() {
        let m = JointMapping::new(0.0, false);
        assert_eq!(m.angle_to_raw(10.0), MAX_STEP);
        assert_eq!(m.angle_to_raw(-10.0), 0);
    }

    #[test]
    fn test_angle_and_raw_are_inverse_within_half_step() {
        for &(center, reverse) in &[(0.0, false), (0.3, true), (-1.1, false), (2.0, true)] {
            let m = JointMapping::new(center, reverse);
            for i in -200..=200 {
                let angle = center + (i as f64) * 0.0137;
                let back = m.raw_to_angle(m.angle_to_raw(angle));
                assert!(
                    (back - angle).abs() <= 0.5 * RADIANS_PER_STEP + 1e-12,
                    "center {center} reverse {reverse} angle {angle} -> {back}"
                );
            }
            for raw in (0..=MAX_STEP).step_by(97) {
                assert_eq!(m.angle_to_raw(m.raw_to_angle(raw)), raw);
            }
        }
    }

    #[test]
    fn test_clamp_is_idempotent() {
        for &a in &[-5.0, -1.0, 0.0, 0.7, 1.5, 3.2] {
            let once = clamp_angle(a, -FRAC_PI_2, FRAC_PI_2);
            assert_eq!(clamp_angle(once, -FRAC_PI_2, FRAC_PI_2), once);
        }
    }

    #[test]
    fn test_position_to_angle_uses_pi_as_centre() {
        let m = JointMapping::new(0.25, false);
        assert!((m.position_to_angle(PI) - 0.25).abs() < 1e-12);
        let r = JointMapping::new(0.25, true);
        assert!((r.position_to_angle(PI + 0.5) - (0.25 - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_deadband_radians() {
        assert!((deadband_radians(4096) - TAU).abs() < 1e-12);
        assert_eq!(deadband_radians(0), 0.0);
    }
}
