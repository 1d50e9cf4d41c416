// Per-joint servo calibration: raw <-> angle mapping, motion profile and PID defaults
//
// Persisted as a JSON array of records, one per joint:
// {id, min_raw, max_raw, min_angle, max_angle, max_velocity, max_acceleration, p, i, d}
// `id` is both the joint number and the servo's bus ID.

use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::{ArmError, Result};
use super::pose::JOINT_COUNT;

/// Angles this close outside the calibrated range still count as inside
const ANGLE_EPS: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid calibration: {0}")]
    Invalid(String),
}

/// Calibration of one joint's servo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoCalibration {
    pub id: u8,
    /// Raw position at `min_angle`; may exceed `max_raw` for reversed servos
    pub min_raw: i32,
    /// Raw position at `max_angle`
    pub max_raw: i32,
    pub min_angle: f64,
    pub max_angle: f64,
    /// Profile velocity limit, raw units
    pub max_velocity: u32,
    /// Profile acceleration limit, raw units
    pub max_acceleration: u32,
    pub p: u16,
    pub i: u16,
    pub d: u16,
}

impl ServoCalibration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u8,
        min_raw: i32,
        max_raw: i32,
        min_angle: f64,
        max_angle: f64,
        max_velocity: u32,
        max_acceleration: u32,
        (p, i, d): (u16, u16, u16),
    ) -> Self {
        Self {
            id,
            min_raw,
            max_raw,
            min_angle,
            max_angle,
            max_velocity,
            max_acceleration,
            p,
            i,
            d,
        }
    }

    pub fn joint(&self) -> usize {
        self.id as usize
    }

    /// Raw units per radian; negative for reversed servos
    fn slope(&self) -> f64 {
        (self.max_raw - self.min_raw) as f64 / (self.max_angle - self.min_angle)
    }

    /// Angle range as (low, high)
    pub fn angle_bounds(&self) -> (f64, f64) {
        (
            self.min_angle.min(self.max_angle),
            self.min_angle.max(self.max_angle),
        )
    }

    /// Raw range as (low, high)
    pub fn raw_bounds(&self) -> (i32, i32) {
        (self.min_raw.min(self.max_raw), self.min_raw.max(self.max_raw))
    }

    pub fn contains_angle(&self, angle: f64) -> bool {
        let (low, high) = self.angle_bounds();
        angle >= low - ANGLE_EPS && angle <= high + ANGLE_EPS
    }

    pub fn contains_raw(&self, raw: i32) -> bool {
        let (low, high) = self.raw_bounds();
        (low..=high).contains(&raw)
    }

    /// Picks the turn of `angle` that lies inside the calibrated range
    ///
    /// Only angles within [-pi, pi] may move by a full turn. Angles beyond it already
    /// name a turn (a seeded solution following the servo) and are checked as given.
    pub fn representative_angle(&self, angle: f64) -> Option<f64> {
        if self.contains_angle(angle) {
            return Some(angle);
        }
        if !(-PI..=PI).contains(&angle) {
            return None;
        }
        [angle - 2.0 * PI, angle + 2.0 * PI]
            .into_iter()
            .find(|&candidate| self.contains_angle(candidate))
    }

    fn out_of_range(&self, value: f64, (min, max): (f64, f64)) -> ArmError {
        ArmError::OutOfRange {
            joint: self.joint(),
            value,
            min,
            max,
        }
    }

    /// Converts an angle to raw units, rejecting angles outside the calibrated range
    pub fn angle_to_raw(&self, angle: f64) -> Result<i32> {
        let bounds = self.angle_bounds();
        let angle = self
            .representative_angle(angle)
            .ok_or_else(|| self.out_of_range(angle, bounds))?;
        let clamped = angle.clamp(bounds.0, bounds.1);

        let raw = (self.min_raw as f64 + (clamped - self.min_angle) * self.slope()).round() as i32;
        if !self.contains_raw(raw) {
            let (low, high) = self.raw_bounds();
            return Err(self.out_of_range(raw as f64, (low as f64, high as f64)));
        }
        Ok(raw)
    }

    /// Converts raw units to an angle. Raw values outside the range extrapolate linearly.
    pub fn raw_to_angle(&self, raw: i32) -> f64 {
        self.min_angle + (raw - self.min_raw) as f64 / self.slope()
    }

    fn validate(&self) -> std::result::Result<(), CalibrationFileError> {
        let invalid = |reason: &str| {
            Err(CalibrationFileError::Invalid(format!(
                "joint {}: {}",
                self.id, reason
            )))
        };
        if self.min_raw == self.max_raw {
            return invalid("raw range is empty");
        }
        if !self.min_angle.is_finite() || !self.max_angle.is_finite() {
            return invalid("angle range is not finite");
        }
        if (self.max_angle - self.min_angle).abs() < f64::EPSILON {
            return invalid("angle range is empty");
        }
        Ok(())
    }
}

/// Calibration table for all joints, indexed by joint number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ServoCalibration>", into = "Vec<ServoCalibration>")]
pub struct Calibration {
    servos: Vec<ServoCalibration>,
}

impl Calibration {
    /// Builds a table from one entry per joint 1..=6, in any order
    pub fn new(mut servos: Vec<ServoCalibration>) -> std::result::Result<Self, CalibrationFileError> {
        servos.sort_by_key(|servo| servo.id);
        let ids: Vec<u8> = servos.iter().map(|servo| servo.id).collect();
        let expected: Vec<u8> = (1..=JOINT_COUNT as u8).collect();
        if ids != expected {
            return Err(CalibrationFileError::Invalid(format!(
                "expected servo ids {:?}, got {:?}",
                expected, ids
            )));
        }
        for servo in &servos {
            servo.validate()?;
        }
        Ok(Self { servos })
    }

    /// Factory calibration of the Dynamixel arm
    pub fn dynamixel_default() -> Self {
        Self {
            servos: vec![
                ServoCalibration::new(1, 0, 6144, 0.0, PI, 100, 20, (1500, 0, 1500)),
                ServoCalibration::new(2, 0, 6144, 0.0, PI, 50, 10, (1500, 100, 1500)),
                ServoCalibration::new(3, 6144, 0, -PI, PI / 3.0, 100, 20, (1500, 0, 1500)),
                ServoCalibration::new(4, 0, 4095, -PI, PI, 400, 80, (1000, 0, 200)),
                ServoCalibration::new(5, 0, 4095, -PI, PI, 150, 50, (2500, 0, 500)),
                ServoCalibration::new(6, 0, 4095, -PI, PI, 150, 50, (1500, 0, 500)),
            ],
        }
    }

    pub fn servo(&self, joint: usize) -> &ServoCalibration {
        &self.servos[joint - 1]
    }

    pub fn servos(&self) -> &[ServoCalibration] {
        &self.servos
    }

    /// Bus IDs in joint order
    pub fn ids(&self) -> Vec<u8> {
        self.servos.iter().map(|servo| servo.id).collect()
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, CalibrationFileError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> std::result::Result<String, CalibrationFileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, CalibrationFileError> {
        let path = path.as_ref();
        info!("Loading calibration from {}", path.display());
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::result::Result<(), CalibrationFileError> {
        let path = path.as_ref();
        info!("Saving calibration to {}", path.display());
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl TryFrom<Vec<ServoCalibration>> for Calibration {
    type Error = CalibrationFileError;

    fn try_from(servos: Vec<ServoCalibration>) -> std::result::Result<Self, Self::Error> {
        Self::new(servos)
    }
}

impl From<Calibration> for Vec<ServoCalibration> {
    fn from(calibration: Calibration) -> Self {
        calibration.servos
    }
}
