// Value types shared by the kinematics solver, trajectory generator and servo controller

use std::ops::{Index, IndexMut};

use nalgebra::Rotation3;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_A2, DEFAULT_D1, DEFAULT_D4, DEFAULT_D6};

/// Number of actuated joints
pub const JOINT_COUNT: usize = 6;

/// Solution branch of the shoulder/elbow sub-problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flip {
    /// No preference, keep whatever branch was used last
    #[default]
    Unspecified,
    /// Elbow up: forearm bends below the upper-arm line (joint 3 <= 0)
    A,
    /// Elbow down: forearm bends above the upper-arm line (joint 3 >= 0)
    B,
}

impl Flip {
    /// Returns `self` unless unspecified, in which case `previous` is kept
    pub fn or(self, previous: Flip) -> Flip {
        match self {
            Flip::Unspecified => previous,
            branch => branch,
        }
    }

    /// Branch the solver uses when nothing was ever specified
    pub fn resolved(self) -> Flip {
        self.or(Flip::A)
    }
}

/// Cartesian target for the end effector
///
/// Orientation is the yaw-pitch-roll sequence `Rz(alpha) * Ry(beta) * Rx(gamma)`.
/// Lengths use the same unit as [`RobotConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub alpha: f64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub flip: Flip,
    /// Traversal time in seconds when this pose ends a trajectory segment
    #[serde(default = "default_time")]
    pub time: f64,
    /// Exact orientation read back from the arm, preferred over the angles when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_orientation: Option<Rotation3<f64>>,
}

fn default_time() -> f64 {
    1.0
}

impl Pose {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            alpha: 0.0,
            beta: 0.0,
            gamma: 0.0,
            flip: Flip::Unspecified,
            time: default_time(),
            measured_orientation: None,
        }
    }

    pub fn with_orientation(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self.gamma = gamma;
        self.measured_orientation = None;
        self
    }

    pub fn with_flip(mut self, flip: Flip) -> Self {
        self.flip = flip;
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Overrides the orientation with an exact rotation, keeping the angles in sync
    pub fn with_measured_orientation(mut self, rotation: Rotation3<f64>) -> Self {
        let (roll, pitch, yaw) = rotation.euler_angles();
        self.alpha = yaw;
        self.beta = pitch;
        self.gamma = roll;
        self.measured_orientation = Some(rotation);
        self
    }

    /// End-effector rotation matrix
    pub fn orientation(&self) -> Rotation3<f64> {
        match self.measured_orientation {
            Some(rotation) => rotation,
            None => Rotation3::from_euler_angles(self.gamma, self.beta, self.alpha),
        }
    }

    /// Distance of the target from the base axis
    pub fn radius(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Blends every continuous coordinate towards `stop` by factor `s`
    pub fn blend(&self, stop: &Pose, s: f64, flip: Flip) -> Pose {
        let lerp = |a: f64, b: f64| a + (b - a) * s;
        Pose {
            x: lerp(self.x, stop.x),
            y: lerp(self.y, stop.y),
            z: lerp(self.z, stop.z),
            alpha: lerp(self.alpha, stop.alpha),
            beta: lerp(self.beta, stop.beta),
            gamma: lerp(self.gamma, stop.gamma),
            flip,
            time: stop.time,
            measured_orientation: None,
        }
    }
}

/// Link lengths of the arm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Shoulder height above the base plate
    pub d1: f64,
    /// Upper-arm length, shoulder to elbow
    pub a2: f64,
    /// Forearm length, elbow to wrist centre
    pub d4: f64,
    /// Wrist centre to tool tip
    pub d6: f64,
}

impl RobotConfig {
    pub const fn new(d1: f64, a2: f64, d4: f64, d6: f64) -> Self {
        Self { d1, a2, d4, d6 }
    }

    /// Farthest wrist-centre distance from the shoulder
    pub fn max_reach(&self) -> f64 {
        self.a2 + self.d4
    }

    /// Closest wrist-centre distance from the shoulder
    pub fn min_reach(&self) -> f64 {
        (self.a2 - self.d4).abs()
    }
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self::new(DEFAULT_D1, DEFAULT_A2, DEFAULT_D4, DEFAULT_D6)
    }
}

/// Joint angles in radians, indexed 1..=6 like the physical joints. Slot 0 is unused.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JointAngles(pub [f64; JOINT_COUNT + 1]);

impl JointAngles {
    pub fn new(angles: [f64; JOINT_COUNT]) -> Self {
        let mut slots = [0.0; JOINT_COUNT + 1];
        slots[1..].copy_from_slice(&angles);
        Self(slots)
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Iterates `(joint, angle)` over the populated slots
    pub fn joints(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        (1..=JOINT_COUNT).map(move |joint| (joint, self.0[joint]))
    }

    /// Per-joint blend towards `stop` by factor `s`
    pub fn blend(&self, stop: &JointAngles, s: f64) -> JointAngles {
        let mut out = *self;
        for joint in 1..=JOINT_COUNT {
            out.0[joint] = self.0[joint] + (stop.0[joint] - self.0[joint]) * s;
        }
        out
    }

    /// Largest per-joint absolute difference
    pub fn max_distance(&self, other: &JointAngles) -> f64 {
        self.joints()
            .map(|(joint, angle)| (angle - other.0[joint]).abs())
            .fold(0.0, f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.joints().all(|(_, angle)| angle.is_finite())
    }
}

impl Index<usize> for JointAngles {
    type Output = f64;

    fn index(&self, joint: usize) -> &f64 {
        &self.0[joint]
    }
}

impl IndexMut<usize> for JointAngles {
    fn index_mut(&mut self, joint: usize) -> &mut f64 {
        &mut self.0[joint]
    }
}
