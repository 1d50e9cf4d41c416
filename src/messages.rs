// Message types exchanged with remote callers

use serde::{Deserialize, Serialize};

use crate::arm::{JointAngles, Pose};

// Command from teleop/scripts -> runtime
// Tagged by "cmd", e.g. {"cmd": "line", "pose": {"x": 0, "y": 25, "z": 9.1}}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ArmCommand {
    Enable,
    Disable,
    /// Abandon the running and queued motions, holding position
    Stop,
    /// Straight-line move lasting `pose.time`
    Line { pose: Pose },
    /// Joint-space move to a pose
    PoseToPose { pose: Pose, time: f64 },
    /// Joint-space move to joint angles (radians, joints 1-6)
    Angles { angles: [f64; 6], time: f64 },
    /// Append the current pose to a scenario
    Record { scenario: String },
    Replay { scenario: String },
    Clear { scenario: String },
    /// Scale profile velocity to a percentage of calibrated maximum
    Speed { percentage: u8 },
}

impl ArmCommand {
    /// Commands that cut in ahead of queued motion
    pub fn is_interrupt(&self) -> bool {
        matches!(self, ArmCommand::Stop | ArmCommand::Disable)
    }
}

// Measured state from runtime -> observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmState {
    pub angles: JointAngles,
    pub pose: Pose,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Idle,
    Moving,
    Fault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: ArmCommand =
            serde_json::from_str(r#"{"cmd": "pose_to_pose", "pose": {"x": 0, "y": 25, "z": 9.1, "flip": "a"}, "time": 2.0}"#)
                .unwrap();
        match cmd {
            ArmCommand::PoseToPose { pose, time } => {
                assert_eq!(pose.y, 25.0);
                assert_eq!(time, 2.0);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let stop: ArmCommand = serde_json::from_str(r#"{"cmd": "stop"}"#).unwrap();
        assert!(stop.is_interrupt());

        let speed = serde_json::to_string(&ArmCommand::Speed { percentage: 40 }).unwrap();
        assert_eq!(speed, r#"{"cmd":"speed","percentage":40}"#);

        assert!(serde_json::from_str::<ArmCommand>(r#"{"cmd": "fly"}"#).is_err());
    }

    #[test]
    fn test_health_wire_format() {
        assert_eq!(serde_json::to_string(&RuntimeHealth::Moving).unwrap(), r#""moving""#);
    }
}
