// Error taxonomy for the motion-control core

use super::bus::BusError;
use super::calibration::CalibrationFileError;
use super::scenario::ScenarioFileError;

#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// No joint solution exists for the requested pose
    #[error("Pose unreachable: {0}")]
    Reachability(String),

    /// A resolved angle or raw value is outside a joint's calibrated range
    #[error("Joint {joint} value {value:.4} outside calibrated range [{min:.4}, {max:.4}]")]
    OutOfRange {
        joint: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationFileError),

    #[error("Scenario storage error: {0}")]
    Scenario(#[from] ScenarioFileError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown scenario '{0}'")]
    UnknownScenario(String),
}

pub type Result<T> = std::result::Result<T, ArmError>;
