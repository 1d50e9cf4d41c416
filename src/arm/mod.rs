// Motion control for a six-joint serial-servo arm
//
// Provides:
// - Closed-form forward and inverse kinematics
// - Quintic trajectory generation in Cartesian and joint space
// - Dynamixel Protocol 2.0 servo bus and calibrated servo controller
// - High-level arm driver with scenario record/replay

pub mod bus;
pub mod calibration;
pub mod controller;
mod driver;
pub mod dynamixel;
mod error;
pub mod kinematics;
mod pose;
pub mod scenario;
pub mod sim;
pub mod trajectory;

pub use bus::{BusError, ServoBus};
pub use calibration::{Calibration, ServoCalibration};
pub use controller::ServoController;
pub use driver::{ArmDriver, MotionOutcome};
pub use dynamixel::DynamixelBus;
pub use error::{ArmError, Result};
pub use kinematics::{
    forward_orientation_kinematics, forward_position_kinematics, inverse_kinematics,
    inverse_kinematics_near,
};
pub use pose::{Flip, JOINT_COUNT, JointAngles, Pose, RobotConfig};
pub use scenario::ScenarioBook;
pub use sim::SimulatedBus;
pub use trajectory::{TrajectoryGenerator, TrajectorySettings};
