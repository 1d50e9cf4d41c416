// Rates, topics, arm geometry and servo bus defaults

// Trajectory control steps per second
pub const DEFAULT_STEPS_PER_SECOND: f64 = 10.0;

// Sag compensation: lift of gain * radius after the first settle steps of a Cartesian move
pub const SAG_GAIN: f64 = 0.008;
pub const SAG_SETTLE_STEPS: usize = 3;

// Runtime loop frequency (command intake)
pub const LOOP_HZ: u64 = 50;

// State publishing frequency
pub const STATE_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_CMD: &str = "arm/cmd"; // commands
pub const TOPIC_STATE_JOINTS: &str = "arm/state/joints"; // measured joints and pose
pub const TOPIC_HEALTH: &str = "arm/state/health"; // health status

// Link lengths in cm
pub const DEFAULT_D1: f64 = 9.1; // base plate to shoulder axis
pub const DEFAULT_A2: f64 = 15.8; // upper arm
pub const DEFAULT_D4: f64 = 21.9; // forearm to wrist centre
pub const DEFAULT_D6: f64 = 2.0; // wrist centre to tool tip

// Servo bus
// Serial port of the Dynamixel U2D2 adapter
pub const ARM_PORT: &str = "/dev/ttyUSB0";

// Calibration table; the bundled defaults are used when the file is missing
pub const CALIBRATION_PATH: &str = "calibration.json";

// Recorded scenarios
pub const SCENARIO_PATH: &str = "scenarios.json";
