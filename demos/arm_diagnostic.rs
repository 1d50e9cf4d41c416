// Arm diagnostic: READ-ONLY check of the servo bus and calibration
//
// Nothing is written to the servos, torque stays as it is.
// Run this before starting the runtime on new hardware.
//
// Usage: cargo run --example arm_diagnostic -- [port] [calibration.json]
// Example: cargo run --example arm_diagnostic -- /dev/ttyUSB0 calibration.json

use std::io::{self, Write};

use servo_arm_runtime::arm::bus::Register;
use servo_arm_runtime::arm::{
    Calibration, DynamixelBus, JointAngles, Pose, RobotConfig, ServoBus,
};
use servo_arm_runtime::config::{ARM_PORT, CALIBRATION_PATH};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| ARM_PORT.to_string());
    let calibration_path = args.next().unwrap_or_else(|| CALIBRATION_PATH.to_string());

    println!("=== Servo Arm Diagnostic (READ-ONLY) ===");
    println!("This tool only READS from the servos: no writes, no movement");
    println!();
    println!("Serial port: {}", port);

    let calibration = match Calibration::load(&calibration_path) {
        Ok(calibration) => {
            println!("Calibration: {}", calibration_path);
            calibration
        }
        Err(e) => {
            println!("Calibration: bundled defaults ({} unusable: {})", calibration_path, e);
            Calibration::dynamixel_default()
        }
    };
    println!("Expected servo IDs: {:?}", calibration.ids());
    println!();

    println!("Step 1: Opening serial port...");
    let mut bus = match DynamixelBus::open(&port) {
        Ok(bus) => {
            println!("  OK serial port opened");
            bus
        }
        Err(e) => {
            println!("  FAILED to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the U2D2 adapter is connected and the arm is powered");
            println!("  - On Linux, check you are in the dialout group");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Pinging servos...");
    let mut all_found = true;
    for servo in calibration.servos() {
        print!("  Joint {} (ID {}): ", servo.joint(), servo.id);
        io::stdout().flush()?;

        match bus.ping(servo.id) {
            Ok(true) => println!("RESPONDING"),
            Ok(false) => {
                println!("NO RESPONSE");
                all_found = false;
            }
            Err(e) => {
                println!("ERROR: {}", e);
                all_found = false;
            }
        }
    }
    println!();

    if !all_found {
        println!("WARNING: not all servos responded!");
        println!("  - Check the 12V supply");
        println!("  - Verify servo IDs match the calibration file");
        println!("  - Check the daisy-chain cables");
        println!();
    }

    println!("Step 3: Reading servo registers...");
    println!();

    let mut angles = JointAngles::zero();
    let mut complete = true;
    for servo in calibration.servos() {
        let id = servo.id;
        println!("  === Joint {} (ID {}) ===", servo.joint(), id);

        match bus.read(id, Register::OperatingMode) {
            Ok(mode) => {
                let mode_str = match mode {
                    1 => "Velocity",
                    3 => "Position",
                    4 => "Extended position",
                    16 => "PWM",
                    _ => "Unknown",
                };
                println!("    Operating Mode:   {} ({})", mode, mode_str);
            }
            Err(e) => println!("    Operating Mode:   ERROR - {}", e),
        }

        match bus.read(id, Register::TorqueEnable) {
            Ok(val) => {
                let status = if val == 1 { "ENABLED" } else { "disabled" };
                println!("    Torque Enable:    {} ({})", val, status);
            }
            Err(e) => println!("    Torque Enable:    ERROR - {}", e),
        }

        match bus.read(id, Register::HardwareErrorStatus) {
            Ok(0) => println!("    Hardware Error:   none"),
            Ok(val) => println!("    Hardware Error:   0x{:02X}", val),
            Err(e) => println!("    Hardware Error:   ERROR - {}", e),
        }

        match bus.get_position(id) {
            Ok(raw) => {
                let angle = servo.raw_to_angle(raw);
                let (low, high) = servo.raw_bounds();
                let note = if servo.contains_raw(raw) { "" } else { "  OUTSIDE CALIBRATION" };
                println!(
                    "    Present Position: {} [{}, {}] -> {:.3} rad ({:.1} deg){}",
                    raw,
                    low,
                    high,
                    angle,
                    angle.to_degrees(),
                    note
                );
                angles[servo.joint()] = angle;
            }
            Err(e) => {
                println!("    Present Position: ERROR - {}", e);
                complete = false;
            }
        }

        println!();
    }

    if complete {
        let pose = Pose::from_measured(&angles, &RobotConfig::default());
        println!("Tool pose (default link lengths):");
        println!("  x={:.2} y={:.2} z={:.2}", pose.x, pose.y, pose.z);
        println!(
            "  alpha={:.3} beta={:.3} gamma={:.3} flip={:?}",
            pose.alpha, pose.beta, pose.gamma, pose.flip
        );
        println!();
    }

    println!("=== Diagnostic Complete ===");
    println!();
    println!("Next step: 'cargo run -- --port {}' with the arm clear of obstacles", port);

    Ok(())
}
