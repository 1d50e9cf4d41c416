use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use servo_arm_runtime::arm::{
    ArmDriver, Calibration, DynamixelBus, RobotConfig, ScenarioBook, ServoBus, ServoController,
    SimulatedBus, TrajectorySettings,
};
use servo_arm_runtime::config::{
    ARM_PORT, CALIBRATION_PATH, DEFAULT_A2, DEFAULT_D1, DEFAULT_D4, DEFAULT_D6,
    DEFAULT_STEPS_PER_SECOND, SCENARIO_PATH,
};
use servo_arm_runtime::runtime;

/// Zenoh runtime for a six-joint Dynamixel arm
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Serial port of the servo bus
    #[arg(long, default_value = ARM_PORT)]
    port: String,

    /// Calibration file (JSON); bundled defaults are used if it does not exist
    #[arg(long, default_value = CALIBRATION_PATH)]
    calibration: PathBuf,

    /// Scenario file (JSON), created on first record
    #[arg(long, default_value = SCENARIO_PATH)]
    scenarios: PathBuf,

    /// Run against a simulated bus instead of hardware
    #[arg(long)]
    dry_run: bool,

    /// Trajectory steps per second
    #[arg(long, default_value_t = DEFAULT_STEPS_PER_SECOND)]
    rate: f64,

    #[arg(long, default_value_t = DEFAULT_D1)]
    d1: f64,

    #[arg(long, default_value_t = DEFAULT_A2)]
    a2: f64,

    #[arg(long, default_value_t = DEFAULT_D4)]
    d4: f64,

    #[arg(long, default_value_t = DEFAULT_D6)]
    d6: f64,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let calibration = if args.calibration.exists() {
        Calibration::load(&args.calibration)?
    } else {
        warn!(
            "Calibration file {} not found, using bundled defaults",
            args.calibration.display()
        );
        Calibration::dynamixel_default()
    };

    let bus: Box<dyn ServoBus> = if args.dry_run {
        info!("Dry run: using simulated servo bus");
        Box::new(SimulatedBus::new(&calibration.ids()))
    } else {
        Box::new(DynamixelBus::open(&args.port)?)
    };

    let config = RobotConfig::new(args.d1, args.a2, args.d4, args.d6);
    let settings = TrajectorySettings::with_rate(args.rate)?;
    let mut driver = ArmDriver::new(ServoController::new(bus, calibration), config, settings);
    driver.startup()?;

    let book = ScenarioBook::load_or_default(&args.scenarios)?;
    runtime::run(driver, book, args.scenarios).await
}
