// Zenoh service: commands in, measured state and health out
//
// Motion is blocking (compute, send, wait per step), so commands run in arrival
// order on a dedicated control thread that owns the driver while moving. The
// async loop only parses commands and publishes state. Stop and disable raise
// the driver's cancel flag as soon as they arrive so the running motion ends
// before its next step; the control thread lowers it again when it reaches them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError, mpsc};
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::arm::{ArmDriver, JointAngles, MotionOutcome, Pose, Result, ScenarioBook, ServoBus};
use crate::config::{LOOP_HZ, STATE_HZ, TOPIC_CMD, TOPIC_HEALTH, TOPIC_STATE_JOINTS};
use crate::messages::{ArmCommand, ArmState, RuntimeHealth};

type SharedDriver<B> = Arc<Mutex<ArmDriver<B>>>;

/// Executes commands one at a time on the control thread
struct ControlLoop<B: ServoBus> {
    driver: SharedDriver<B>,
    cancel: Arc<AtomicBool>,
    book: ScenarioBook,
    book_path: PathBuf,
    health: watch::Sender<RuntimeHealth>,
}

impl<B: ServoBus> ControlLoop<B> {
    fn run(mut self, commands: mpsc::Receiver<ArmCommand>) {
        while let Ok(cmd) = commands.recv() {
            debug!("Executing command: {:?}", cmd);
            match self.execute(cmd) {
                Ok(()) => {
                    self.health.send_replace(RuntimeHealth::Idle);
                }
                Err(e) => {
                    warn!("Command failed: {}", e);
                    self.health.send_replace(RuntimeHealth::Fault);
                }
            }
        }
        info!("Command channel closed, control loop exiting");
    }

    fn execute(&mut self, cmd: ArmCommand) -> Result<()> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        match cmd {
            ArmCommand::Stop => {
                self.cancel.store(false, Ordering::SeqCst);
                info!("Motion stopped");
            }
            ArmCommand::Disable => {
                self.cancel.store(false, Ordering::SeqCst);
                driver.disable()?;
            }
            ArmCommand::Enable => driver.enable()?,
            ArmCommand::Speed { percentage } => driver.set_speed(percentage)?,
            ArmCommand::Line { pose } => {
                self.health.send_replace(RuntimeHealth::Moving);
                log_outcome(driver.move_line(&pose)?);
            }
            ArmCommand::PoseToPose { pose, time } => {
                self.health.send_replace(RuntimeHealth::Moving);
                log_outcome(driver.move_pose_to_pose(&pose, time)?);
            }
            ArmCommand::Angles { angles, time } => {
                self.health.send_replace(RuntimeHealth::Moving);
                log_outcome(driver.move_angles(&JointAngles::new(angles), time)?);
            }
            ArmCommand::Replay { scenario } => {
                self.health.send_replace(RuntimeHealth::Moving);
                log_outcome(driver.replay(&self.book, &scenario)?);
            }
            ArmCommand::Record { scenario } => {
                let pose = driver.record(&mut self.book, &scenario)?;
                info!(
                    "Recorded ({:.2}, {:.2}, {:.2}) into '{}'",
                    pose.x, pose.y, pose.z, scenario
                );
                self.book.save(&self.book_path)?;
            }
            ArmCommand::Clear { scenario } => {
                self.book.clear(&scenario)?;
                self.book.save(&self.book_path)?;
            }
        }
        Ok(())
    }
}

fn log_outcome(outcome: MotionOutcome) {
    match outcome {
        MotionOutcome::Completed { steps, .. } => info!("Motion completed ({} steps)", steps),
        MotionOutcome::Cancelled { steps } => warn!("Motion cancelled after {} steps", steps),
    }
}

/// Measured state, or `None` while the control thread holds the arm
fn sample_state<B: ServoBus>(driver: &SharedDriver<B>) -> Option<ArmState> {
    let mut driver = match driver.try_lock() {
        Ok(driver) => driver,
        Err(TryLockError::WouldBlock) => return None,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
    };
    match driver.current_angles() {
        Ok(angles) => Some(ArmState {
            angles,
            pose: Pose::from_measured(&angles, driver.config()),
        }),
        Err(e) => {
            warn!("Failed to read joint state: {}", e);
            None
        }
    }
}

pub async fn run<B: ServoBus + 'static>(
    driver: ArmDriver<B>,
    book: ScenarioBook,
    book_path: PathBuf,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_joints = session.declare_publisher(TOPIC_STATE_JOINTS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let cancel = driver.cancel_handle();
    let driver: SharedDriver<B> = Arc::new(Mutex::new(driver));
    let (health_tx, health_rx) = watch::channel(RuntimeHealth::Idle);
    let (cmd_tx, cmd_rx) = mpsc::channel();

    let control = ControlLoop {
        driver: Arc::clone(&driver),
        cancel: Arc::clone(&cancel),
        book,
        book_path,
        health: health_tx,
    };
    thread::Builder::new()
        .name("arm-control".to_string())
        .spawn(move || control.run(cmd_rx))?;

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let state_every = (LOOP_HZ / STATE_HZ).max(1);
    let mut ticks: u64 = 0;

    info!("Runtime started: {}Hz command loop, {}Hz state", LOOP_HZ, STATE_HZ);
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {}", TOPIC_STATE_JOINTS, TOPIC_HEALTH);

    loop {
        tick.tick().await;
        ticks += 1;

        // 1. Drain all pending commands (non-blocking), queue them in order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ArmCommand>(&payload) {
                Ok(cmd) => {
                    info!("Received command: {:?}", &cmd);
                    if cmd.is_interrupt() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    cmd_tx.send(cmd)?;
                }
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                }
            }
        }

        if ticks % state_every != 0 {
            continue;
        }

        // 2. Publish measured state unless a motion holds the bus
        if let Some(state) = sample_state(&driver) {
            pub_joints.put(serde_json::to_string(&state)?).await?;
        }

        // 3. Publish health
        let health = *health_rx.borrow();
        pub_health.put(serde_json::to_string(&health)?).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{Calibration, RobotConfig, ServoController, SimulatedBus, TrajectorySettings};

    fn control_loop() -> (ControlLoop<SimulatedBus>, watch::Receiver<RuntimeHealth>, PathBuf) {
        let controller = ServoController::new(
            SimulatedBus::new(&[1, 2, 3, 4, 5, 6]),
            Calibration::dynamixel_default(),
        );
        let mut driver = ArmDriver::with_pacer(
            controller,
            RobotConfig::new(9.1, 15.8, 21.9, 2.0),
            TrajectorySettings::default(),
            Box::new(crate::arm::trajectory::tests::CountingPacer::default()),
        );
        driver.startup().unwrap();
        let cancel = driver.cancel_handle();
        let (health, health_rx) = watch::channel(RuntimeHealth::Idle);
        let book_path =
            std::env::temp_dir().join(format!("arm_runtime_scenarios_{}.json", std::process::id()));
        let control = ControlLoop {
            driver: Arc::new(Mutex::new(driver)),
            cancel,
            book: ScenarioBook::new(),
            book_path: book_path.clone(),
            health,
        };
        (control, health_rx, book_path)
    }

    #[test]
    fn test_commands_run_in_order() {
        let (control, health, book_path) = control_loop();
        let driver = Arc::clone(&control.driver);
        let (tx, rx) = mpsc::channel();

        tx.send(ArmCommand::Angles {
            angles: [1.5, 1.0, -1.2, 0.0, 0.6, 0.0],
            time: 0.5,
        })
        .unwrap();
        tx.send(ArmCommand::Record {
            scenario: "home".to_string(),
        })
        .unwrap();
        tx.send(ArmCommand::Speed { percentage: 50 }).unwrap();
        tx.send(ArmCommand::Disable).unwrap();
        drop(tx);
        control.run(rx);

        let saved = ScenarioBook::load(&book_path).unwrap();
        let _ = std::fs::remove_file(&book_path);
        assert_eq!(saved.get("home").unwrap().len(), 1);

        let driver = driver.lock().unwrap();
        assert!(!driver.controller().is_torque_enabled());
        assert_eq!(*health.borrow(), RuntimeHealth::Idle);
    }

    #[test]
    fn test_failed_command_reports_fault() {
        let (control, health, _) = control_loop();
        let (tx, rx) = mpsc::channel();
        tx.send(ArmCommand::Replay {
            scenario: "missing".to_string(),
        })
        .unwrap();
        drop(tx);
        control.run(rx);
        assert_eq!(*health.borrow(), RuntimeHealth::Fault);
    }

    #[test]
    fn test_raised_cancel_skips_queued_motion_until_stop() {
        let (control, _, _) = control_loop();
        let driver = Arc::clone(&control.driver);
        let cancel = Arc::clone(&control.cancel);
        let (tx, rx) = mpsc::channel();

        // Stop arrived while these moves were still queued
        cancel.store(true, Ordering::SeqCst);
        tx.send(ArmCommand::Angles {
            angles: [1.5, 1.0, -1.2, 0.0, 0.6, 0.0],
            time: 1.0,
        })
        .unwrap();
        tx.send(ArmCommand::Stop).unwrap();
        drop(tx);
        control.run(rx);

        assert!(!cancel.load(Ordering::SeqCst));
        let driver = driver.lock().unwrap();
        let bus = driver.controller().bus();
        assert!(bus.sync_writes(crate::arm::bus::Register::GoalPosition).is_empty());
    }
}
