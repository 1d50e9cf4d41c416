// High-level arm driver
//
// Combines kinematics, trajectory generation and the servo controller into one
// handle: the arm geometry, the bus, the step rate and the elbow branch used by
// the previous move all live here instead of in globals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::bus::ServoBus;
use super::controller::ServoController;
use super::error::Result;
use super::kinematics::inverse_kinematics_near;
use super::pose::{Flip, JointAngles, Pose, RobotConfig};
use super::scenario::ScenarioBook;
use super::trajectory::{
    JointSink, Motion, Pacer, RealTimePacer, TrajectoryGenerator, TrajectorySettings, segment_flip,
};

/// Below this joint 3 magnitude the elbow is straight and its branch is not measurable
const STRAIGHT_ELBOW_EPS: f64 = 0.01;

/// How a motion ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionOutcome {
    /// Every step was sent; holds the final setpoint
    Completed { steps: usize, last: Option<JointAngles> },
    /// Abandoned between steps after `steps` were sent
    Cancelled { steps: usize },
}

impl MotionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MotionOutcome::Cancelled { .. })
    }
}

pub struct ArmDriver<B: ServoBus> {
    controller: ServoController<B>,
    generator: TrajectoryGenerator,
    pacer: Box<dyn Pacer + Send>,
    last_flip: Flip,
    cancel: Arc<AtomicBool>,
}

impl<B: ServoBus> ArmDriver<B> {
    pub fn new(controller: ServoController<B>, config: RobotConfig, settings: TrajectorySettings) -> Self {
        Self::with_pacer(controller, config, settings, Box::new(RealTimePacer))
    }

    /// Create with a custom step pacer
    pub fn with_pacer(
        controller: ServoController<B>,
        config: RobotConfig,
        settings: TrajectorySettings,
        pacer: Box<dyn Pacer + Send>,
    ) -> Self {
        Self {
            controller,
            generator: TrajectoryGenerator::new(config, settings),
            pacer,
            last_flip: Flip::Unspecified,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &RobotConfig {
        &self.generator.config
    }

    pub fn settings(&self) -> &TrajectorySettings {
        &self.generator.settings
    }

    pub fn controller(&self) -> &ServoController<B> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ServoController<B> {
        &mut self.controller
    }

    /// Branch used by the most recent move; stands in for the measured branch while the elbow is straight
    pub fn last_flip(&self) -> Flip {
        self.last_flip
    }

    /// Flag that abandons the running motion before its next step when raised
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Bring the arm up: operating modes, torque, motion profiles and gains
    pub fn startup(&mut self) -> Result<()> {
        self.controller.initialize()?;
        self.controller.set_velocity_profile()?;
        self.controller.set_pid()?;
        info!("Arm ready");
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.controller.enable_servos()
    }

    /// Release all joints; the arm will no longer hold its pose
    pub fn disable(&mut self) -> Result<()> {
        self.controller.disable_servos()
    }

    pub fn set_speed(&mut self, percentage: u8) -> Result<()> {
        self.controller.set_profile_velocity_percentage(percentage)
    }

    pub fn current_angles(&mut self) -> Result<JointAngles> {
        self.controller.get_angles()
    }

    /// Measured end-effector pose, tagged with the branch the arm is in
    pub fn current_pose(&mut self) -> Result<Pose> {
        let angles = self.controller.get_angles()?;
        Ok(Pose::from_measured(&angles, self.config()))
    }

    // Measured pose of `angles`, tagged with the branch the arm is in
    fn start_pose(&self, angles: &JointAngles) -> Pose {
        let pose = Pose::from_measured(angles, self.config());
        if angles[3].abs() < STRAIGHT_ELBOW_EPS {
            return pose.with_flip(self.last_flip.resolved());
        }
        pose
    }

    /// Straight-line move from the measured pose to `stop`, lasting `stop.time`
    pub fn move_line(&mut self, stop: &Pose) -> Result<MotionOutcome> {
        let seed = self.controller.get_angles()?;
        let start = self.start_pose(&seed);
        let flip = segment_flip(&start, stop);
        info!("Line move to ({:.2}, {:.2}, {:.2}) flip {:?}", stop.x, stop.y, stop.z, flip);

        let motion = self.generator.interpolate_cartesian(
            &start,
            stop,
            &seed,
            &mut self.controller,
            &mut *self.pacer,
        );
        let outcome = drive(motion, &self.cancel)?;
        self.last_flip = flip.resolved();
        Ok(outcome)
    }

    /// Joint-space move from the measured angles to the solution of `stop`, lasting `duration`
    ///
    /// Fails before any motion if `stop` has no solution on the chosen branch, or the
    /// solution is outside the calibrated range.
    pub fn move_pose_to_pose(&mut self, stop: &Pose, duration: f64) -> Result<MotionOutcome> {
        let start = self.controller.get_angles()?;
        let flip = segment_flip(&self.start_pose(&start), stop);
        info!(
            "Joint-space move to ({:.2}, {:.2}, {:.2}) in {}s flip {:?}",
            stop.x, stop.y, stop.z, duration, flip
        );

        let target = stop.clone().with_flip(flip);
        let stop_angles = inverse_kinematics_near(&target, self.config(), &start)?;
        self.controller.angles_to_raw(&stop_angles)?;
        let motion = self.generator.interpolate_angles(
            start,
            stop_angles,
            duration,
            &mut self.controller,
            &mut *self.pacer,
        );
        let outcome = drive(motion, &self.cancel)?;
        self.last_flip = flip.resolved();
        Ok(outcome)
    }

    /// Joint-space move from the measured angles to `stop` lasting `duration`
    pub fn move_angles(&mut self, stop: &JointAngles, duration: f64) -> Result<MotionOutcome> {
        let start = self.controller.get_angles()?;
        info!("Angle move to {:?} in {}s", stop, duration);
        self.controller.angles_to_raw(stop)?;

        let motion = self.generator.interpolate_angles(
            start,
            *stop,
            duration,
            &mut self.controller,
            &mut *self.pacer,
        );
        drive(motion, &self.cancel)
    }

    /// Appends the measured pose to a scenario
    pub fn record(&mut self, book: &mut ScenarioBook, name: &str) -> Result<Pose> {
        let pose = self.current_pose()?;
        book.record(name, pose.clone());
        Ok(pose)
    }

    /// Visits every pose of a scenario with joint-space moves, each lasting that pose's `time`
    pub fn replay(&mut self, book: &ScenarioBook, name: &str) -> Result<MotionOutcome> {
        let poses = book.get(name)?;
        info!("Replaying scenario '{}' ({} poses)", name, poses.len());

        let mut steps = 0;
        let mut last = None;
        for pose in poses {
            match self.move_pose_to_pose(pose, pose.time)? {
                MotionOutcome::Completed { steps: sent, last: angles } => {
                    steps += sent;
                    last = angles;
                }
                MotionOutcome::Cancelled { steps: sent } => {
                    return Ok(MotionOutcome::Cancelled { steps: steps + sent });
                }
            }
        }
        Ok(MotionOutcome::Completed { steps, last })
    }
}

/// Runs a motion to the end unless `cancel` is raised between steps
fn drive<I, S, P>(mut motion: Motion<'_, I, S, P>, cancel: &AtomicBool) -> Result<MotionOutcome>
where
    I: Iterator<Item = Result<JointAngles>>,
    S: JointSink + ?Sized,
    P: Pacer + ?Sized,
{
    let mut last = None;
    loop {
        if cancel.load(Ordering::SeqCst) {
            warn!("Motion cancelled after {} steps", motion.sent());
            return Ok(MotionOutcome::Cancelled { steps: motion.sent() });
        }
        match motion.next() {
            Some(step) => last = Some(step?),
            None => break,
        }
    }
    debug!("Motion completed in {} steps", motion.sent());
    Ok(MotionOutcome::Completed {
        steps: motion.sent(),
        last,
    })
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::arm::bus::Register;
    use crate::arm::calibration::Calibration;
    use crate::arm::error::ArmError;
    use crate::arm::kinematics::forward_position_kinematics;
    use crate::arm::sim::SimulatedBus;
    use crate::arm::trajectory::tests::CountingPacer;

    const CONFIG: RobotConfig = RobotConfig::new(9.1, 15.8, 21.9, 2.0);

    /// Raises the cancel flag once `after` steps have been paced
    struct CancellingPacer {
        cancel: Arc<AtomicBool>,
        after: usize,
        waits: usize,
    }

    impl Pacer for CancellingPacer {
        fn wait(&mut self, _step_started: Instant, _period: Duration) {
            self.waits += 1;
            if self.waits == self.after {
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    fn driver() -> ArmDriver<SimulatedBus> {
        let controller = ServoController::new(
            SimulatedBus::new(&[1, 2, 3, 4, 5, 6]),
            Calibration::dynamixel_default(),
        );
        let mut driver = ArmDriver::with_pacer(
            controller,
            CONFIG,
            TrajectorySettings::default(),
            Box::new(CountingPacer::default()),
        );
        driver.startup().unwrap();
        driver
    }

    /// Joint-space move to a known reachable pose so later moves start inside the calibration
    fn park(driver: &mut ArmDriver<SimulatedBus>) {
        let home = JointAngles::new([1.5, 1.0, -1.2, 0.0, 0.6, 0.0]);
        driver.move_angles(&home, 0.0).unwrap();
        driver.controller_mut().bus_mut().clear_log();
    }

    fn goal_writes(driver: &ArmDriver<SimulatedBus>) -> usize {
        driver.controller().bus().sync_writes(Register::GoalPosition).len()
    }

    #[test]
    fn test_pose_to_pose_sends_eleven_setpoints() {
        let mut driver = driver();
        park(&mut driver);

        let stop = Pose::new(0.0, 25.0, 9.1).with_flip(Flip::A);
        let outcome = driver.move_pose_to_pose(&stop, 1.0).unwrap();

        assert!(matches!(outcome, MotionOutcome::Completed { steps: 11, .. }));
        assert_eq!(goal_writes(&driver), 11);
        assert_eq!(driver.last_flip(), Flip::A);

        let reached = driver.current_angles().unwrap();
        let tip = forward_position_kinematics(&reached, &CONFIG).p6;
        // Raw quantization of six joints
        assert!(tip.x.abs() < 0.1);
        assert!((tip.y - 25.0).abs() < 0.1);
        assert!((tip.z - 9.1).abs() < 0.1);
    }

    #[test]
    fn test_line_move_reaches_target() {
        let mut driver = driver();
        park(&mut driver);

        // Inwards and down, keeping the tool orientation
        let mut stop = driver.current_pose().unwrap().with_time(0.5);
        stop.x = 3.0;
        stop.y = 24.0;
        stop.z = 11.0;
        let outcome = driver.move_line(&stop).unwrap();
        assert!(matches!(outcome, MotionOutcome::Completed { steps: 6, .. }));

        let pose = driver.current_pose().unwrap();
        assert!((pose.x - 3.0).abs() < 0.1);
        assert!((pose.y - 24.0).abs() < 0.1);
        assert!((pose.z - 11.0).abs() < 0.1);
    }

    #[test]
    fn test_unreachable_target_moves_nothing() {
        let mut driver = driver();
        park(&mut driver);

        let result = driver.move_pose_to_pose(&Pose::new(0.0, 80.0, 9.1), 1.0);
        assert!(matches!(result, Err(ArmError::Reachability(_))));
        assert_eq!(goal_writes(&driver), 0);
    }

    #[test]
    fn test_out_of_range_solution_moves_nothing() {
        let mut driver = driver();
        park(&mut driver);

        // Elbow down at this height folds joints 2 and 3 past their limits
        let result = driver.move_pose_to_pose(&Pose::new(0.0, 25.0, 9.1).with_flip(Flip::B), 1.0);
        assert!(matches!(result, Err(ArmError::OutOfRange { .. })));

        let result = driver.move_angles(&JointAngles::new([1.5, 1.0, -1.2, PI + 0.2, 0.6, 0.0]), 1.0);
        assert!(matches!(result, Err(ArmError::OutOfRange { joint: 4, .. })));
        assert_eq!(goal_writes(&driver), 0);
    }

    #[test]
    fn test_cancel_stops_between_steps() {
        let controller = ServoController::new(
            SimulatedBus::new(&[1, 2, 3, 4, 5, 6]),
            Calibration::dynamixel_default(),
        );
        let cancel = Arc::new(AtomicBool::new(false));
        let mut driver = ArmDriver::with_pacer(
            controller,
            CONFIG,
            TrajectorySettings::default(),
            Box::new(CancellingPacer {
                cancel: Arc::clone(&cancel),
                after: 3,
                waits: 0,
            }),
        );
        driver.cancel = cancel;
        driver.startup().unwrap();

        let start = JointAngles::new([1.5, 1.0, -1.2, 0.0, 0.6, 0.0]);
        let outcome = driver.move_angles(&start, 2.0).unwrap();
        assert_eq!(outcome, MotionOutcome::Cancelled { steps: 3 });
        assert_eq!(goal_writes(&driver), 3);

        driver.clear_cancel();
        let outcome = driver.move_angles(&start, 0.0).unwrap();
        assert!(!outcome.is_cancelled());
    }

    #[test]
    fn test_record_and_replay() {
        let mut driver = driver();
        park(&mut driver);

        let mut book = ScenarioBook::new();
        let recorded = driver.record(&mut book, "demo").unwrap();
        assert!(recorded.measured_orientation.is_some());

        driver
            .move_angles(&JointAngles::new([1.2, 1.1, -1.4, 0.3, 0.5, -0.2]), 0.3)
            .unwrap();
        book.record("demo", Pose::new(0.0, 25.0, 9.1).with_time(0.5));
        driver.controller_mut().bus_mut().clear_log();

        let outcome = driver.replay(&book, "demo").unwrap();
        // 1s back to the recorded pose, then 0.5s to the second pose
        assert!(matches!(outcome, MotionOutcome::Completed { steps: 17, .. }));
        assert_eq!(goal_writes(&driver), 17);

        assert!(matches!(
            driver.replay(&book, "missing"),
            Err(ArmError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_flip_is_remembered() {
        let mut driver = driver();
        park(&mut driver);

        // High targets keep the elbow-down solution inside joint 3's range
        driver
            .move_pose_to_pose(&Pose::new(0.0, 23.92, 35.02).with_flip(Flip::B), 0.0)
            .unwrap();
        assert_eq!(driver.last_flip(), Flip::B);

        driver
            .move_pose_to_pose(&Pose::new(2.0, 23.92, 35.02), 0.0)
            .unwrap();
        assert_eq!(driver.last_flip(), Flip::B);
        assert!(driver.current_angles().unwrap()[3] > 0.0);
    }

    #[test]
    fn test_straight_elbow_keeps_previous_branch() {
        let straight = JointAngles::new([1.5, 0.5, 0.0, 0.0, 0.6, 0.0]);
        let target = Pose::new(0.0, 23.92, 35.02);

        // Nothing moved yet: branch A
        let mut fresh = driver();
        fresh.move_angles(&straight, 0.0).unwrap();
        fresh.move_pose_to_pose(&target, 0.0).unwrap();
        assert_eq!(fresh.last_flip(), Flip::A);
        assert!(fresh.current_angles().unwrap()[3] < 0.0);

        let mut after_b = driver();
        park(&mut after_b);
        after_b
            .move_pose_to_pose(&target.clone().with_flip(Flip::B), 0.0)
            .unwrap();
        after_b.move_angles(&straight, 0.0).unwrap();
        after_b.move_pose_to_pose(&target, 0.0).unwrap();
        assert_eq!(after_b.last_flip(), Flip::B);
        assert!(after_b.current_angles().unwrap()[3] > 0.0);
    }

    #[test]
    fn test_line_from_negative_wrist_stays_on_that_side() {
        let mut driver = driver();
        let measured = JointAngles::new([1.5, 1.0, -1.2, 0.0, -0.6, 0.0]);
        driver.move_angles(&measured, 0.0).unwrap();
        driver.controller_mut().bus_mut().clear_log();

        let mut stop = driver.current_pose().unwrap().with_time(0.5);
        stop.x += 0.5;
        driver.move_line(&stop).unwrap();

        let writes = driver.controller().bus().sync_writes(Register::GoalPosition);
        assert_eq!(writes.len(), 6);
        for data in writes {
            let (_, joint4) = data[3];
            let (_, joint5) = data[4];
            // Joint 4 near 0 rad (raw 2048) and joint 5 still negative
            assert!((joint4 as i64 - 2048).abs() < 50, "joint 4 raw {}", joint4);
            assert!(joint5 < 2048, "joint 5 raw {}", joint5);
        }
    }
}
