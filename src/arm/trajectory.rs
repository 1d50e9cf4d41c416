// Time-parameterized motion between two poses
//
// A trajectory is a lazy, finite stream of joint setpoints. Driving it with a
// `Motion` performs one control step per item: compute the setpoint, send it
// to the servos, then wait out the rest of the step period. Dropping the
// `Motion` between steps abandons the trajectory; a sent step is final.

use std::iter::Map;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::{ArmError, Result};
use super::kinematics::inverse_kinematics_near;
use super::pose::{Flip, JointAngles, Pose, RobotConfig};
use crate::config::{DEFAULT_STEPS_PER_SECOND, SAG_GAIN, SAG_SETTLE_STEPS};

/// `duration * rate` within this of an integer counts as that integer
const SAMPLE_EPS: f64 = 1e-9;

/// Quintic smoothstep `6t^5 - 15t^4 + 10t^3`, `t` clamped to [0, 1]
pub fn quintic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * t * (10.0 + t * (-15.0 + 6.0 * t))
}

/// Derivative of [`quintic`]
pub fn quintic_rate(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    30.0 * t * t * (t - 1.0) * (t - 1.0)
}

/// Number of intermediate samples, `ceil(duration * rate)`; zero for empty or invalid durations
pub fn sample_count(duration: f64, steps_per_second: f64) -> usize {
    let steps = duration * steps_per_second;
    if steps > SAMPLE_EPS {
        (steps - SAMPLE_EPS).ceil() as usize
    } else {
        0
    }
}

/// Empirical lift countering structural sag on Cartesian paths
///
/// Samples after the first `settle_steps` are raised by `gain * radius`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SagCompensation {
    pub gain: f64,
    pub settle_steps: usize,
}

impl SagCompensation {
    pub fn none() -> Self {
        Self {
            gain: 0.0,
            settle_steps: 0,
        }
    }

    pub fn offset(&self, radius: f64, step: usize) -> f64 {
        if step > self.settle_steps {
            radius * self.gain
        } else {
            0.0
        }
    }
}

impl Default for SagCompensation {
    fn default() -> Self {
        Self {
            gain: SAG_GAIN,
            settle_steps: SAG_SETTLE_STEPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySettings {
    pub steps_per_second: f64,
    pub sag: SagCompensation,
}

impl TrajectorySettings {
    pub fn with_rate(steps_per_second: f64) -> Result<Self> {
        if !(steps_per_second.is_finite() && steps_per_second > 0.0) {
            return Err(ArmError::InvalidArgument(format!(
                "steps per second must be positive, got {}",
                steps_per_second
            )));
        }
        Ok(Self {
            steps_per_second,
            ..Self::default()
        })
    }

    /// Time budget of one control step
    pub fn period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.steps_per_second).unwrap_or(Duration::ZERO)
    }
}

impl Default for TrajectorySettings {
    fn default() -> Self {
        Self {
            steps_per_second: DEFAULT_STEPS_PER_SECOND,
            sag: SagCompensation::default(),
        }
    }
}

/// Branch used for a whole segment: the stop pose's, else the start pose's
pub fn segment_flip(start: &Pose, stop: &Pose) -> Flip {
    stop.flip.or(start.flip)
}

/// Poses along a straight Cartesian segment, ending with the exact stop pose
#[derive(Debug, Clone)]
pub struct CartesianPath {
    start: Pose,
    stop: Pose,
    flip: Flip,
    sag: SagCompensation,
    samples: usize,
    step: usize,
}

impl CartesianPath {
    /// Segment from `start` to `stop` lasting `stop.time` seconds
    pub fn new(start: &Pose, stop: &Pose, settings: &TrajectorySettings) -> Self {
        Self {
            start: start.clone(),
            stop: stop.clone(),
            flip: segment_flip(start, stop),
            sag: settings.sag,
            samples: sample_count(stop.time, settings.steps_per_second),
            step: 0,
        }
    }

    pub fn flip(&self) -> Flip {
        self.flip
    }
}

impl Iterator for CartesianPath {
    type Item = Pose;

    fn next(&mut self) -> Option<Pose> {
        let step = self.step;
        if step > self.samples {
            return None;
        }
        self.step += 1;

        if step == self.samples {
            return Some(self.stop.clone().with_flip(self.flip));
        }

        let s = quintic(step as f64 / self.samples as f64);
        let mut pose = self.start.blend(&self.stop, s, self.flip);
        pose.z += self.sag.offset(pose.radius(), step);
        Some(pose)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.samples + 1).saturating_sub(self.step);
        (left, Some(left))
    }
}

impl ExactSizeIterator for CartesianPath {}

/// Cartesian path resolved to joint angles one sample at a time
#[derive(Debug, Clone)]
pub struct CartesianSetpoints {
    path: CartesianPath,
    config: RobotConfig,
    previous: JointAngles,
}

impl Iterator for CartesianSetpoints {
    type Item = Result<JointAngles>;

    fn next(&mut self) -> Option<Result<JointAngles>> {
        let pose = self.path.next()?;
        let solved = inverse_kinematics_near(&pose, &self.config, &self.previous);
        if let Ok(angles) = &solved {
            self.previous = *angles;
        }
        Some(solved)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.path.size_hint()
    }
}

/// Per-joint quintic blend between two angle vectors, ending with the exact stop vector
#[derive(Debug, Clone)]
pub struct JointPath {
    start: JointAngles,
    stop: JointAngles,
    samples: usize,
    step: usize,
}

impl JointPath {
    pub fn new(start: JointAngles, stop: JointAngles, duration: f64, settings: &TrajectorySettings) -> Self {
        Self {
            start,
            stop,
            samples: sample_count(duration, settings.steps_per_second),
            step: 0,
        }
    }
}

impl Iterator for JointPath {
    type Item = JointAngles;

    fn next(&mut self) -> Option<JointAngles> {
        let step = self.step;
        if step > self.samples {
            return None;
        }
        self.step += 1;

        if step == self.samples {
            return Some(self.stop);
        }
        Some(
            self.start
                .blend(&self.stop, quintic(step as f64 / self.samples as f64)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.samples + 1).saturating_sub(self.step);
        (left, Some(left))
    }
}

impl ExactSizeIterator for JointPath {}

/// Setpoints of a joint-space move
pub type JointSetpoints = Map<JointPath, fn(JointAngles) -> Result<JointAngles>>;

fn joint_setpoints(path: JointPath) -> JointSetpoints {
    path.map(Ok as fn(JointAngles) -> Result<JointAngles>)
}

/// Receiver of joint setpoints, normally the servo controller
pub trait JointSink {
    fn move_servos(&mut self, angles: &JointAngles) -> Result<()>;
}

/// Waits out the remainder of a control step
pub trait Pacer {
    fn wait(&mut self, step_started: Instant, period: Duration);
}

/// Blocks the calling thread until the step period has elapsed
#[derive(Debug, Clone, Copy, Default)]
pub struct RealTimePacer;

impl Pacer for RealTimePacer {
    fn wait(&mut self, step_started: Instant, period: Duration) {
        let remaining = period.saturating_sub(step_started.elapsed());
        if remaining.is_zero() {
            warn!("Control step overran its {:?} period", period);
        } else {
            thread::sleep(remaining);
        }
    }
}

/// A trajectory being executed: each `next()` is one compute-send-wait control step
///
/// Yields the setpoint that was sent. After an error the motion is over.
pub struct Motion<'a, I, S: ?Sized, P: ?Sized> {
    setpoints: I,
    sink: &'a mut S,
    pacer: &'a mut P,
    period: Duration,
    sent: usize,
    finished: bool,
}

impl<'a, I, S, P> Motion<'a, I, S, P>
where
    I: Iterator<Item = Result<JointAngles>>,
    S: JointSink + ?Sized,
    P: Pacer + ?Sized,
{
    pub fn new(setpoints: I, period: Duration, sink: &'a mut S, pacer: &'a mut P) -> Self {
        Self {
            setpoints,
            sink,
            pacer,
            period,
            sent: 0,
            finished: false,
        }
    }

    /// Number of setpoints sent so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Runs the remaining steps, returning the last setpoint sent
    pub fn finish(mut self) -> Result<Option<JointAngles>> {
        let mut last = None;
        for step in self.by_ref() {
            last = Some(step?);
        }
        Ok(last)
    }
}

impl<I, S, P> Iterator for Motion<'_, I, S, P>
where
    I: Iterator<Item = Result<JointAngles>>,
    S: JointSink + ?Sized,
    P: Pacer + ?Sized,
{
    type Item = Result<JointAngles>;

    fn next(&mut self) -> Option<Result<JointAngles>> {
        if self.finished {
            return None;
        }
        let started = Instant::now();

        let angles = match self.setpoints.next() {
            Some(Ok(angles)) => angles,
            Some(Err(e)) => {
                self.finished = true;
                return Some(Err(e));
            }
            None => {
                self.finished = true;
                return None;
            }
        };

        if let Err(e) = self.sink.move_servos(&angles) {
            self.finished = true;
            return Some(Err(e));
        }
        self.sent += 1;
        debug!("Step {} sent: {:?}", self.sent, angles);

        self.pacer.wait(started, self.period);
        Some(Ok(angles))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            // A failing step ends the motion early
            (0, self.setpoints.size_hint().1)
        }
    }
}

/// Builds trajectories for one arm geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryGenerator {
    pub config: RobotConfig,
    pub settings: TrajectorySettings,
}

impl TrajectoryGenerator {
    pub fn new(config: RobotConfig, settings: TrajectorySettings) -> Self {
        Self { config, settings }
    }

    /// Lazily solved setpoints along the straight Cartesian segment `start` -> `stop`
    ///
    /// `seed` breaks ties at singularities for the first sample; later samples
    /// use the previous sample's solution.
    pub fn cartesian_setpoints(&self, start: &Pose, stop: &Pose, seed: &JointAngles) -> CartesianSetpoints {
        CartesianSetpoints {
            path: CartesianPath::new(start, stop, &self.settings),
            config: self.config,
            previous: *seed,
        }
    }

    /// Joint-space blend between the solutions of `start` and `stop`, both solved up front
    pub fn joint_space_setpoints(
        &self,
        start: &Pose,
        stop: &Pose,
        duration: f64,
        seed: &JointAngles,
    ) -> Result<JointSetpoints> {
        let start_angles = inverse_kinematics_near(start, &self.config, seed)?;
        let stop_pose = stop.clone().with_flip(segment_flip(start, stop));
        let stop_angles = inverse_kinematics_near(&stop_pose, &self.config, &start_angles)?;
        Ok(self.angle_setpoints(start_angles, stop_angles, duration))
    }

    /// Joint-space blend between two known angle vectors
    pub fn angle_setpoints(&self, start: JointAngles, stop: JointAngles, duration: f64) -> JointSetpoints {
        joint_setpoints(JointPath::new(start, stop, duration, &self.settings))
    }

    /// Straight-line move lasting `stop.time`, resolving every sample through IK
    pub fn interpolate_cartesian<'a, S, P>(
        &self,
        start: &Pose,
        stop: &Pose,
        seed: &JointAngles,
        sink: &'a mut S,
        pacer: &'a mut P,
    ) -> Motion<'a, CartesianSetpoints, S, P>
    where
        S: JointSink + ?Sized,
        P: Pacer + ?Sized,
    {
        debug!("Cartesian move {:?} -> {:?}", start, stop);
        Motion::new(
            self.cartesian_setpoints(start, stop, seed),
            self.settings.period(),
            sink,
            pacer,
        )
    }

    /// Joint-space move lasting `duration`; fails before any motion if an endpoint is unreachable
    pub fn interpolate_joint_space<'a, S, P>(
        &self,
        start: &Pose,
        stop: &Pose,
        duration: f64,
        seed: &JointAngles,
        sink: &'a mut S,
        pacer: &'a mut P,
    ) -> Result<Motion<'a, JointSetpoints, S, P>>
    where
        S: JointSink + ?Sized,
        P: Pacer + ?Sized,
    {
        debug!("Joint-space move {:?} -> {:?} in {}s", start, stop, duration);
        let setpoints = self.joint_space_setpoints(start, stop, duration, seed)?;
        Ok(Motion::new(setpoints, self.settings.period(), sink, pacer))
    }

    /// Joint-space move between two angle vectors lasting `duration`
    pub fn interpolate_angles<'a, S, P>(
        &self,
        start: JointAngles,
        stop: JointAngles,
        duration: f64,
        sink: &'a mut S,
        pacer: &'a mut P,
    ) -> Motion<'a, JointSetpoints, S, P>
    where
        S: JointSink + ?Sized,
        P: Pacer + ?Sized,
    {
        Motion::new(
            self.angle_setpoints(start, stop, duration),
            self.settings.period(),
            sink,
            pacer,
        )
    }
}
