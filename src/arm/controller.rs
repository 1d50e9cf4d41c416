// Servo bus controller: the only component that talks to the actuators
//
// Converts joint angles to raw servo units through the calibration table and
// sends one synchronized write per setpoint so all joints start together.

use tracing::{debug, info, warn};

use super::bus::{BusError, OperatingMode, Register, ServoBus};
use super::calibration::Calibration;
use super::error::{ArmError, Result};
use super::pose::{JOINT_COUNT, JointAngles};
use super::trajectory::JointSink;

/// Highest raw position reachable in single-turn position mode
const SINGLE_TURN_MAX_RAW: i32 = 4095;

pub struct ServoController<B: ServoBus> {
    bus: B,
    calibration: Calibration,
    torque_enabled: bool,
}

impl<B: ServoBus> ServoController<B> {
    pub fn new(bus: B, calibration: Calibration) -> Self {
        Self {
            bus,
            calibration,
            torque_enabled: false,
        }
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn is_torque_enabled(&self) -> bool {
        self.torque_enabled
    }

    /// Swap the calibration table (never during motion: needs exclusive access)
    pub fn recalibrate(&mut self, calibration: Calibration) {
        info!("Applying new calibration");
        self.calibration = calibration;
    }

    fn check_joint(joint: usize) -> Result<()> {
        if (1..=JOINT_COUNT).contains(&joint) {
            Ok(())
        } else {
            Err(ArmError::InvalidArgument(format!(
                "joint {} does not exist (1..={})",
                joint, JOINT_COUNT
            )))
        }
    }

    fn id(&self, joint: usize) -> u8 {
        self.calibration.servo(joint).id
    }

    /// Check that every servo answers
    pub fn ping_all(&mut self) -> Result<()> {
        for id in self.calibration.ids() {
            if self.bus.ping(id)? {
                debug!("Servo {} responding", id);
            } else {
                warn!("Servo {} not responding to ping", id);
                return Err(ArmError::Transport(BusError::Timeout { id }));
            }
        }
        Ok(())
    }

    /// Prepare the servos for position control
    ///
    /// Pings every servo, disables torque, selects single- or multi-turn
    /// position mode from the calibrated raw range, then enables torque.
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing servos {:?} for position control", self.calibration.ids());
        self.ping_all()?;

        // Torque must be off before changing operating mode
        self.disable_servos()?;

        for servo in self.calibration.servos() {
            let (low, high) = servo.raw_bounds();
            let mode = if low < 0 || high > SINGLE_TURN_MAX_RAW {
                OperatingMode::ExtendedPosition
            } else {
                OperatingMode::Position
            };
            debug!("Servo {} operating mode {:?}", servo.id, mode);
            self.bus.set_operating_mode(servo.id, mode)?;
        }

        self.enable_servos()?;
        info!("Servos initialized successfully");
        Ok(())
    }

    /// Enable torque on all joints
    pub fn enable_servos(&mut self) -> Result<()> {
        info!("Enabling torque on all servos");
        for id in self.calibration.ids() {
            self.bus.enable_torque(id)?;
        }
        self.torque_enabled = true;
        Ok(())
    }

    /// Disable torque on all joints with a single broadcast, effective immediately
    pub fn disable_servos(&mut self) -> Result<()> {
        info!("Disabling torque on all servos");
        let data: Vec<(u8, u32)> = self.calibration.ids().into_iter().map(|id| (id, 0)).collect();
        self.bus.sync_write(Register::TorqueEnable, &data)?;
        self.torque_enabled = false;
        Ok(())
    }

    /// Push each joint's calibrated profile velocity and acceleration
    pub fn set_velocity_profile(&mut self) -> Result<()> {
        info!("Setting velocity profiles");
        for servo in self.calibration.servos() {
            self.bus
                .write(servo.id, Register::ProfileVelocity, servo.max_velocity)?;
            self.bus
                .write(servo.id, Register::ProfileAcceleration, servo.max_acceleration)?;
        }
        Ok(())
    }

    /// Scale every joint's profile velocity to `percentage` of its calibrated maximum
    pub fn set_profile_velocity_percentage(&mut self, percentage: u8) -> Result<()> {
        if percentage == 0 || percentage > 100 {
            return Err(ArmError::InvalidArgument(format!(
                "velocity percentage {} not in 1..=100",
                percentage
            )));
        }
        info!("Scaling profile velocity to {}%", percentage);
        for servo in self.calibration.servos() {
            // At least 1: a profile velocity of 0 means unlimited
            let scaled = u64::from(servo.max_velocity) * u64::from(percentage) / 100;
            let velocity = u32::try_from(scaled).unwrap_or(servo.max_velocity).max(1);
            self.bus.write(servo.id, Register::ProfileVelocity, velocity)?;
        }
        Ok(())
    }

    /// Push each joint's calibrated PID gains
    pub fn set_pid(&mut self) -> Result<()> {
        info!("Setting PID gains");
        for servo in self.calibration.servos() {
            Self::write_pid(&mut self.bus, servo.id, servo.p, servo.i, servo.d)?;
        }
        Ok(())
    }

    /// Override one joint's PID gains (tuning)
    pub fn set_pid_single_servo(&mut self, joint: usize, p: u16, i: u16, d: u16) -> Result<()> {
        Self::check_joint(joint)?;
        let id = self.id(joint);
        info!("Setting PID of servo {}: p={}, i={}, d={}", id, p, i, d);
        Self::write_pid(&mut self.bus, id, p, i, d)
    }

    fn write_pid(bus: &mut B, id: u8, p: u16, i: u16, d: u16) -> Result<()> {
        bus.write(id, Register::PositionPGain, p as u32)?;
        bus.write(id, Register::PositionIGain, i as u32)?;
        bus.write(id, Register::PositionDGain, d as u32)?;
        Ok(())
    }

    /// Read every joint's position and convert to angles
    pub fn get_angles(&mut self) -> Result<JointAngles> {
        let ids = self.calibration.ids();
        let raw = self.bus.sync_read(Register::PresentPosition, &ids)?;

        let mut angles = JointAngles::zero();
        for (servo, value) in self.calibration.servos().iter().zip(raw) {
            angles[servo.joint()] = servo.raw_to_angle(value as i32);
        }
        debug!("Present angles: {:?}", angles);
        Ok(angles)
    }

    /// Convert a full angle vector to raw goals, failing on the first out-of-range joint
    pub fn angles_to_raw(&self, angles: &JointAngles) -> Result<Vec<(u8, i32)>> {
        self.calibration
            .servos()
            .iter()
            .map(|servo| Ok((servo.id, servo.angle_to_raw(angles[servo.joint()])?)))
            .collect()
    }

    /// Send one synchronized setpoint to all joints
    ///
    /// Every joint is converted and range-checked before anything is written,
    /// so a rejected vector causes no motion at all.
    pub fn move_servos(&mut self, angles: &JointAngles) -> Result<()> {
        let goals = self.angles_to_raw(angles)?;
        debug!("Moving servos to raw {:?}", goals);

        let data: Vec<(u8, u32)> = goals.into_iter().map(|(id, raw)| (id, raw as u32)).collect();
        self.bus.sync_write(Register::GoalPosition, &data)?;
        Ok(())
    }

    /// Raw present position of one joint
    pub fn get_servo_position(&mut self, joint: usize) -> Result<i32> {
        Self::check_joint(joint)?;
        let id = self.id(joint);
        Ok(self.bus.get_position(id)?)
    }

    /// Raw goal position for one joint, checked against its calibrated raw range
    pub fn set_servo_position(&mut self, joint: usize, raw: i32) -> Result<()> {
        Self::check_joint(joint)?;
        let servo = self.calibration.servo(joint);
        if !servo.contains_raw(raw) {
            let (low, high) = servo.raw_bounds();
            return Err(ArmError::OutOfRange {
                joint,
                value: raw as f64,
                min: low as f64,
                max: high as f64,
            });
        }
        let id = servo.id;
        self.bus.set_position(id, raw)?;
        Ok(())
    }
}

impl<B: ServoBus> JointSink for ServoController<B> {
    fn move_servos(&mut self, angles: &JointAngles) -> Result<()> {
        ServoController::move_servos(self, angles)
    }
}
