// Closed-form kinematics for the 6-joint arm
//
// Chain: base yaw (1), shoulder pitch (2), elbow pitch (3), then a spherical
// wrist roll-pitch-roll (4, 5, 6) whose first axis runs along the forearm.
// Joints 2 and 3 raise the arm for positive angles. All angles in radians.

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use tracing::debug;

use super::error::{ArmError, Result};
use super::pose::{Flip, JointAngles, Pose, RobotConfig};

/// Below this planar distance the wrist centre is considered on the base axis
const BASE_SINGULARITY_EPS: f64 = 1e-9;

/// Below this `sin(joint 5)` the wrist axes 4 and 6 are considered aligned
const WRIST_SINGULARITY_EPS: f64 = 1e-9;

/// Slack on the law-of-cosines argument before a pose counts as out of reach
const REACH_EPS: f64 = 1e-9;

/// Origins of the major frames along the chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkPositions {
    /// Shoulder
    pub p1: Point3<f64>,
    /// Elbow
    pub p2: Point3<f64>,
    /// Elbow frame after joint 3 (coincides with `p2`)
    pub p3: Point3<f64>,
    /// Wrist centre
    pub p4: Point3<f64>,
    /// Tool tip
    pub p6: Point3<f64>,
}

fn yaw(angle: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle)
}

// Positive pitch lifts the local x axis towards z
fn pitch(angle: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -angle)
}

// Turns the wrist frame so its z axis continues along the forearm
fn wrist_alignment() -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2)
}

fn wrist(angles: &JointAngles) -> UnitQuaternion<f64> {
    yaw(angles[4])
        * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angles[5])
        * yaw(angles[6])
}

fn rotate(rotation: UnitQuaternion<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(Translation3::identity(), rotation)
}

fn shift(x: f64, y: f64, z: f64) -> Isometry3<f64> {
    Isometry3::translation(x, y, z)
}

/// Wraps an angle into (-pi, pi]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

/// Frame origins for the given joint angles
pub fn forward_position_kinematics(angles: &JointAngles, config: &RobotConfig) -> LinkPositions {
    let shoulder = shift(0.0, 0.0, config.d1) * rotate(yaw(angles[1]));
    let elbow = shoulder * rotate(pitch(angles[2])) * shift(config.a2, 0.0, 0.0);
    let forearm = elbow * rotate(pitch(angles[3]));
    let wrist_centre = forearm * shift(config.d4, 0.0, 0.0);
    let tool = wrist_centre * rotate(wrist_alignment() * wrist(angles)) * shift(0.0, 0.0, config.d6);

    let origin = Point3::origin();
    LinkPositions {
        p1: shoulder * origin,
        p2: elbow * origin,
        p3: forearm * origin,
        p4: wrist_centre * origin,
        p6: tool * origin,
    }
}

/// End-effector orientation for the given joint angles
pub fn forward_orientation_kinematics(angles: &JointAngles) -> Rotation3<f64> {
    let rotation = yaw(angles[1])
        * pitch(angles[2])
        * pitch(angles[3])
        * wrist_alignment()
        * wrist(angles);
    rotation.to_rotation_matrix()
}

impl Pose {
    /// Pose reached by `angles`, carrying the exact rotation as measured orientation
    pub fn from_measured(angles: &JointAngles, config: &RobotConfig) -> Pose {
        let p6 = forward_position_kinematics(angles, config).p6;
        let flip = if angles[3] > 0.0 { Flip::B } else { Flip::A };
        Pose::new(p6.x, p6.y, p6.z)
            .with_measured_orientation(forward_orientation_kinematics(angles))
            .with_flip(flip)
    }
}

/// Solves joint angles for `pose` in canonical form
///
/// The shoulder faces the wrist centre, joint 5 stays in [0, pi] and every joint is
/// wrapped to (-pi, pi]. Singular configurations resolve the free joint to zero.
pub fn inverse_kinematics(pose: &Pose, config: &RobotConfig) -> Result<JointAngles> {
    solve(pose, config, &JointAngles::zero(), false)
}

/// Solves joint angles for `pose`, continuing from `seed`
///
/// Among the front and rear shoulder solutions on the requested elbow branch, and the
/// two wrist solutions (joint 5 positive or negative) of each, returns the one closest
/// to `seed`. Every revolute joint lands on the turn nearest the seed, so the result can
/// leave (-pi, pi]; the calibration decides whether the servo can follow. A joint left
/// free by a singularity keeps the seed's value.
pub fn inverse_kinematics_near(
    pose: &Pose,
    config: &RobotConfig,
    seed: &JointAngles,
) -> Result<JointAngles> {
    solve(pose, config, seed, true)
}

fn solve(pose: &Pose, config: &RobotConfig, seed: &JointAngles, continuing: bool) -> Result<JointAngles> {
    let target = Vector3::new(pose.x, pose.y, pose.z);
    if !target.iter().all(|v| v.is_finite()) {
        return Err(ArmError::Reachability(format!("non-finite position {:?}", target)));
    }

    let rotation = pose.orientation();
    check_rotation(rotation.matrix())?;

    // Wrist centre sits d6 behind the tool tip along the approach (z) axis
    let approach = rotation.matrix().column(2).into_owned();
    let centre = target - approach * config.d6;
    let flip = pose.flip.resolved();

    let on_base_axis = centre.x.hypot(centre.y) < BASE_SINGULARITY_EPS;
    let front = if on_base_axis {
        seed[1]
    } else {
        centre.y.atan2(centre.x)
    };
    let mut azimuths = vec![front];
    if continuing && !on_base_axis {
        // Reaching over the base: same wrist centre with the arm plane turned around
        azimuths.push(front + PI);
    }

    let mut candidates = Vec::with_capacity(4);
    for azimuth in azimuths {
        let arm = solve_arm(&centre, azimuth, flip, config)?;
        let wrist = solve_wrist(&rotation, &arm, seed);
        candidates.push(JointAngles::new([arm[0], arm[1], arm[2], wrist[0], wrist[1], wrist[2]]));
        if let Some(other) = mirrored_wrist(&wrist).filter(|_| continuing) {
            candidates.push(JointAngles::new([arm[0], arm[1], arm[2], other[0], other[1], other[2]]));
        }
    }

    // Ties go to the earlier candidate: front shoulder, then positive joint 5
    let chosen = if continuing {
        candidates
            .into_iter()
            .map(|candidate| follow(seed, &candidate))
            .min_by(|a, b| seed_distance(seed, a).total_cmp(&seed_distance(seed, b)))
    } else {
        candidates.first().map(canonical)
    };
    let angles = chosen.ok_or_else(|| ArmError::Reachability(format!("no solution for {:?}", pose)))?;

    if !angles.is_finite() {
        return Err(ArmError::Reachability(format!("no finite solution for {:?}", pose)));
    }
    debug!("IK {:?} -> {:?}", target, angles);
    Ok(angles)
}

fn check_rotation(m: &Matrix3<f64>) -> Result<()> {
    let orthogonality = (m.transpose() * m - Matrix3::identity()).norm();
    if !orthogonality.is_finite() || orthogonality > 1e-6 || m.determinant() < 0.0 {
        return Err(ArmError::Reachability(
            "orientation is not a proper rotation".to_string(),
        ));
    }
    Ok(())
}

// Joint 3 is left as solved: its sign is the elbow branch
const FOLLOWED_JOINTS: [usize; 5] = [1, 2, 4, 5, 6];

fn canonical(angles: &JointAngles) -> JointAngles {
    let mut wrapped = *angles;
    for joint in FOLLOWED_JOINTS {
        wrapped[joint] = wrap_angle(angles[joint]);
    }
    wrapped
}

// Moves every revolute joint onto the turn nearest the seed
fn follow(seed: &JointAngles, angles: &JointAngles) -> JointAngles {
    let mut followed = *angles;
    for joint in FOLLOWED_JOINTS {
        followed[joint] = seed[joint] + wrap_angle(angles[joint] - seed[joint]);
    }
    followed
}

fn seed_distance(seed: &JointAngles, angles: &JointAngles) -> f64 {
    angles
        .joints()
        .map(|(joint, angle)| (angle - seed[joint]).powi(2))
        .sum()
}

// Joints 1-3: place the wrist centre with the arm plane at `azimuth`
fn solve_arm(centre: &Vector3<f64>, azimuth: f64, flip: Flip, config: &RobotConfig) -> Result<[f64; 3]> {
    // Signed horizontal reach in the arm plane, height above the shoulder
    let reach = centre.x * azimuth.cos() + centre.y * azimuth.sin();
    let height = centre.z - config.d1;
    let distance_sq = reach * reach + height * height;

    let (a2, d4) = (config.a2, config.d4);
    let cos3 = (distance_sq - a2 * a2 - d4 * d4) / (2.0 * a2 * d4);
    if cos3 < -1.0 - REACH_EPS || cos3 > 1.0 + REACH_EPS || !cos3.is_finite() {
        return Err(ArmError::Reachability(format!(
            "wrist centre at distance {:.3} outside reach [{:.3}, {:.3}]",
            distance_sq.sqrt(),
            config.min_reach(),
            config.max_reach()
        )));
    }

    let bend = cos3.clamp(-1.0, 1.0).acos();
    let theta3 = match flip {
        Flip::B => bend,
        _ => -bend,
    };
    let theta2 = height.atan2(reach) - (d4 * theta3.sin()).atan2(a2 + d4 * theta3.cos());
    Ok([azimuth, theta2, theta3])
}

// Joints 4-6: residual rotation decomposed as Rz(4) * Ry(5) * Rz(6), joint 5 in [0, pi]
fn solve_wrist(rotation: &Rotation3<f64>, arm: &[f64; 3], seed: &JointAngles) -> [f64; 3] {
    let frame = yaw(arm[0]) * pitch(arm[1]) * pitch(arm[2]) * wrist_alignment();
    let residual = frame.to_rotation_matrix().inverse() * rotation;
    let m = residual.matrix();

    let sin5 = m[(0, 2)].hypot(m[(1, 2)]);
    let theta5 = sin5.atan2(m[(2, 2)]);

    let (theta4, theta6) = if sin5 > WRIST_SINGULARITY_EPS {
        (m[(1, 2)].atan2(m[(0, 2)]), m[(2, 1)].atan2(-m[(2, 0)]))
    } else if m[(2, 2)] > 0.0 {
        // Axes 4 and 6 aligned: only their sum is defined
        let sum = m[(1, 0)].atan2(m[(0, 0)]);
        (seed[4], sum - seed[4])
    } else {
        // Flipped over: only their difference is defined
        let difference = (-m[(1, 0)]).atan2(-m[(0, 0)]);
        (seed[4], seed[4] - difference)
    };
    [theta4, theta5, theta6]
}

// Same wrist rotation with joint 5 negated; none at a singularity, where joint 4 is already the seed's
fn mirrored_wrist(wrist: &[f64; 3]) -> Option<[f64; 3]> {
    if wrist[1].sin() <= WRIST_SINGULARITY_EPS {
        return None;
    }
    Some([wrist[0] + PI, -wrist[1], wrist[2] + PI])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-6;

    fn dynamixel_arm() -> RobotConfig {
        RobotConfig::new(9.1, 15.8, 21.9, 2.0)
    }

    fn assert_angles_close(a: &JointAngles, b: &JointAngles) {
        assert!(
            a.max_distance(b) < TOLERANCE,
            "angles differ: {:?} vs {:?}",
            a,
            b
        );
    }

    fn assert_same_pose(a: &JointAngles, b: &JointAngles, config: &RobotConfig) {
        let pa = forward_position_kinematics(a, config).p6;
        let pb = forward_position_kinematics(b, config).p6;
        assert!((pa - pb).norm() < TOLERANCE, "positions differ: {} vs {}", pa, pb);
        let ra = forward_orientation_kinematics(a);
        let rb = forward_orientation_kinematics(b);
        assert!((ra.matrix() - rb.matrix()).norm() < TOLERANCE);
    }

    #[test]
    fn test_zero_angles_stretch_along_x() {
        let config = dynamixel_arm();
        let links = forward_position_kinematics(&JointAngles::zero(), &config);
        assert!((links.p1 - Point3::new(0.0, 0.0, 9.1)).norm() < TOLERANCE);
        assert!((links.p2 - Point3::new(15.8, 0.0, 9.1)).norm() < TOLERANCE);
        assert_eq!(links.p2, links.p3);
        assert!((links.p4 - Point3::new(37.7, 0.0, 9.1)).norm() < TOLERANCE);
        assert!((links.p6 - Point3::new(39.7, 0.0, 9.1)).norm() < TOLERANCE);

        // Tool approach axis runs along the forearm
        let rotation = forward_orientation_kinematics(&JointAngles::zero());
        let approach = rotation.matrix().column(2).into_owned();
        assert!((approach - Vector3::x()).norm() < TOLERANCE);
    }

    #[test]
    fn test_orientation_is_orthonormal() {
        let angles = JointAngles::new([0.3, 1.1, -0.4, 2.0, -1.2, 0.7]);
        let m = *forward_orientation_kinematics(&angles).matrix();
        assert!((m.transpose() * m - Matrix3::identity()).norm() < 1e-12);
        assert!((m.determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reference_pose_reaches_target() {
        let config = dynamixel_arm();
        let pose = Pose::new(0.0, 25.0, 9.1).with_flip(Flip::A);

        let angles = inverse_kinematics(&pose, &config).unwrap();
        assert_eq!(angles.0.len(), 7);
        assert_eq!(angles[0], 0.0);

        let p6 = forward_position_kinematics(&angles, &config).p6;
        assert!((p6.x - 0.0).abs() < 1e-3);
        assert!((p6.y - 25.0).abs() < 1e-3);
        assert!((p6.z - 9.1).abs() < 1e-3);
        assert!((angles[1] - FRAC_PI_2).abs() < TOLERANCE);
    }

    #[test]
    fn test_round_trip_both_branches() {
        let config = dynamixel_arm();
        let cases = [
            JointAngles::new([0.7, 0.9, -0.6, 0.4, 0.8, -0.3]),
            JointAngles::new([-1.2, 0.4, 0.5, -2.1, 1.9, 2.5]),
            JointAngles::new([2.6, 1.4, -1.1, 0.0, 0.3, 0.0]),
        ];

        for original in cases {
            let pose = Pose::from_measured(&original, &config);
            let solved = inverse_kinematics(&pose, &config).unwrap();
            assert_angles_close(&solved, &original);
        }
    }

    #[test]
    fn test_seeded_round_trip_recovers_every_configuration() {
        let config = dynamixel_arm();
        let cases = [
            // Wrist bent the other way
            JointAngles::new([1.5, 1.0, -1.2, 0.0, -0.6, 0.0]),
            // Wrist centre behind the base axis
            JointAngles::new([1.5, 2.2, -0.5, 0.0, 0.6, 0.0]),
            JointAngles::new([0.4, 2.6, -0.9, 1.2, -1.1, -2.0]),
            JointAngles::new([2.0, 0.7, 0.8, -0.4, 0.9, 1.3]),
        ];

        for original in cases {
            let pose = Pose::from_measured(&original, &config);
            let mut seed = original;
            for joint in 1..=6 {
                seed[joint] += 0.2;
            }
            let solved = inverse_kinematics_near(&pose, &config, &seed).unwrap();
            assert_angles_close(&solved, &original);
        }

        // Unseeded keeps joint 5 positive: same pose, other representation
        let original = JointAngles::new([1.5, 1.0, -1.2, 0.0, -0.6, 0.0]);
        let pose = Pose::from_measured(&original, &config);
        let canonical = inverse_kinematics(&pose, &config).unwrap();
        assert!((canonical[5] - 0.6).abs() < TOLERANCE);
        assert!((canonical[4].abs() - PI).abs() < TOLERANCE);
        assert_same_pose(&canonical, &original, &config);

        // Unseeded faces the wrist centre
        let behind = JointAngles::new([1.5, 2.2, -0.5, 0.0, 0.6, 0.0]);
        let canonical = inverse_kinematics(&Pose::from_measured(&behind, &config), &config).unwrap();
        assert!((canonical[1] - (1.5 - PI)).abs() < TOLERANCE);
        assert_same_pose(&canonical, &behind, &config);
    }

    #[test]
    fn test_seeded_solutions_unwrap_past_half_turn() {
        let config = dynamixel_arm();
        let mut previous = JointAngles::new([1.5, 1.0, -1.2, 2.8, 0.6, 0.3]);

        for step in 1..=20 {
            let expected = JointAngles::new([1.5, 1.0, -1.2, 2.8 + 0.03 * step as f64, 0.6, 0.3]);
            let pose = Pose::from_measured(&expected, &config);
            let solved = inverse_kinematics_near(&pose, &config, &previous).unwrap();
            assert_angles_close(&solved, &expected);
            assert!(solved.max_distance(&previous) < 0.05);
            previous = solved;
        }
        assert!(previous[4] > PI);
    }

    #[test]
    fn test_branches_differ_but_reach_same_pose() {
        let config = dynamixel_arm();
        let pose = Pose::new(10.0, 20.0, 15.0).with_orientation(0.2, 0.4, -0.1);

        let up = inverse_kinematics(&pose.clone().with_flip(Flip::A), &config).unwrap();
        let down = inverse_kinematics(&pose.clone().with_flip(Flip::B), &config).unwrap();

        assert!(up.max_distance(&down) > 0.1);
        assert!(up[3] < 0.0 && down[3] > 0.0);
        assert!(up[2] > down[2], "elbow up keeps the upper arm higher");
        assert_same_pose(&up, &down, &config);

        let p6 = forward_position_kinematics(&up, &config).p6;
        assert!((p6 - Point3::new(10.0, 20.0, 15.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_unspecified_flip_uses_branch_a() {
        let config = dynamixel_arm();
        let pose = Pose::new(5.0, 22.0, 12.0);
        let default = inverse_kinematics(&pose, &config).unwrap();
        let explicit = inverse_kinematics(&pose.clone().with_flip(Flip::A), &config).unwrap();
        assert_angles_close(&default, &explicit);
    }

    #[test]
    fn test_out_of_reach_is_rejected() {
        let config = dynamixel_arm();

        let too_far = Pose::new(100.0, 0.0, 0.0);
        assert!(matches!(
            inverse_kinematics(&too_far, &config),
            Err(ArmError::Reachability(_))
        ));

        // Wrist centre right on the shoulder
        let too_close = Pose::new(0.5, 0.0, 11.1);
        assert!(matches!(
            inverse_kinematics(&too_close, &config),
            Err(ArmError::Reachability(_))
        ));

        let nan = Pose::new(f64::NAN, 1.0, 1.0);
        assert!(matches!(
            inverse_kinematics(&nan, &config),
            Err(ArmError::Reachability(_))
        ));
    }

    #[test]
    fn test_improper_rotation_is_rejected() {
        let config = dynamixel_arm();
        let skewed = Rotation3::from_matrix_unchecked(Matrix3::new(
            1.0, 0.5, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0,
        ));
        let mut pose = Pose::new(0.0, 25.0, 9.1);
        pose.measured_orientation = Some(skewed);
        assert!(matches!(
            inverse_kinematics(&pose, &config),
            Err(ArmError::Reachability(_))
        ));
    }

    #[test]
    fn test_wrist_singularity_keeps_seed() {
        let config = dynamixel_arm();
        let original = JointAngles::new([0.5, 0.8, -0.7, 0.3, 0.0, 0.2]);
        let pose = Pose::from_measured(&original, &config);

        let seeded = inverse_kinematics_near(&pose, &config, &original).unwrap();
        assert_angles_close(&seeded, &original);

        let unseeded = inverse_kinematics(&pose, &config).unwrap();
        assert!(unseeded[4].abs() < TOLERANCE);
        assert!((unseeded[6] - 0.5).abs() < TOLERANCE);
        assert_same_pose(&seeded, &unseeded, &config);
    }

    #[test]
    fn test_base_singularity_keeps_seed() {
        let config = dynamixel_arm();
        // Tool pointing straight up above the base: wrist centre on the base axis
        let pose = Pose::new(0.0, 0.0, 30.0);
        let mut seed = JointAngles::zero();
        seed[1] = 1.0;

        let angles = inverse_kinematics_near(&pose, &config, &seed).unwrap();
        assert!((angles[1] - 1.0).abs() < TOLERANCE);
        let p6 = forward_position_kinematics(&angles, &config).p6;
        assert!((p6 - Point3::new(0.0, 0.0, 30.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(-PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(0.5 - 2.0 * PI) - 0.5).abs() < 1e-12);
    }
}
