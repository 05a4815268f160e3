//! # Poses and targets
//!
//! Poses come from QTM in millimetres; everything in this crate is in metres and degrees.
//!
//! QTM must be configured with the Euler convention used by the Crazyflie: first rotation
//! around Z (yaw), second around Y (pitch), third around X (roll).

use std::fmt::Display;
use std::str::FromStr;

use crate::qtm::{SixDof, SixDofEuler};

/// Rotation matrix, row-major
pub type RotationMatrix = [[f32; 3]; 3];

/// Pose of a rigid body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// X position, metres
    pub x: f32,
    /// Y position, metres
    pub y: f32,
    /// Z position, metres
    pub z: f32,
    /// Roll, degrees
    pub roll: f32,
    /// Pitch, degrees
    pub pitch: f32,
    /// Yaw, degrees
    pub yaw: f32,
    /// Rotation matrix, when built from a 6D component
    pub rotation: Option<RotationMatrix>,
}

impl Pose {
    /// Pose at a position, with no attitude
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Pose { x, y, z, roll: 0.0, pitch: 0.0, yaw: 0.0, rotation: None }
    }

    /// Build a pose from a QTM 6D body
    ///
    /// QTM sends the rotation matrix column by column, it is transposed to row-major here.
    pub fn from_six_d(body: &SixDof) -> Self {
        let r = &body.rotation;
        let rotation = [
            [r[0], r[3], r[6]],
            [r[1], r[4], r[7]],
            [r[2], r[5], r[8]],
        ];
        let (roll, pitch, yaw) = euler_from_rotation(&rotation);

        Pose {
            x: body.position[0] / 1000.0,
            y: body.position[1] / 1000.0,
            z: body.position[2] / 1000.0,
            roll,
            pitch,
            yaw,
            rotation: Some(rotation),
        }
    }

    /// Build a pose from a QTM 6D Euler body
    pub fn from_six_d_euler(body: &SixDofEuler) -> Self {
        Pose {
            x: body.position[0] / 1000.0,
            y: body.position[1] / 1000.0,
            z: body.position[2] / 1000.0,
            roll: body.angles[2],
            pitch: body.angles[1],
            yaw: body.angles[0],
            rotation: None,
        }
    }

    /// A pose is valid when its position is known
    ///
    /// QTM reports NaN coordinates for a body it lost track of. Such a pose must never be sent
    /// to the Crazyflie.
    pub fn is_valid(&self) -> bool {
        !(self.x.is_nan() || self.y.is_nan() || self.z.is_nan())
    }

    /// Euclidean distance to another pose
    pub fn distance_to(&self, other: &Pose) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    /// Attitude as a unit quaternion `[qx, qy, qz, qw]`, when a rotation matrix is known
    pub fn quaternion(&self) -> Option<[f32; 4]> {
        self.rotation.as_ref().map(quaternion_from_rotation)
    }
}

impl Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "x: {:6.2} y: {:6.2} z: {:6.2} Roll: {:6.2} Pitch: {:6.2} Yaw: {:6.2}",
            self.x, self.y, self.z, self.roll, self.pitch, self.yaw
        )
    }
}

/// Convert a rotation matrix to a unit quaternion `[qx, qy, qz, qw]`
///
/// Shepperd's method: the component with the largest magnitude is computed from the diagonal,
/// the others from the off-diagonal sums and differences, so the result stays accurate for
/// rotations close to 180 degrees. The returned quaternion has `qw >= 0`.
pub fn quaternion_from_rotation(rot: &RotationMatrix) -> [f32; 4] {
    let trace = rot[0][0] + rot[1][1] + rot[2][2];

    let [qx, qy, qz, qw] = if trace > 0.0 {
        let s = (1.0 + trace).sqrt() * 2.0;
        [(rot[2][1] - rot[1][2]) / s, (rot[0][2] - rot[2][0]) / s, (rot[1][0] - rot[0][1]) / s, s / 4.0]
    } else if rot[0][0] > rot[1][1] && rot[0][0] > rot[2][2] {
        let s = (1.0 + rot[0][0] - rot[1][1] - rot[2][2]).sqrt() * 2.0;
        [s / 4.0, (rot[0][1] + rot[1][0]) / s, (rot[0][2] + rot[2][0]) / s, (rot[2][1] - rot[1][2]) / s]
    } else if rot[1][1] > rot[2][2] {
        let s = (1.0 + rot[1][1] - rot[0][0] - rot[2][2]).sqrt() * 2.0;
        [(rot[0][1] + rot[1][0]) / s, s / 4.0, (rot[1][2] + rot[2][1]) / s, (rot[0][2] - rot[2][0]) / s]
    } else {
        let s = (1.0 + rot[2][2] - rot[0][0] - rot[1][1]).sqrt() * 2.0;
        [(rot[0][2] + rot[2][0]) / s, (rot[1][2] + rot[2][1]) / s, s / 4.0, (rot[1][0] - rot[0][1]) / s]
    };

    let norm = (qx * qx + qy * qy + qz * qz + qw * qw).sqrt();
    let sign = if qw < 0.0 { -1.0 } else { 1.0 };
    [sign * qx / norm, sign * qy / norm, sign * qz / norm, sign * qw / norm]
}

// ZYX decomposition, returns (roll, pitch, yaw) in degrees
fn euler_from_rotation(rot: &RotationMatrix) -> (f32, f32, f32) {
    let pitch = (-rot[2][0]).clamp(-1.0, 1.0).asin();
    let roll = rot[2][1].atan2(rot[2][2]);
    let yaw = rot[1][0].atan2(rot[0][0]);
    (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
}

/// Target position and heading: (X, Y, Z, Yaw) in metres and degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPose {
    /// X, metres
    pub x: f32,
    /// Y, metres
    pub y: f32,
    /// Z, metres
    pub z: f32,
    /// Yaw, degrees
    pub yaw: f32,
}

impl TargetPose {
    /// Create a target
    pub const fn new(x: f32, y: f32, z: f32, yaw: f32) -> Self {
        TargetPose { x, y, z, yaw }
    }

    /// Target at a pose shifted by an offset, heading forward
    pub fn offset_from(pose: &Pose, offset: &Offset) -> Self {
        TargetPose::new(pose.x + offset.x, pose.y + offset.y, pose.z + offset.z, 0.0)
    }

    /// Convert to the legacy position setpoint `(roll, pitch, yaw, thrust)`
    ///
    /// In `flightmode.posSet` mode the firmware reads roll as Y, pitch as X and thrust as Z in
    /// millimetres.
    pub fn to_legacy_setpoint(&self) -> (f32, f32, f32, u16) {
        let thrust = (self.z * 1000.0).clamp(0.0, u16::MAX as f32) as u16;
        (self.y, self.x, self.yaw, thrust)
    }
}

impl Display for TargetPose {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2}, {:.1})", self.x, self.y, self.z, self.yaw)
    }
}

impl FromStr for TargetPose {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = parse_floats(s)?;
        match values.as_slice() {
            [x, y, z, yaw] => Ok(TargetPose::new(*x, *y, *z, *yaw)),
            [x, y, z] => Ok(TargetPose::new(*x, *y, *z, 0.0)),
            _ => Err(anyhow::anyhow!("Expected x,y,z[,yaw], got '{}'", s)),
        }
    }
}

/// Offset from a tracked body, metres
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offset {
    /// X, metres
    pub x: f32,
    /// Y, metres
    pub y: f32,
    /// Z, metres
    pub z: f32,
}

impl Offset {
    /// Create an offset
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Offset { x, y, z }
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "X: {:5.2}  Y: {:5.2}  Z: {:5.2}", self.x, self.y, self.z)
    }
}

impl FromStr for Offset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_floats(s)?.as_slice() {
            [x, y, z] => Ok(Offset::new(*x, *y, *z)),
            _ => Err(anyhow::anyhow!("Expected x,y,z, got '{}'", s)),
        }
    }
}

pub(crate) fn parse_floats(s: &str) -> anyhow::Result<Vec<f32>> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|e| anyhow::anyhow!("Invalid number '{}' in '{}': {}", v.trim(), s, e))
        })
        .collect()
}
