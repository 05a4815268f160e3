//! # Pose forwarding
//!
//! Every frame streamed by QTM is turned into poses. The drone pose is pushed to the
//! Crazyflie external position input, and the latest valid pose of every watched body is
//! published in a [`Tracking`] snapshot for the control loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::crazyflie::Crazyflie;
use crate::pose::Pose;
use crate::qtm::{Frame, QtmParameters};

/// How the drone pose is sent to the Crazyflie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseMode {
    /// Position only, the Crazyflie estimates its own attitude
    Position,
    /// Position and attitude quaternion
    FullPose,
}

/// A body whose pose is published in the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedBody {
    /// Name of the rigid body in QTM
    pub name: String,
    /// Frames where a required body is not tracked count as lost
    pub required: bool,
}

impl WatchedBody {
    /// A body that must be tracked
    pub fn required(name: &str) -> Self {
        WatchedBody { name: name.to_string(), required: true }
    }

    /// A body that may go out of sight
    pub fn optional(name: &str) -> Self {
        WatchedBody { name: name.to_string(), required: false }
    }
}

/// Latest tracking state
#[derive(Debug, Clone, Default)]
pub struct Tracking {
    /// Last frame number received
    pub frame_number: u32,
    /// Frames received since the start of streaming
    pub frames: u64,
    /// When the last frame was received
    pub last_frame: Option<Instant>,
    /// Last valid pose of the drone
    pub drone: Option<Pose>,
    /// Last valid pose of each watched body
    pub bodies: HashMap<String, Pose>,
    /// Consecutive frames where the drone or a required body was not tracked
    pub lost_frames: u32,
}

impl Tracking {
    /// Last valid pose of a watched body
    pub fn body(&self, name: &str) -> Option<&Pose> {
        self.bodies.get(name)
    }
}

/// Converts frames to poses, forwards the drone pose and publishes the snapshot
pub struct PoseForwarder {
    drone_index: usize,
    watched: Vec<(WatchedBody, usize)>,
    mode: PoseMode,
    state: Tracking,
    publisher: watch::Sender<Tracking>,
}

impl PoseForwarder {
    /// Resolve the drone and watched bodies in the QTM parameters
    ///
    /// # Errors
    ///
    /// Returns an error naming the bodies that are not defined in QTM
    pub fn new(
        params: &QtmParameters,
        drone: &str,
        watched: &[WatchedBody],
        mode: PoseMode,
    ) -> anyhow::Result<(Self, watch::Receiver<Tracking>)> {
        let mut missing = Vec::new();

        let drone_index = params.body_index(drone);
        if drone_index.is_none() {
            missing.push(drone.to_string());
        }

        let mut resolved = Vec::with_capacity(watched.len());
        for body in watched {
            match params.body_index(&body.name) {
                Some(index) => resolved.push((body.clone(), index)),
                None => missing.push(body.name.clone()),
            }
        }

        let drone_index = match drone_index {
            Some(index) if missing.is_empty() => index,
            _ => {
                return Err(anyhow::anyhow!(
                    "Rigid bodies not defined in QTM: {} (defined: {})",
                    missing.join(", "),
                    params.bodies.join(", ")
                ));
            }
        };

        let (publisher, receiver) = watch::channel(Tracking::default());
        let forwarder = PoseForwarder { drone_index, watched: resolved, mode, state: Tracking::default(), publisher };
        Ok((forwarder, receiver))
    }

    /// Update the snapshot with a frame
    ///
    /// Returns the drone pose to forward, `None` when the drone is not tracked in this frame.
    pub fn process(&mut self, frame: &Frame) -> Option<Pose> {
        self.state.frame_number = frame.frame_number;
        self.state.frames += 1;
        self.state.last_frame = Some(Instant::now());

        let poses = frame_poses(frame);
        let drone = poses.get(self.drone_index).copied().filter(Pose::is_valid);

        let mut lost = drone.is_none();
        for (body, index) in &self.watched {
            match poses.get(*index).filter(|pose| pose.is_valid()) {
                Some(pose) => {
                    self.state.bodies.insert(body.name.clone(), *pose);
                }
                None => lost |= body.required,
            }
        }

        if let Some(pose) = drone {
            self.state.drone = Some(pose);
        }
        if lost {
            self.state.lost_frames += 1;
        } else {
            self.state.lost_frames = 0;
        }

        self.publisher.send_replace(self.state.clone());
        drone
    }

    /// Process a frame and send the drone pose to the Crazyflie
    pub async fn forward(&mut self, frame: &Frame, crazyflie: &Crazyflie) -> anyhow::Result<()> {
        let Some(pose) = self.process(frame) else {
            log::debug!("Drone not tracked in frame {}", frame.frame_number);
            return Ok(());
        };

        match (self.mode, pose.quaternion()) {
            (PoseMode::FullPose, Some([qx, qy, qz, qw])) => {
                crazyflie.localization.send_extpose(pose.x, pose.y, pose.z, qx, qy, qz, qw).await
            }
            _ => crazyflie.localization.send_extpos(pose.x, pose.y, pose.z).await,
        }
    }

    /// Forward every frame until the stream ends or the radio link is lost
    pub async fn run(mut self, mut frames: mpsc::Receiver<Frame>, crazyflie: Arc<Crazyflie>) -> anyhow::Result<()> {
        while let Some(frame) = frames.recv().await {
            self.forward(&frame, &crazyflie).await?;
        }
        log::debug!("Frame stream ended after {} frames", self.state.frames);
        Ok(())
    }
}

// Poses of all bodies, from the 6D component if present, otherwise from the 6D Euler one.
// A frame without either has no bodies.
fn frame_poses(frame: &Frame) -> Vec<Pose> {
    if let Some(bodies) = &frame.six_d {
        bodies.iter().map(Pose::from_six_d).collect()
    } else if let Some(bodies) = &frame.six_d_euler {
        bodies.iter().map(Pose::from_six_d_euler).collect()
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qtm::{SixDof, SixDofEuler};
    use crate::testing::{FakeRadio, connect};

    const NAN3: [f32; 3] = [f32::NAN; 3];

    fn params(bodies: &[&str]) -> QtmParameters {
        QtmParameters { frequency: Some(100), bodies: bodies.iter().map(|b| b.to_string()).collect(), euler: None }
    }

    fn frame(number: u32, positions: &[[f32; 3]]) -> Frame {
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        Frame {
            timestamp: 0,
            frame_number: number,
            six_d: Some(positions.iter().map(|p| SixDof { position: *p, rotation: identity }).collect()),
            six_d_euler: None,
        }
    }

    #[test]
    fn unknown_bodies_are_reported() {
        let result = PoseForwarder::new(&params(&["Crazyflie"]), "cf2", &[WatchedBody::optional("car")], PoseMode::Position);
        let message = result.err().unwrap().to_string();
        assert!(message.contains("cf2"));
        assert!(message.contains("car"));
    }

    #[test]
    fn lost_frames_are_counted_and_reset() {
        let (mut forwarder, tracking) =
            PoseForwarder::new(&params(&["Crazyflie"]), "Crazyflie", &[], PoseMode::Position).unwrap();

        assert!(forwarder.process(&frame(1, &[[0.0, 0.0, 300.0]])).is_some());
        assert!(forwarder.process(&frame(2, &[NAN3])).is_none());
        assert!(forwarder.process(&frame(3, &[NAN3])).is_none());
        {
            let snapshot = tracking.borrow();
            assert_eq!(snapshot.lost_frames, 2);
            assert_eq!(snapshot.frame_number, 3);
            assert!(snapshot.last_frame.is_some());
            // Last valid pose is kept
            assert!((snapshot.drone.unwrap().z - 0.3).abs() < 1e-6);
        }

        forwarder.process(&frame(4, &[[0.0, 0.0, 400.0]]));
        assert_eq!(tracking.borrow().lost_frames, 0);
    }

    #[test]
    fn frame_without_six_dof_is_lost() {
        let (mut forwarder, tracking) =
            PoseForwarder::new(&params(&["Crazyflie"]), "Crazyflie", &[], PoseMode::Position).unwrap();
        forwarder.process(&Frame::default());
        assert_eq!(tracking.borrow().lost_frames, 1);
    }

    #[test]
    fn required_bodies_count_as_loss() {
        let watched = [WatchedBody::required("Tiara"), WatchedBody::optional("car")];
        let (mut forwarder, tracking) =
            PoseForwarder::new(&params(&["car", "Crazyflie", "Tiara"]), "Crazyflie", &watched, PoseMode::Position)
                .unwrap();

        // Optional body lost: not a loss
        let drone = forwarder.process(&frame(1, &[NAN3, [0.0, 0.0, 300.0], [1000.0, 0.0, 1500.0]]));
        assert!(drone.is_some());
        assert_eq!(tracking.borrow().lost_frames, 0);
        assert!(tracking.borrow().body("Tiara").is_some());
        assert!(tracking.borrow().body("car").is_none());

        // Required body lost: the drone pose is still forwarded but the frame counts as lost
        let drone = forwarder.process(&frame(2, &[NAN3, [0.0, 0.0, 300.0], NAN3]));
        assert!(drone.is_some());
        assert_eq!(tracking.borrow().lost_frames, 1);
    }

    #[test]
    fn euler_component_is_used_without_six_d() {
        let (mut forwarder, _tracking) =
            PoseForwarder::new(&params(&["Crazyflie"]), "Crazyflie", &[], PoseMode::Position).unwrap();
        let frame = Frame {
            frame_number: 1,
            six_d_euler: Some(vec![SixDofEuler { position: [100.0, 0.0, 0.0], angles: [5.0, 0.0, 0.0] }]),
            ..Default::default()
        };
        let pose = forwarder.process(&frame).unwrap();
        assert!((pose.x - 0.1).abs() < 1e-6);
        assert_eq!(pose.yaw, 5.0);
    }

    #[tokio::test]
    async fn only_valid_poses_reach_the_crazyflie() {
        let radio = FakeRadio::new();
        let sent = radio.sent();
        let crazyflie = Arc::new(connect(radio).await);

        let (forwarder, tracking) =
            PoseForwarder::new(&params(&["Crazyflie"]), "Crazyflie", &[], PoseMode::Position).unwrap();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let task = tokio::spawn(forwarder.run(frames_rx, crazyflie.clone()));

        frames_tx.send(frame(1, &[[1000.0, 2000.0, 500.0]])).await.unwrap();
        frames_tx.send(frame(2, &[NAN3])).await.unwrap();
        frames_tx.send(frame(3, &[[1000.0, 2000.0, 600.0]])).await.unwrap();
        drop(frames_tx);
        task.await.unwrap().unwrap();
        crazyflie.disconnect().await;

        assert_eq!(tracking.borrow().frames, 3);
        let extpos: Vec<_> = FakeRadio::payloads(&sent).into_iter().filter(|(port, ch, _)| (*port, *ch) == (6, 0)).collect();
        assert_eq!(extpos.len(), 2);
        for (_, _, data) in &extpos {
            assert_eq!(data.len(), 12);
            assert!(data.chunks(4).all(|c| !f32::from_le_bytes([c[0], c[1], c[2], c[3]]).is_nan()));
        }
    }

    #[tokio::test]
    async fn full_pose_sends_quaternion() {
        let radio = FakeRadio::new();
        let sent = radio.sent();
        let crazyflie = connect(radio).await;

        let (mut forwarder, _tracking) =
            PoseForwarder::new(&params(&["Crazyflie"]), "Crazyflie", &[], PoseMode::FullPose).unwrap();
        forwarder.forward(&frame(1, &[[0.0, 0.0, 500.0]]), &crazyflie).await.unwrap();
        crazyflie.disconnect().await;

        let payloads = FakeRadio::payloads(&sent);
        let (_, _, data) = payloads.iter().find(|(port, ch, _)| (*port, *ch) == (6, 1)).unwrap();
        assert_eq!(data[0], 8);
        assert_eq!(data.len(), 1 + 7 * 4);
        // qw of the identity rotation
        assert_eq!(data[25..29], 1.0f32.to_le_bytes());
    }
}
