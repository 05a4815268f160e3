//! # Missions
//!
//! A mission chooses where the drone goes. The control loop asks it for a target every tick and
//! forwards QTM events and operator commands to it; the mission answers whether the flight goes
//! on.
//!
//! - [`Hover`] holds a static position, QTM triggers toggle between home and away
//! - [`Follow`] follows a rigid body at an offset, QTM triggers toggle between home and follow
//! - [`Track`] follows one of several controller bodies inside a safe zone, steered from the
//!   keyboard

use std::fmt::Display;

use crate::crazyflie::ParamValue;
use crate::operator::OperatorCommand;
use crate::pose::{Offset, TargetPose};
use crate::qtm::QtmEvent;
use crate::safety::SafeZone;
use crate::tracking::{PoseMode, Tracking, WatchedBody};

/// How the flight is ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    /// Cut the motors right away
    Stop,
    /// Descend slowly before stopping
    Land,
}

/// Why the flight ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The operator asked to quit
    OperatorQuit,
    /// QTM sent an event ending the mission
    QtmEvent(QtmEvent),
    /// QTM connection closed
    QtmDisconnected,
    /// Too many frames lost
    TrackingLost,
    /// The drone flew out of the safe zone
    LeftSafeZone,
}

impl EndReason {
    /// Whether the flight ended on a safety failure
    pub fn is_failure(&self) -> bool {
        matches!(self, EndReason::TrackingLost | EndReason::LeftSafeZone | EndReason::QtmDisconnected)
    }
}

impl Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EndReason::OperatorQuit => write!(f, "operator quit"),
            EndReason::QtmEvent(event) => write!(f, "QTM event {}", event),
            EndReason::QtmDisconnected => write!(f, "QTM disconnected"),
            EndReason::TrackingLost => write!(f, "tracking lost"),
            EndReason::LeftSafeZone => write!(f, "drone left the safe zone"),
        }
    }
}

/// Answer of a mission to an event or command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionAction {
    /// Keep flying
    Continue,
    /// End the flight
    End(EndReason),
}

/// Target selection of a flight
pub trait Mission: Send {
    /// Short name, for logs
    fn name(&self) -> &str;

    /// Bodies the mission needs besides the drone
    fn watched_bodies(&self) -> Vec<WatchedBody>;

    /// Parameters to set on the Crazyflie before flying
    fn parameters(&self) -> Vec<(&'static str, ParamValue)> {
        Vec::new()
    }

    /// Whether a new QTM capture is started by default
    fn records_capture(&self) -> bool;

    /// How the drone pose is sent by default
    fn pose_mode(&self) -> PoseMode;

    /// Consecutive lost frames tolerated
    fn loss_threshold(&self) -> u32;

    /// Zone the drone must stay in, if any
    fn safe_zone(&self) -> Option<SafeZone> {
        None
    }

    /// React to a QTM event
    fn on_event(&mut self, event: QtmEvent) -> MissionAction;

    /// React to an operator command
    fn on_operator(&mut self, command: OperatorCommand) -> MissionAction {
        match command {
            OperatorCommand::Quit => MissionAction::End(EndReason::OperatorQuit),
            _ => MissionAction::Continue,
        }
    }

    /// Where the drone should be now
    fn target(&self, tracking: &Tracking) -> TargetPose;

    /// One line description of what the mission is doing
    fn status(&self, tracking: &Tracking) -> String;

    /// How to end the flight when tracking is lost
    fn on_tracking_lost(&self) -> Landing;

    /// How to end the flight for any other reason
    fn landing(&self) -> Landing;
}

/// Hover at a static position
#[derive(Debug, Clone)]
pub struct Hover {
    home: TargetPose,
    away: TargetPose,
    fly_away: bool,
    loss_threshold: u32,
}

impl Hover {
    /// Default home position
    pub const HOME: TargetPose = TargetPose::new(0.0, 0.0, 0.3, 0.0);
    /// Default away position
    pub const AWAY: TargetPose = TargetPose::new(0.1, 0.1, 0.5, 0.0);
    /// Default lost frame threshold
    pub const LOSS_THRESHOLD: u32 = 3;

    /// Hover at `home`, triggers toggle to `away` and back
    pub fn new(home: TargetPose, away: TargetPose, loss_threshold: u32) -> Self {
        Hover { home, away, fly_away: false, loss_threshold }
    }
}

impl Default for Hover {
    fn default() -> Self {
        Hover::new(Hover::HOME, Hover::AWAY, Hover::LOSS_THRESHOLD)
    }
}

impl Mission for Hover {
    fn name(&self) -> &str {
        "hover"
    }

    fn watched_bodies(&self) -> Vec<WatchedBody> {
        Vec::new()
    }

    fn records_capture(&self) -> bool {
        true
    }

    fn pose_mode(&self) -> PoseMode {
        PoseMode::Position
    }

    fn loss_threshold(&self) -> u32 {
        self.loss_threshold
    }

    fn on_event(&mut self, event: QtmEvent) -> MissionAction {
        match event {
            QtmEvent::Trigger => {
                self.fly_away = !self.fly_away;
                log::info!("Trigger event received, toggling position");
                MissionAction::Continue
            }
            QtmEvent::CaptureStopped | QtmEvent::CameraSettingsChanged => MissionAction::End(EndReason::QtmEvent(event)),
            _ => MissionAction::Continue,
        }
    }

    fn target(&self, _tracking: &Tracking) -> TargetPose {
        if self.fly_away { self.away } else { self.home }
    }

    fn status(&self, tracking: &Tracking) -> String {
        format!("Setting position {}", self.target(tracking))
    }

    fn on_tracking_lost(&self) -> Landing {
        Landing::Stop
    }

    fn landing(&self) -> Landing {
        Landing::Stop
    }
}

/// Follow a rigid body
#[derive(Debug, Clone)]
pub struct Follow {
    body: String,
    home: TargetPose,
    offset: Offset,
    follow: bool,
    loss_threshold: u32,
}

impl Follow {
    /// Default followed body
    pub const TARGET: &'static str = "Tiara";
    /// Default home position
    pub const HOME: TargetPose = TargetPose::new(0.0, 0.0, 0.5, 0.0);
    /// Default offset from the followed body
    pub const OFFSET: Offset = Offset::new(1.0, 1.0, 0.1);
    /// Default lost frame threshold
    pub const LOSS_THRESHOLD: u32 = 6;

    /// Wait at `home`, triggers toggle between following `body` at `offset` and home
    pub fn new(body: &str, home: TargetPose, offset: Offset, loss_threshold: u32) -> Self {
        Follow { body: body.to_string(), home, offset, follow: false, loss_threshold }
    }
}

impl Default for Follow {
    fn default() -> Self {
        Follow::new(Follow::TARGET, Follow::HOME, Follow::OFFSET, Follow::LOSS_THRESHOLD)
    }
}

impl Mission for Follow {
    fn name(&self) -> &str {
        "follow"
    }

    fn watched_bodies(&self) -> Vec<WatchedBody> {
        vec![WatchedBody::required(&self.body)]
    }

    fn records_capture(&self) -> bool {
        true
    }

    fn pose_mode(&self) -> PoseMode {
        PoseMode::Position
    }

    fn loss_threshold(&self) -> u32 {
        self.loss_threshold
    }

    fn on_event(&mut self, event: QtmEvent) -> MissionAction {
        match event {
            QtmEvent::Trigger => {
                self.follow = !self.follow;
                log::info!("Trigger event received, {}", if self.follow { "following" } else { "going home" });
                MissionAction::Continue
            }
            QtmEvent::CaptureStopped | QtmEvent::ConnectionClosed | QtmEvent::QtmShuttingDown => {
                MissionAction::End(EndReason::QtmEvent(event))
            }
            _ => MissionAction::Continue,
        }
    }

    fn target(&self, tracking: &Tracking) -> TargetPose {
        match tracking.body(&self.body) {
            Some(pose) if self.follow => TargetPose::offset_from(pose, &self.offset),
            _ => self.home,
        }
    }

    fn status(&self, tracking: &Tracking) -> String {
        match tracking.body(&self.body) {
            Some(_) if self.follow => format!("Following {} with offset ({})", self.body, self.offset),
            None if self.follow => format!("Waiting for {} at home {}", self.body, self.home),
            _ => format!("Going home to {}", self.home),
        }
    }

    fn on_tracking_lost(&self) -> Landing {
        Landing::Stop
    }

    fn landing(&self) -> Landing {
        Landing::Stop
    }
}

/// Follow one of several controller bodies inside a safe zone
#[derive(Debug, Clone)]
pub struct Track {
    controllers: Vec<String>,
    selected: usize,
    offset: Offset,
    zone: SafeZone,
    max_velocity: f32,
    loss_threshold: u32,
}

impl Track {
    /// Default controller body
    pub const CONTROLLER: &'static str = "car";
    /// Default offset from the controller
    pub const OFFSET: Offset = Offset::new(0.0, 0.0, 0.5);
    /// Default maximum velocity, m/s
    pub const MAX_VELOCITY: f32 = 2.0;
    /// Default lost frame threshold
    pub const LOSS_THRESHOLD: u32 = 200;

    /// Follow the first of `controllers`
    ///
    /// # Errors
    ///
    /// Returns an error if no controller is given
    pub fn new(
        controllers: Vec<String>,
        offset: Offset,
        zone: SafeZone,
        max_velocity: f32,
        loss_threshold: u32,
    ) -> anyhow::Result<Self> {
        if controllers.is_empty() {
            return Err(anyhow::anyhow!("At least one controller body is required"));
        }
        if max_velocity <= 0.0 {
            return Err(anyhow::anyhow!("Invalid maximum velocity {}", max_velocity));
        }
        Ok(Track { controllers, selected: 0, offset, zone, max_velocity, loss_threshold })
    }

    /// Name of the controller being followed
    pub fn selected(&self) -> &str {
        &self.controllers[self.selected]
    }

    /// Current offset from the controller
    pub fn offset(&self) -> Offset {
        self.offset
    }
}

impl Mission for Track {
    fn name(&self) -> &str {
        "track"
    }

    fn watched_bodies(&self) -> Vec<WatchedBody> {
        self.controllers.iter().map(|name| WatchedBody::optional(name)).collect()
    }

    fn parameters(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("posCtlPid.xyVelMax", self.max_velocity.into()),
            ("posCtlPid.zVelMax", self.max_velocity.into()),
        ]
    }

    fn records_capture(&self) -> bool {
        false
    }

    fn pose_mode(&self) -> PoseMode {
        PoseMode::FullPose
    }

    fn loss_threshold(&self) -> u32 {
        self.loss_threshold
    }

    fn safe_zone(&self) -> Option<SafeZone> {
        Some(self.zone)
    }

    fn on_event(&mut self, event: QtmEvent) -> MissionAction {
        match event {
            QtmEvent::CaptureStopped | QtmEvent::ConnectionClosed | QtmEvent::QtmShuttingDown => {
                MissionAction::End(EndReason::QtmEvent(event))
            }
            _ => MissionAction::Continue,
        }
    }

    fn on_operator(&mut self, command: OperatorCommand) -> MissionAction {
        match command {
            OperatorCommand::Nudge { dx, dy, dz } => {
                self.offset = Offset::new(self.offset.x + dx, self.offset.y + dy, self.offset.z + dz);
                log::info!("Offset {}", self.offset);
            }
            OperatorCommand::SelectController(index) => match self.controllers.get(index) {
                Some(name) => {
                    self.selected = index;
                    log::info!("Following controller {}", name);
                }
                None => log::warn!("No controller #{}, {} defined", index + 1, self.controllers.len()),
            },
            OperatorCommand::Quit => return MissionAction::End(EndReason::OperatorQuit),
        }
        MissionAction::Continue
    }

    fn target(&self, tracking: &Tracking) -> TargetPose {
        let target = match (tracking.body(self.selected()), tracking.drone) {
            (Some(controller), _) => TargetPose::offset_from(controller, &self.offset),
            // Controller never seen, hold position
            (None, Some(drone)) => TargetPose::new(drone.x, drone.y, drone.z, 0.0),
            (None, None) => TargetPose::new(0.0, 0.0, self.offset.z, 0.0),
        };
        self.zone.clamp(target)
    }

    fn status(&self, tracking: &Tracking) -> String {
        match tracking.body(self.selected()) {
            Some(_) => format!("Following {}, offset {}", self.selected(), self.offset),
            None => format!("Waiting for {}", self.selected()),
        }
    }

    fn on_tracking_lost(&self) -> Landing {
        Landing::Land
    }

    fn landing(&self) -> Landing {
        Landing::Land
    }
}
