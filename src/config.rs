//! # Command line configuration

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::estimator::EstimatorConfig;
use crate::flight::FlightOptions;
use crate::mission::{Follow, Hover, Mission, Track};
use crate::pose::{Offset, TargetPose};
use crate::qtm;
use crate::safety::SafeZone;
use crate::tracking::{PoseMode, WatchedBody};
use crate::uri::LinkUri;

/// Fly a Crazyflie with position feedback from Qualisys Track Manager
#[derive(Debug, Parser)]
#[command(name = "cfmocap")]
#[command(version)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Options common to every command
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Crazyflie link URI
    #[arg(long, global = true, default_value = "radio://0/80/2M/E7E7E7E7E7")]
    pub uri: LinkUri,

    /// QTM host
    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub qtm_host: String,

    /// QTM RT port, little-endian protocol
    #[arg(long, global = true, default_value_t = qtm::DEFAULT_PORT)]
    pub qtm_port: u16,

    /// QTM RT protocol version
    #[arg(long, global = true, default_value = qtm::DEFAULT_VERSION)]
    pub qtm_version: String,

    /// Name of the drone rigid body in QTM
    #[arg(long, global = true, default_value = "Crazyflie")]
    pub drone_body: String,

    /// Take control of QTM, with an optional password
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "", value_name = "PASSWORD")]
    pub take_control: Option<String>,

    /// Do not start a new QTM capture
    #[arg(long, global = true)]
    pub no_record: bool,

    /// Send legacy setpoints using the flightmode.posSet parameter
    #[arg(long, global = true)]
    pub legacy_posset: bool,

    /// Send the drone attitude along with its position
    #[arg(long, global = true)]
    pub full_pose: bool,

    /// Fly even if the preflight checks fail
    #[arg(long, global = true)]
    pub skip_preflight: bool,

    /// Seconds to wait for the position estimator to converge
    #[arg(long, global = true, default_value_t = 30)]
    pub estimator_timeout: u64,
}

impl GlobalArgs {
    /// Flight settings for a mission, command line overrides applied
    pub fn flight_options(&self, mission: &dyn Mission) -> FlightOptions {
        let mut options = FlightOptions::for_mission(mission);
        options.drone_body = self.drone_body.clone();
        options.take_control = self.take_control.is_some();
        options.password = self.take_control.clone().filter(|p| !p.is_empty());
        options.record = options.record && !self.no_record;
        options.legacy_posset = self.legacy_posset;
        if self.full_pose {
            options.pose_mode = PoseMode::FullPose;
        }
        options.skip_preflight = self.skip_preflight;
        options.estimator = EstimatorConfig { timeout: Duration::from_secs(self.estimator_timeout), ..Default::default() };
        options
    }
}

/// Commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the preflight checks without flying
    Check(CheckArgs),
    /// List the rigid bodies defined in QTM
    Bodies,
    /// Hover at a static position, QTM triggers toggle between home and away
    Hover(HoverArgs),
    /// Follow a rigid body, QTM triggers toggle between home and follow
    Follow(FollowArgs),
    /// Follow controller bodies inside a safe zone, steered from the keyboard
    Track(TrackArgs),
}

/// Options of the check command
#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Other rigid bodies that must be defined
    #[arg(long = "body")]
    pub bodies: Vec<String>,
}

impl CheckArgs {
    /// Bodies checked besides the drone
    pub fn watched_bodies(&self) -> Vec<WatchedBody> {
        self.bodies.iter().map(|name| WatchedBody::required(name)).collect()
    }
}

/// Options of the hover command
#[derive(Debug, Args)]
pub struct HoverArgs {
    /// Home position: x,y,z[,yaw]
    #[arg(long, default_value = "0,0,0.3,0", allow_hyphen_values = true)]
    pub home: TargetPose,

    /// Away position: x,y,z[,yaw]
    #[arg(long, default_value = "0.1,0.1,0.5,0", allow_hyphen_values = true)]
    pub away: TargetPose,

    /// Lost frames tolerated before stopping
    #[arg(long, default_value_t = Hover::LOSS_THRESHOLD)]
    pub frame_loss_threshold: u32,
}

impl HoverArgs {
    /// Build the mission
    pub fn mission(&self) -> Hover {
        Hover::new(self.home, self.away, self.frame_loss_threshold)
    }
}

/// Options of the follow command
#[derive(Debug, Args)]
pub struct FollowArgs {
    /// Rigid body to follow
    #[arg(long, default_value = Follow::TARGET)]
    pub target: String,

    /// Home position: x,y,z[,yaw]
    #[arg(long, default_value = "0,0,0.5,0", allow_hyphen_values = true)]
    pub home: TargetPose,

    /// Offset from the followed body: x,y,z
    #[arg(long, default_value = "1,1,0.1", allow_hyphen_values = true)]
    pub offset: Offset,

    /// Lost frames tolerated before stopping
    #[arg(long, default_value_t = Follow::LOSS_THRESHOLD)]
    pub frame_loss_threshold: u32,
}

impl FollowArgs {
    /// Build the mission
    pub fn mission(&self) -> Follow {
        Follow::new(&self.target, self.home, self.offset, self.frame_loss_threshold)
    }
}

/// Options of the track command
#[derive(Debug, Args)]
pub struct TrackArgs {
    /// Controller rigid bodies, selected with keys 1 to 9
    #[arg(long = "controller", default_value = Track::CONTROLLER)]
    pub controllers: Vec<String>,

    /// Offset from the controller: x,y,z
    #[arg(long, default_value = "0,0,0.5", allow_hyphen_values = true)]
    pub offset: Offset,

    /// Safe zone: xmin,xmax,ymin,ymax,zmin,zmax
    #[arg(long, default_value = "-1,1,-2,1,0,1.5", allow_hyphen_values = true)]
    pub zone: SafeZone,

    /// Safe zone margin, metres
    #[arg(long, default_value_t = 0.2)]
    pub margin: f32,

    /// Maximum velocity, m/s
    #[arg(long, default_value_t = Track::MAX_VELOCITY)]
    pub max_vel: f32,

    /// Lost frames tolerated before landing
    #[arg(long, default_value_t = Track::LOSS_THRESHOLD)]
    pub frame_loss_threshold: u32,
}

impl TrackArgs {
    /// Build the mission
    pub fn mission(&self) -> anyhow::Result<Track> {
        Track::new(
            self.controllers.clone(),
            self.offset,
            self.zone.with_margin(self.margin)?,
            self.max_vel,
            self.frame_loss_threshold,
        )
    }
}
