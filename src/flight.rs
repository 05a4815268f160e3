//! # Flight session
//!
//! Runs a [`Mission`] from start to end:
//!
//! 1. read the QTM parameters and run the preflight checks
//! 2. optionally take control of QTM and start a new capture
//! 3. stream frames and forward the drone pose to the Crazyflie
//! 4. check the initial heading
//! 5. configure and reset the estimator, wait for it to converge
//! 6. send the mission setpoints every 100 ms until the mission ends
//! 7. land or stop, then shut down
//!
//! The shutdown always runs in the same order, whatever ended the flight: the final stop
//! setpoint is transmitted before QTM stops streaming, then QTM is disconnected and finally
//! the radio link is closed. The Crazyflie never keeps flying on a position that is no longer
//! updated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::crazyflie::Crazyflie;
use crate::estimator::{self, EstimatorConfig};
use crate::mission::{EndReason, Landing, Mission, MissionAction};
use crate::operator::OperatorCommand;
use crate::pose::TargetPose;
use crate::preflight::{self, PreflightReport, Severity};
use crate::qtm::{Component, QtmConnection, QtmEvent, QtmStreams};
use crate::safety::TrackingMonitor;
use crate::tracking::{PoseForwarder, PoseMode, Tracking, WatchedBody};

/// Setpoint period. The Crazyflie needs at least two setpoints per second.
pub const CONTROL_PERIOD: Duration = Duration::from_millis(100);

const LANDING_HEIGHTS: [f32; 5] = [0.5, 0.4, 0.3, 0.2, 0.1];
const LANDING_STEP: Duration = Duration::from_millis(150);

const DRONE_TIMEOUT: Duration = Duration::from_secs(5);
const FORWARDER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const STREAMED_COMPONENTS: [Component; 2] = [Component::SixD, Component::SixDEuler];

/// Settings of a flight
#[derive(Debug, Clone)]
pub struct FlightOptions {
    /// Name of the drone rigid body in QTM
    pub drone_body: String,
    /// Take control of QTM before anything else
    pub take_control: bool,
    /// Password for taking control
    pub password: Option<String>,
    /// Start a new QTM capture
    pub record: bool,
    /// Use legacy RPYT setpoints with `flightmode.posSet`
    pub legacy_posset: bool,
    /// How the drone pose is sent
    pub pose_mode: PoseMode,
    /// Do not run the preflight checks
    pub skip_preflight: bool,
    /// Estimator convergence settings
    pub estimator: EstimatorConfig,
    /// Setpoint period
    pub control_period: Duration,
    /// Delay between landing setpoints
    pub landing_step: Duration,
    /// How long to wait for QTM to track the drone
    pub drone_timeout: Duration,
}

impl FlightOptions {
    /// Default settings for a mission
    pub fn for_mission(mission: &dyn Mission) -> Self {
        FlightOptions {
            drone_body: "Crazyflie".to_string(),
            take_control: false,
            password: None,
            record: mission.records_capture(),
            legacy_posset: false,
            pose_mode: mission.pose_mode(),
            skip_preflight: false,
            estimator: EstimatorConfig::default(),
            control_period: CONTROL_PERIOD,
            landing_step: LANDING_STEP,
            drone_timeout: DRONE_TIMEOUT,
        }
    }
}

/// Logs status messages, only when they change
#[derive(Debug, Default)]
pub struct StatusReporter {
    last: Option<String>,
}

impl StatusReporter {
    /// Log a status, returns whether it was new
    pub fn report(&mut self, message: String) -> bool {
        if self.last.as_ref() == Some(&message) {
            return false;
        }
        log::info!("{}", message);
        self.last = Some(message);
        true
    }
}

/// Fly a mission
///
/// Takes ownership of both connections: they are closed when the function returns.
///
/// # Returns
///
/// Why the flight ended. Errors are returned for failures outside of the mission's control
/// (radio link lost, QTM refusing a command, failed preflight checks).
pub async fn fly(
    crazyflie: Crazyflie,
    qtm: QtmConnection,
    streams: QtmStreams,
    mut mission: Box<dyn Mission>,
    options: &FlightOptions,
    mut operator: mpsc::Receiver<OperatorCommand>,
) -> anyhow::Result<EndReason> {
    log::info!("Starting {} mission", mission.name());

    let crazyflie = Arc::new(crazyflie);
    let QtmStreams { frames, mut events } = streams;
    let mut forwarder = None;

    let result = run(
        &crazyflie,
        &qtm,
        frames,
        &mut events,
        mission.as_mut(),
        options,
        &mut operator,
        &mut forwarder,
    )
    .await;

    shutdown(&crazyflie, qtm, forwarder).await;

    match &result {
        Ok(reason) if reason.is_failure() => log::error!("Flight ended: {}", reason),
        Ok(reason) => log::info!("Flight ended: {}", reason),
        Err(e) => log::error!("Flight aborted: {:#}", e),
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run(
    crazyflie: &Arc<Crazyflie>,
    qtm: &QtmConnection,
    frames: mpsc::Receiver<crate::qtm::Frame>,
    events: &mut mpsc::Receiver<QtmEvent>,
    mission: &mut dyn Mission,
    options: &FlightOptions,
    operator: &mut mpsc::Receiver<OperatorCommand>,
    forwarder_task: &mut Option<JoinHandle<anyhow::Result<()>>>,
) -> anyhow::Result<EndReason> {
    let params = qtm.get_parameters().await?;
    let watched = mission.watched_bodies();

    if !options.skip_preflight {
        let report = PreflightReport { checks: preflight::check_parameters(&params, &options.drone_body, &watched) };
        report.log();
        report.into_result()?;
    }

    if options.take_control {
        qtm.take_control(options.password.as_deref()).await?;
    }
    if options.record {
        qtm.new_measurement().await?;
        qtm.start_capture().await?;
        log::info!("QTM capture started");
    }

    let (forwarder, mut tracking) = PoseForwarder::new(&params, &options.drone_body, &watched, options.pose_mode)?;
    *forwarder_task = Some(tokio::spawn(forwarder.run(frames, crazyflie.clone())));
    qtm.stream_frames(&STREAMED_COMPONENTS).await?;

    let drone = preflight::wait_for_drone(&mut tracking, options.drone_timeout).await?;
    log::info!("Drone found at {}", drone);
    if !options.skip_preflight {
        let heading = preflight::check_heading(&drone);
        let report = PreflightReport { checks: vec![heading] };
        report.log();
        report.into_result()?;
    }

    if options.pose_mode == PoseMode::FullPose {
        estimator::setup_full_pose(crazyflie).await?;
    }
    for (name, value) in mission.parameters() {
        crazyflie.param.set(name, value).await?;
    }
    if options.legacy_posset {
        crazyflie.param.set("flightmode.posSet", 1u8).await?;
    }
    log::info!("Resetting position estimator...");
    estimator::reset(crazyflie, options.estimator.settle).await?;
    estimator::wait_for_position(crazyflie, &options.estimator).await?;

    let loop_state = ControlLoop {
        crazyflie: crazyflie.as_ref(),
        tracking: &tracking,
        monitor: TrackingMonitor::new(mission.loss_threshold(), frame_period(params.frequency)),
        options,
    };
    let reason = match forwarder_task {
        Some(task) => loop_state.run(mission, events, operator, task).await?,
        None => return Err(anyhow::anyhow!("Pose forwarder not running")),
    };

    let landing = match reason {
        EndReason::TrackingLost => mission.on_tracking_lost(),
        _ => mission.landing(),
    };
    match landing {
        Landing::Land => land(crazyflie, options.landing_step).await?,
        Landing::Stop => stop(crazyflie).await?,
    }

    Ok(reason)
}

struct ControlLoop<'a> {
    crazyflie: &'a Crazyflie,
    tracking: &'a watch::Receiver<Tracking>,
    monitor: TrackingMonitor,
    options: &'a FlightOptions,
}

impl ControlLoop<'_> {
    async fn run(
        &self,
        mission: &mut dyn Mission,
        events: &mut mpsc::Receiver<QtmEvent>,
        operator: &mut mpsc::Receiver<OperatorCommand>,
        forwarder: &JoinHandle<anyhow::Result<()>>,
    ) -> anyhow::Result<EndReason> {
        let mut ticker = tokio::time::interval(self.options.control_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = StatusReporter::default();

        log::info!("Flying");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(reason) = self.tick(mission, &mut status, forwarder).await? {
                        return Ok(reason);
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        log::info!("QTM event: {}", event);
                        if let MissionAction::End(reason) = mission.on_event(event) {
                            return Ok(reason);
                        }
                    }
                    None => return Ok(EndReason::QtmDisconnected),
                },
                Some(command) = operator.recv() => {
                    if let MissionAction::End(reason) = mission.on_operator(command) {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    async fn tick(
        &self,
        mission: &mut dyn Mission,
        status: &mut StatusReporter,
        forwarder: &JoinHandle<anyhow::Result<()>>,
    ) -> anyhow::Result<Option<EndReason>> {
        if self.crazyflie.is_disconnected() {
            return Err(anyhow::anyhow!("Radio link lost"));
        }
        if forwarder.is_finished() {
            return Ok(Some(EndReason::QtmDisconnected));
        }

        let snapshot = self.tracking.borrow().clone();

        if self.monitor.is_lost(snapshot.lost_frames) {
            log::error!("Tracking lost for {} frames", snapshot.lost_frames);
            return Ok(Some(EndReason::TrackingLost));
        }
        let frame_age = snapshot.last_frame.map(|t| t.elapsed());
        if self.monitor.is_stale(frame_age) {
            log::error!("No frame from QTM for more than {:?}", self.monitor.stale_after());
            return Ok(Some(EndReason::TrackingLost));
        }
        if let (Some(zone), Some(drone)) = (mission.safe_zone(), snapshot.drone) {
            if !zone.contains_with_margin(&drone) {
                log::error!("Drone has left the safe zone at {}", drone);
                return Ok(Some(EndReason::LeftSafeZone));
            }
        }

        let target = mission.target(&snapshot);
        self.send_target(&target).await?;
        status.report(mission.status(&snapshot));
        Ok(None)
    }

    async fn send_target(&self, target: &TargetPose) -> anyhow::Result<()> {
        let commander = &self.crazyflie.commander;
        if self.options.legacy_posset {
            let (roll, pitch, yaw, thrust) = target.to_legacy_setpoint();
            commander.send_setpoint(roll, pitch, yaw, thrust).await
        } else {
            commander.send_position_setpoint(target.x, target.y, target.z, target.yaw).await
        }
    }
}

// Time between frames at the reported capture rate
fn frame_period(frequency: Option<u32>) -> Duration {
    let rate = frequency.unwrap_or(preflight::CAPTURE_RATE).max(1);
    Duration::from_secs(1) / rate
}

/// Descend from 0.5 m to 0.1 m in hover mode, then stop
pub async fn land(crazyflie: &Crazyflie, step: Duration) -> anyhow::Result<()> {
    log::info!("Landing...");
    for z in LANDING_HEIGHTS {
        crazyflie.commander.send_hover_setpoint(0.0, 0.0, 0.0, z).await?;
        tokio::time::sleep(step).await;
    }
    stop(crazyflie).await
}

/// Cut the motors and hand control back to the high level commander
///
/// Returns once the packets have been transmitted.
pub async fn stop(crazyflie: &Crazyflie) -> anyhow::Result<()> {
    crazyflie.commander.send_stop_setpoint().await?;
    crazyflie.commander.send_notify_setpoint_stop(0).await?;
    crazyflie.flush().await
}

async fn shutdown(crazyflie: &Crazyflie, qtm: QtmConnection, forwarder: Option<JoinHandle<anyhow::Result<()>>>) {
    // Setpoints first: the drone must not fly on a position that stops updating
    if let Err(e) = stop(crazyflie).await {
        log::warn!("Cannot send stop setpoint: {:#}", e);
    }

    if let Err(e) = qtm.stream_frames_stop().await {
        log::warn!("Cannot stop QTM stream: {}", e);
    }
    if let Err(e) = qtm.disconnect().await {
        log::warn!("Error disconnecting from QTM: {}", e);
    }

    if let Some(mut task) = forwarder {
        match tokio::time::timeout(FORWARDER_SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::warn!("Pose forwarding stopped: {:#}", e),
            Ok(Err(e)) => log::warn!("Pose forwarder failed: {}", e),
            Err(_) => task.abort(),
        }
    }

    crazyflie.disconnect().await;
    log::info!("Disconnected from Crazyflie");
}

/// Run the preflight checks without flying
///
/// Streams frames until the drone is seen to check its heading, then stops streaming.
pub async fn check(
    qtm: &QtmConnection,
    streams: QtmStreams,
    drone: &str,
    watched: &[WatchedBody],
    timeout: Duration,
) -> anyhow::Result<PreflightReport> {
    let params = qtm.get_parameters().await?;
    let mut report = PreflightReport { checks: preflight::check_parameters(&params, drone, watched) };
    if report.checks.iter().any(|c| c.severity == Severity::Error) {
        return Ok(report);
    }

    let (mut forwarder, _tracking) = PoseForwarder::new(&params, drone, watched, PoseMode::Position)?;
    let mut frames = streams.frames;
    qtm.stream_frames(&STREAMED_COMPONENTS).await?;

    let first_pose = tokio::time::timeout(timeout, async {
        while let Some(frame) = frames.recv().await {
            if let Some(pose) = forwarder.process(&frame) {
                return Some(pose);
            }
        }
        None
    })
    .await;
    qtm.stream_frames_stop().await?;

    match first_pose {
        Ok(Some(pose)) => {
            log::info!("Drone at {}", pose);
            report.push(preflight::check_heading(&pose));
        }
        Ok(None) => return Err(anyhow::anyhow!("QTM frame stream ended before the drone was seen")),
        Err(_) => report.push(preflight::CheckResult {
            name: "tracking",
            severity: Severity::Error,
            message: format!("{} not tracked after {:?}", drone, timeout),
        }),
    }

    Ok(report)
}
