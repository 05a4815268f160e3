//! # Preflight checks
//!
//! QTM and the drone have to be set up in a specific way for the Kalman estimator to converge:
//! - capture rate of 100 Hz
//! - rigid body Euler angles as Z (yaw), Y (pitch), X (roll)
//! - every rigid body used by the mission defined in the QTM project
//! - the drone facing the positive X axis of the capture volume at take off

use std::fmt::Display;
use std::time::Duration;

use tokio::sync::watch;

use crate::pose::Pose;
use crate::qtm::QtmParameters;
use crate::tracking::{Tracking, WatchedBody};

/// Expected capture rate, Hz
pub const CAPTURE_RATE: u32 = 100;

/// Maximum initial heading error, degrees
pub const HEADING_TOLERANCE: f32 = 10.0;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Check passed
    Ok,
    /// Flying is possible but may not work well
    Warning,
    /// Flying is not possible
    Error,
}

/// Result of one check
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    /// What was checked
    pub name: &'static str,
    /// Outcome
    pub severity: Severity,
    /// Details
    pub message: String,
}

impl CheckResult {
    fn new(name: &'static str, severity: Severity, message: String) -> Self {
        CheckResult { name, severity, message }
    }
}

impl Display for CheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Ok => "OK",
            Severity::Warning => "WARN",
            Severity::Error => "FAIL",
        };
        write!(f, "[{:>4}] {}: {}", tag, self.name, self.message)
    }
}

/// Results of all the checks
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    /// Individual results, in the order they ran
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Add a result
    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    /// Whether no check failed
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.severity < Severity::Error)
    }

    /// Log every result at a level matching its outcome
    pub fn log(&self) {
        for check in &self.checks {
            match check.severity {
                Severity::Ok => log::info!("{}", check),
                Severity::Warning => log::warn!("{}", check),
                Severity::Error => log::error!("{}", check),
            }
        }
    }

    /// Turn failed checks into an error
    pub fn into_result(self) -> anyhow::Result<()> {
        let failed: Vec<String> =
            self.checks.iter().filter(|c| c.severity == Severity::Error).map(|c| c.message.clone()).collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Preflight checks failed: {}", failed.join("; ")))
        }
    }
}

/// Check the QTM measurement settings and body definitions
pub fn check_parameters(params: &QtmParameters, drone: &str, watched: &[WatchedBody]) -> Vec<CheckResult> {
    let mut checks = Vec::new();

    checks.push(match params.frequency {
        Some(CAPTURE_RATE) => CheckResult::new("capture rate", Severity::Ok, format!("{} Hz", CAPTURE_RATE)),
        Some(rate) => CheckResult::new(
            "capture rate",
            Severity::Warning,
            format!("{} Hz, the position estimator is tuned for {} Hz", rate, CAPTURE_RATE),
        ),
        None => CheckResult::new("capture rate", Severity::Warning, "not reported by QTM".to_string()),
    });

    if let Some(euler) = &params.euler {
        checks.push(if euler.is_zyx() {
            CheckResult::new("euler angles", Severity::Ok, euler.to_string())
        } else {
            CheckResult::new(
                "euler angles",
                Severity::Warning,
                format!("{}, expected Z/Y/X (yaw, pitch, roll)", euler),
            )
        });
    }

    let names = std::iter::once(drone).chain(watched.iter().map(|b| b.name.as_str()));
    for name in names {
        checks.push(match params.body_index(name) {
            Some(index) => CheckResult::new("rigid body", Severity::Ok, format!("{} is body #{}", name, index)),
            None => CheckResult::new(
                "rigid body",
                Severity::Error,
                format!("{} not defined in QTM (defined: {})", name, params.bodies.join(", ")),
            ),
        });
    }

    checks
}

/// Check that the drone faces the positive X axis
pub fn check_heading(pose: &Pose) -> CheckResult {
    if pose.yaw.abs() <= HEADING_TOLERANCE {
        CheckResult::new("heading", Severity::Ok, format!("yaw {:.1} deg", pose.yaw))
    } else {
        CheckResult::new(
            "heading",
            Severity::Error,
            format!(
                "yaw {:.1} deg, the drone must face the positive X axis (within {} deg) at take off",
                pose.yaw, HEADING_TOLERANCE
            ),
        )
    }
}

/// Wait for the first valid pose of the drone
pub async fn wait_for_drone(tracking: &mut watch::Receiver<Tracking>, timeout: Duration) -> anyhow::Result<Pose> {
    let wait = tracking.wait_for(|t| t.drone.is_some());
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(snapshot)) => snapshot.drone.ok_or_else(|| anyhow::anyhow!("Drone pose vanished")),
        Ok(Err(_)) => Err(anyhow::anyhow!("QTM frame stream ended before the drone was seen")),
        Err(_) => Err(anyhow::anyhow!("Drone not tracked by QTM after {:?}", timeout)),
    }
}
