//! # Kalman estimator handling
//!
//! Before flying with an external positioning system the Kalman estimator has to be selected,
//! reset, and given time to converge on the position pushed by the motion capture system.
//! Convergence is detected on the position variance logged by the Crazyflie: once the variance
//! stays flat over a window of samples the estimate is stable.

use std::collections::VecDeque;
use std::time::Duration;

use crate::crazyflie::Crazyflie;

const VARIANCE_VARIABLES: [&str; 3] = ["kalman.varPX", "kalman.varPY", "kalman.varPZ"];
const VARIANCE_BLOCK_ID: u8 = 1;

// Value the window is filled with, far above any real variance
const INITIAL_VARIANCE: f64 = 1000.0;

const RESET_DELAY: Duration = Duration::from_millis(100);

/// Kalman estimator
const ESTIMATOR_KALMAN: u8 = 2;
/// Standard deviation of the attitude pushed with full poses
const EXT_QUAT_STD_DEV: f32 = 0.6;

/// Convergence detection settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// Variance logging period
    pub log_period: Duration,
    /// Number of samples the variance must stay flat for
    pub window: usize,
    /// Maximum spread of the variance over the window
    pub threshold: f64,
    /// Delay after the reset before logging starts
    pub settle: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            log_period: Duration::from_millis(500),
            window: 10,
            threshold: 0.001,
            settle: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Sliding window over the variance of the three axes
#[derive(Debug, Clone)]
pub struct VarianceWindow {
    axes: [VecDeque<f64>; 3],
    threshold: f64,
}

impl VarianceWindow {
    /// Window of `size` samples, filled with a high variance
    pub fn new(size: usize, threshold: f64) -> Self {
        let axis = VecDeque::from(vec![INITIAL_VARIANCE; size.max(1)]);
        VarianceWindow { axes: [axis.clone(), axis.clone(), axis], threshold }
    }

    /// Push one sample, the oldest one is dropped
    pub fn push(&mut self, sample: [f64; 3]) {
        for (axis, value) in self.axes.iter_mut().zip(sample) {
            axis.pop_front();
            axis.push_back(value);
        }
    }

    /// Spread (max - min) of each axis over the window
    pub fn spread(&self) -> [f64; 3] {
        self.axes.clone().map(|axis| {
            let max = axis.iter().copied().fold(f64::MIN, f64::max);
            let min = axis.iter().copied().fold(f64::MAX, f64::min);
            max - min
        })
    }

    /// Whether the variance is flat on every axis
    pub fn has_converged(&self) -> bool {
        self.spread().iter().all(|spread| *spread < self.threshold)
    }
}

/// Select the Kalman estimator and configure it for full pose input
pub async fn setup_full_pose(crazyflie: &Crazyflie) -> anyhow::Result<()> {
    crazyflie.param.set("stabilizer.estimator", ESTIMATOR_KALMAN).await?;
    crazyflie.param.set("locSrv.extQuatStdDev", EXT_QUAT_STD_DEV).await?;
    Ok(())
}

/// Reset the Kalman estimator
pub async fn reset(crazyflie: &Crazyflie, settle: Duration) -> anyhow::Result<()> {
    crazyflie.param.set("kalman.resetEstimation", 1u8).await?;
    tokio::time::sleep(RESET_DELAY).await;
    crazyflie.param.set("kalman.resetEstimation", 0u8).await?;
    tokio::time::sleep(settle).await;
    Ok(())
}

/// Wait for the position estimate to converge
///
/// # Errors
///
/// Returns an error if the variance is not logged or does not settle before the timeout
pub async fn wait_for_position(crazyflie: &Crazyflie, config: &EstimatorConfig) -> anyhow::Result<()> {
    log::info!("Waiting for estimator to find position...");

    let variables = crazyflie.log.find_variables(&VARIANCE_VARIABLES).await?;
    crazyflie.log.reset().await?;
    crazyflie.log.create_block(VARIANCE_BLOCK_ID, &variables).await?;
    let mut stream = crazyflie.log.start_block(VARIANCE_BLOCK_ID, variables, config.log_period).await?;

    let mut window = VarianceWindow::new(config.window, config.threshold);
    let converge = async {
        loop {
            let sample = stream.next().await?;
            window.push([
                sample.get(VARIANCE_VARIABLES[0])?,
                sample.get(VARIANCE_VARIABLES[1])?,
                sample.get(VARIANCE_VARIABLES[2])?,
            ]);

            let [x, y, z] = window.spread();
            log::debug!("Kalman variance | X: {:8.4}  Y: {:8.4}  Z: {:8.4}", x, y, z);
            if window.has_converged() {
                log::info!("Position found with errors (x: {:.5}, y: {:.5}, z: {:.5})", x, y, z);
                return anyhow::Ok(());
            }
        }
    };

    let result = match tokio::time::timeout(config.timeout, converge).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "Estimator did not converge within {:?}, check that QTM tracks the drone",
            config.timeout
        )),
    };

    crazyflie.log.reset().await?;
    result
}
