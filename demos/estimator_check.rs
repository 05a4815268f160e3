use anyhow::Result;
use cfmocap::estimator::{self, EstimatorConfig};
use cfmocap::{Crazyflie, LinkUri};
use std::env;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("Usage: {} [uri] [timeout_s]", args[0]);
        println!("  uri: Crazyflie link URI (default: radio://0/80/2M/E7E7E7E7E7)");
        println!("  timeout_s: Seconds to wait for the estimator (default: 30)");
        println!("QTM must be streaming the drone pose to the Crazyflie for the estimator to converge.");
        return Ok(());
    }

    let uri: LinkUri = args.get(1).map(String::as_str).unwrap_or("radio://0/80/2M/E7E7E7E7E7").parse()?;
    let timeout = match args.get(2) {
        Some(t) => Duration::from_secs(t.parse().map_err(|_| anyhow::anyhow!("Invalid timeout: '{}'", t))?),
        None => Duration::from_secs(30),
    };

    let crazyflie = Crazyflie::connect(&uri).await?;

    println!("Resetting Kalman estimator...");
    let config = EstimatorConfig { timeout, ..Default::default() };
    let start = Instant::now();
    let result = async {
        estimator::reset(&crazyflie, config.settle).await?;
        estimator::wait_for_position(&crazyflie, &config).await
    }
    .await;

    crazyflie.disconnect().await;
    match result {
        Ok(()) => println!("Estimator converged in {:.1}s", start.elapsed().as_secs_f32()),
        Err(e) => println!("Estimator check failed after {:.1}s: {}", start.elapsed().as_secs_f32(), e),
    }
    Ok(())
}
