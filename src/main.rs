use std::process::ExitCode;

use clap::Parser;

use cfmocap::config::{Cli, Command, GlobalArgs};
use cfmocap::crazyflie::Crazyflie;
use cfmocap::flight::{self, FlightOptions};
use cfmocap::mission::Mission;
use cfmocap::operator;
use cfmocap::qtm::{QtmConnection, QtmStreams};

const DRONE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let global = &cli.global;
    match &cli.command {
        Command::Bodies => {
            let (qtm, _streams) = connect_qtm(global).await?;
            let params = qtm.get_parameters().await?;
            println!("{} 6DOF bodies defined in QTM:", params.bodies.len());
            for line in params.body_listing() {
                println!("\t{}", line);
            }
            qtm.disconnect().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check(args) => {
            let (qtm, streams) = connect_qtm(global).await?;
            let report =
                flight::check(&qtm, streams, &global.drone_body, &args.watched_bodies(), DRONE_TIMEOUT).await?;
            qtm.disconnect().await?;
            report.log();
            Ok(if report.passed() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Hover(args) => fly(global, Box::new(args.mission())).await,
        Command::Follow(args) => fly(global, Box::new(args.mission())).await,
        Command::Track(args) => fly(global, Box::new(args.mission()?)).await,
    }
}

async fn connect_qtm(global: &GlobalArgs) -> anyhow::Result<(QtmConnection, QtmStreams)> {
    Ok(QtmConnection::connect(&global.qtm_host, global.qtm_port, &global.qtm_version).await?)
}

async fn fly(global: &GlobalArgs, mission: Box<dyn Mission>) -> anyhow::Result<ExitCode> {
    let options: FlightOptions = global.flight_options(mission.as_ref());

    // Crazyflie first: no point streaming from QTM if the drone is not there
    let crazyflie = Crazyflie::connect(&global.uri).await?;
    let (qtm, streams) = match connect_qtm(global).await {
        Ok(connection) => connection,
        Err(e) => {
            crazyflie.disconnect().await;
            return Err(e);
        }
    };

    if mission.name() == "track" {
        println!("Keys, then enter: a/d x-/x+  s/w y-/y+  z/x z-/z+  1-9 controller  q quit");
    } else {
        println!("Type q then enter to stop");
    }
    let reason = flight::fly(crazyflie, qtm, streams, mission, &options, operator::spawn_stdin()).await?;

    Ok(if reason.is_failure() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
