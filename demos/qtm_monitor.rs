use anyhow::Result;
use cfmocap::pose::Pose;
use cfmocap::qtm::{self, Component, QtmConnection};
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("127.0.0.1");
    let num_frames: u32 = match args.get(2) {
        Some(n) => n.parse().map_err(|_| anyhow::anyhow!("Invalid frame count: '{}'", n))?,
        None => 100,
    };

    let (connection, mut streams) = QtmConnection::connect(host, qtm::DEFAULT_PORT, qtm::DEFAULT_VERSION).await?;

    let params = connection.get_parameters().await?;
    println!("=== QTM {} (protocol {}) ===", host, connection.version());
    match params.frequency {
        Some(frequency) => println!("Capture rate: {} Hz", frequency),
        None => println!("Capture rate: unknown"),
    }
    if let Some(euler) = &params.euler {
        println!("Euler angles: {}", euler);
    }
    println!("{} 6DOF bodies:", params.bodies.len());
    for line in params.body_listing() {
        println!("\t{}", line);
    }

    connection.stream_frames(&[Component::SixD]).await?;

    let mut received = 0;
    while received < num_frames {
        tokio::select! {
            frame = streams.frames.recv() => {
                let Some(frame) = frame else { break };
                received += 1;
                println!("\n--- Frame {} ---", frame.frame_number);
                for (name, body) in params.bodies.iter().zip(frame.six_d.iter().flatten()) {
                    let pose = Pose::from_six_d(body);
                    if pose.is_valid() {
                        println!("{:>12}: {}", name, pose);
                    } else {
                        println!("{:>12}: not tracked", name);
                    }
                }
            }
            event = streams.events.recv() => {
                match event {
                    Some(event) => println!("Event: {}", event),
                    None => break,
                }
            }
        }
    }

    connection.stream_frames_stop().await?;
    connection.disconnect().await?;
    println!("\nReceived {} frames", received);
    Ok(())
}
