//! # Crate to fly a Crazyflie with a Qualisys motion capture system
//!
//! This crate bridges Qualisys Track Manager (QTM) and a Crazyflie 2.x quadcopter
//! over the Crazyradio. QTM tracks rigid bodies in the capture volume and streams
//! their 6DOF poses over its real-time (RT) protocol. The pose of the drone body is
//! forwarded to the Crazyflie as an external position (or full pose) measurement
//! feeding the on-board Kalman estimator, while a mission decides where the drone
//! should fly and sends position setpoints.
//!
//! # Architecture
//!
//! The system is built out of a few independent tasks:
//! - The QTM reader, which decodes RT packets into frames and events.
//! - The pose forwarder, which pushes every tracked drone pose to the Crazyflie
//!  and publishes the latest tracking state.
//! - The control loop, which runs at a fixed period, asks the mission for a target
//!  and supervises tracking loss, the safe zone and QTM events.
//! - The radio link, which owns the Crazyradio and multiplexes CRTP traffic.
//!
//! Whatever ends a flight (operator, QTM event, lost tracking, error) the drone is
//! stopped, or landed, before the QTM stream is closed and the radio released.
//!
//! Supported missions:
//! - `hover`: hover at a fixed position, QTM triggers toggle between two points
//! - `follow`: follow another rigid body at an offset
//! - `track`: follow controller bodies inside a safe zone, steered from the keyboard
//!
//! See the `cfmocap` binary and the demos in the repository for how to use this crate.

#![deny(missing_docs)]

pub mod config;
pub mod crazyflie;
pub mod crtp;
pub mod estimator;
pub mod flight;
pub mod mission;
pub mod operator;
pub mod pose;
pub mod preflight;
pub mod qtm;
pub mod radiolink;
pub mod safety;
pub mod tracking;
pub mod uri;

#[cfg(test)]
mod testing;

pub use crazyflie::Crazyflie;
pub use qtm::QtmConnection;
pub use uri::LinkUri;
