//! Low-level setpoints
//!
//! Setpoints set the instant target state and must be sent continuously: when no setpoint is
//! received for 1 second the Crazyflie levels out, and after 2 seconds it falls back to a lower
//! priority setpoint, which in most cases cuts the motors.

use crate::crtp::{self, PORT_COMMANDER, PORT_COMMANDER_GENERIC, Packet};
use crate::radiolink::RadioLink;

const RPYT_CHANNEL: u8 = 0;

const GENERIC_SETPOINT_CHANNEL: u8 = 0;
const GENERIC_CMD_CHANNEL: u8 = 1;

// Generic setpoint types
const TYPE_STOP: u8 = 0;
const TYPE_HOVER: u8 = 5;
const TYPE_POSITION: u8 = 7;

// Generic command types
const TYPE_META_NOTIFY_SETPOINT_STOP: u8 = 0;

/// Low-level setpoint subsystem
pub struct Commander {
    link: RadioLink,
}

impl Commander {
    pub(crate) fn new(link: RadioLink) -> Self {
        Commander { link }
    }

    /// Send a legacy Roll Pitch Yawrate Thrust setpoint
    ///
    /// Roll and pitch are in degrees, yawrate in degrees per second and thrust is a 16 bit
    /// value. With the `flightmode.posSet` parameter set, the firmware instead reads roll as
    /// the Y target, pitch as the X target and thrust as the Z target in millimetres.
    ///
    /// Pitch is negated on the wire, like every other Crazyflie client does.
    ///
    /// The thrust is locked on startup; send once with thrust = 0 to unlock it.
    pub async fn send_setpoint(&self, roll: f32, pitch: f32, yawrate: f32, thrust: u16) -> anyhow::Result<()> {
        let mut payload = Vec::with_capacity(14);
        crtp::push_f32s(&mut payload, &[roll, -pitch, yawrate]);
        payload.extend_from_slice(&thrust.to_le_bytes());

        self.link.send(Packet::new(PORT_COMMANDER, RPYT_CHANNEL, payload)?).await
    }

    /// Send an absolute position setpoint
    ///
    /// # Arguments
    ///
    /// * `x`, `y`, `z` - Target position in metres
    /// * `yaw` - Target heading in degrees
    pub async fn send_position_setpoint(&self, x: f32, y: f32, z: f32, yaw: f32) -> anyhow::Result<()> {
        self.send_generic(TYPE_POSITION, &[x, y, z, yaw]).await
    }

    /// Send a hover setpoint
    ///
    /// # Arguments
    ///
    /// * `vx`, `vy` - Velocity in the body frame in m/s
    /// * `yawrate` - Rotation rate in degrees per second
    /// * `z` - Absolute height in metres
    pub async fn send_hover_setpoint(&self, vx: f32, vy: f32, yawrate: f32, z: f32) -> anyhow::Result<()> {
        self.send_generic(TYPE_HOVER, &[vx, vy, yawrate, z]).await
    }

    /// Send a stop setpoint, stopping the motors
    ///
    /// The Crazyflie will likely fall if this is sent in flight.
    pub async fn send_stop_setpoint(&self) -> anyhow::Result<()> {
        self.send_generic(TYPE_STOP, &[]).await
    }

    /// Notify the firmware that low-level setpoints have stopped
    ///
    /// Lets a lower priority commander, for example the high-level commander, take over after
    /// `remain_valid_ms` milliseconds.
    pub async fn send_notify_setpoint_stop(&self, remain_valid_ms: u32) -> anyhow::Result<()> {
        let mut payload = vec![TYPE_META_NOTIFY_SETPOINT_STOP];
        payload.extend_from_slice(&remain_valid_ms.to_le_bytes());

        self.link.send(Packet::new(PORT_COMMANDER_GENERIC, GENERIC_CMD_CHANNEL, payload)?).await
    }

    async fn send_generic(&self, setpoint_type: u8, values: &[f32]) -> anyhow::Result<()> {
        let mut payload = vec![setpoint_type];
        crtp::push_f32s(&mut payload, values);

        self.link.send(Packet::new(PORT_COMMANDER_GENERIC, GENERIC_SETPOINT_CHANNEL, payload)?).await
    }
}
