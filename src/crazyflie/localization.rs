// External position input of the Crazyflie

use crate::crtp::{self, PORT_LOCALIZATION, Packet};
use crate::radiolink::RadioLink;

const POSITION_CHANNEL: u8 = 0;
const GENERIC_CHANNEL: u8 = 1;

const TYPE_EXT_POSE: u8 = 8;

/// External positioning subsystem
///
/// Measurements pushed here are fused by the Kalman estimator. They should be sent at the rate
/// of the positioning system, typically 100 Hz for a motion capture system.
pub struct Localization {
    link: RadioLink,
}

impl Localization {
    pub(crate) fn new(link: RadioLink) -> Self {
        Localization { link }
    }

    /// Send an externally measured position, in metres
    pub async fn send_extpos(&self, x: f32, y: f32, z: f32) -> anyhow::Result<()> {
        let mut payload = Vec::with_capacity(12);
        crtp::push_f32s(&mut payload, &[x, y, z]);

        self.link.send(Packet::new(PORT_LOCALIZATION, POSITION_CHANNEL, payload)?).await
    }

    /// Send an externally measured pose: position in metres and attitude as a unit quaternion
    #[allow(clippy::too_many_arguments)]
    pub async fn send_extpose(&self, x: f32, y: f32, z: f32, qx: f32, qy: f32, qz: f32, qw: f32) -> anyhow::Result<()> {
        let mut payload = vec![TYPE_EXT_POSE];
        crtp::push_f32s(&mut payload, &[x, y, z, qx, qy, qz, qw]);

        self.link.send(Packet::new(PORT_LOCALIZATION, GENERIC_CHANNEL, payload)?).await
    }
}
