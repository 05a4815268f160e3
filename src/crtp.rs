//! # CRTP packet
//!
//! CRTP packets are the unit of communication with the Crazyflie firmware. Each packet is
//! addressed to a port (subsystem) and a channel within that port.

use std::fmt::Debug;

// Header byte layout:
// [port(4 bits) | link bits(2 bits) | channel(2 bits)]
//
// The link bits are used by safelink; this client does not enable safelink and always sets
// them to 0b11.
const LINK_BITS: u8 = 0b11 << 2;

/// Largest CRTP payload, excluding the header byte
pub const MAX_PAYLOAD: usize = 30;

/// Parameter port
pub const PORT_PARAM: u8 = 2;
/// Legacy RPYT commander port
pub const PORT_COMMANDER: u8 = 3;
/// Log port
pub const PORT_LOG: u8 = 5;
/// Localization port, used to push external position
pub const PORT_LOCALIZATION: u8 = 6;
/// Generic setpoint commander port
pub const PORT_COMMANDER_GENERIC: u8 = 7;
/// Link control port; carries the null packet used for polling
pub const PORT_LINK: u8 = 15;

/// Null packet, used to poll the downlink when there is nothing to send
pub const NULL_PACKET: [u8; 1] = [0xff];

/// CRTP packet
#[derive(Clone, PartialEq)]
pub struct Packet {
    port: u8,
    channel: u8,
    data: Vec<u8>,
}

impl Packet {
    /// Create a new packet
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is longer than [`MAX_PAYLOAD`]
    pub fn new(port: u8, channel: u8, data: Vec<u8>) -> anyhow::Result<Self> {
        if data.len() > MAX_PAYLOAD {
            return Err(anyhow::anyhow!(
                "CRTP payload too large: {} bytes (max {})",
                data.len(),
                MAX_PAYLOAD
            ));
        }
        Ok(Packet { port: port & 0x0f, channel: channel & 0x03, data })
    }

    /// Decode a packet from the raw bytes received over the radio
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let (header, data) = bytes
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Cannot decode empty CRTP packet"))?;

        Packet::new(header >> 4, header & 0x03, data.to_vec())
    }

    /// Encode the packet, header byte first
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 1);
        bytes.push((self.port << 4) | LINK_BITS | self.channel);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Port number
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Channel number
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this packet belongs to the link control port and should not reach subsystems
    pub fn is_link_control(&self) -> bool {
        self.port == PORT_LINK
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("port", &self.port)
            .field("channel", &self.channel)
            .field("data", &format_args!("{:02X?}", self.data))
            .finish()
    }
}

/// Append little-endian `f32` values to a payload
pub(crate) fn push_f32s(payload: &mut Vec<u8>, values: &[f32]) {
    for value in values {
        payload.extend_from_slice(&value.to_le_bytes());
    }
}
