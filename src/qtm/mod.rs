//! # Qualisys Track Manager real-time client
//!
//! Minimal client of the QTM RT protocol over TCP, little-endian variant (port 22223).
//! It supports what is needed to stream rigid bodies:
//! - protocol version negotiation
//! - reading the General and 6D parameters
//! - taking control, creating a new measurement and starting the capture
//! - streaming 6D and 6D Euler components of every frame
//! - receiving QTM events
//!
//! QTM must be running with a measurement open, and the rigid bodies defined in the project.

mod connection;
pub mod packet;
mod params;

pub use connection::{QtmConnection, QtmStreams};
pub use packet::{Component, Frame, PacketType, QtmEvent, SixDof, SixDofEuler};
pub use params::{EulerConvention, QtmParameters};

/// Default QTM RT port, little-endian protocol
pub const DEFAULT_PORT: u16 = 22223;

/// Protocol version requested by default
pub const DEFAULT_VERSION: &str = "1.17";

/// Errors of the QTM RT client
#[derive(Debug, thiserror::Error)]
pub enum QtmError {
    /// Socket error
    #[error("QTM connection error: {0}")]
    Io(#[from] std::io::Error),
    /// The server answered with an error packet
    #[error("QTM error: {0}")]
    Server(String),
    /// The server answered something unexpected
    #[error("Unexpected response from QTM: {0}")]
    UnexpectedResponse(String),
    /// A packet could not be decoded
    #[error("Malformed QTM packet: {0}")]
    Malformed(String),
    /// The parameters XML could not be parsed
    #[error("Cannot parse QTM parameters: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The connection is closed
    #[error("QTM connection closed")]
    Closed,
    /// Timed out waiting for a response
    #[error("Timeout waiting for QTM response to '{0}'")]
    Timeout(String),
}

/// Result type of the QTM client
pub type Result<T> = std::result::Result<T, QtmError>;
