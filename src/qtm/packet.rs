//! # QTM RT packet codec
//!
//! Every packet starts with an 8 byte header: the packet size in bytes, header included, and the
//! packet type, both as little-endian `u32`.

use std::fmt::Display;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{QtmError, Result};

/// Size of the packet header
pub const HEADER_SIZE: usize = 8;

// Refuse anything bigger, a corrupted size would otherwise allocate gigabytes
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

// Component types
const COMPONENT_6D: u32 = 5;
const COMPONENT_6D_EULER: u32 = 6;

// Position and rotation matrix, or position and angles, as f32
const SIX_D_BODY_SIZE: usize = 12 * 4;
const SIX_D_EULER_BODY_SIZE: usize = 6 * 4;

/// Packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Error message from the server
    Error,
    /// Command, or command response
    Command,
    /// XML parameters
    Xml,
    /// Frame data
    Data,
    /// No more frame data
    NoMoreData,
    /// C3D file
    C3dFile,
    /// Event
    Event,
    /// Discovery
    Discover,
    /// QTM file
    QtmFile,
}

impl TryFrom<u32> for PacketType {
    type Error = QtmError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Error),
            1 => Ok(PacketType::Command),
            2 => Ok(PacketType::Xml),
            3 => Ok(PacketType::Data),
            4 => Ok(PacketType::NoMoreData),
            5 => Ok(PacketType::C3dFile),
            6 => Ok(PacketType::Event),
            7 => Ok(PacketType::Discover),
            8 => Ok(PacketType::QtmFile),
            other => Err(QtmError::Malformed(format!("unknown packet type {}", other))),
        }
    }
}

impl From<PacketType> for u32 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Error => 0,
            PacketType::Command => 1,
            PacketType::Xml => 2,
            PacketType::Data => 3,
            PacketType::NoMoreData => 4,
            PacketType::C3dFile => 5,
            PacketType::Event => 6,
            PacketType::Discover => 7,
            PacketType::QtmFile => 8,
        }
    }
}

/// Raw packet: type and body
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    /// Type of the packet
    pub packet_type: PacketType,
    /// Body, header excluded
    pub body: Vec<u8>,
}

impl RawPacket {
    /// Body interpreted as a null-terminated string
    pub fn text(&self) -> String {
        let end = self.body.iter().position(|b| *b == 0).unwrap_or(self.body.len());
        String::from_utf8_lossy(&self.body[..end]).trim().to_string()
    }
}

/// Encode a command packet
pub fn encode_command(command: &str) -> Vec<u8> {
    let size = HEADER_SIZE + command.len() + 1;
    let mut bytes = Vec::with_capacity(size);
    bytes.extend_from_slice(&(size as u32).to_le_bytes());
    bytes.extend_from_slice(&u32::from(PacketType::Command).to_le_bytes());
    bytes.extend_from_slice(command.as_bytes());
    bytes.push(0);
    bytes
}

/// Read one packet from a stream
///
/// Returns `None` when the stream is closed between two packets.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RawPacket>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let packet_type = PacketType::try_from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]))?;

    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(QtmError::Malformed(format!("invalid packet size {}", size)));
    }

    let mut body = vec![0u8; size - HEADER_SIZE];
    reader.read_exact(&mut body).await?;

    Ok(Some(RawPacket { packet_type, body }))
}

/// QTM event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QtmEvent {
    /// A client connected
    Connected,
    /// Connection closed
    ConnectionClosed,
    /// Capture started
    CaptureStarted,
    /// Capture stopped
    CaptureStopped,
    /// Capture fetching finished
    CaptureFetchingFinished,
    /// Calibration started
    CalibrationStarted,
    /// Calibration stopped
    CalibrationStopped,
    /// Real-time from file started
    RtFromFileStarted,
    /// Real-time from file stopped
    RtFromFileStopped,
    /// Waiting for trigger
    WaitingForTrigger,
    /// Camera settings changed
    CameraSettingsChanged,
    /// QTM is shutting down
    QtmShuttingDown,
    /// Capture saved
    CaptureSaved,
    /// Reprocessing started
    ReprocessingStarted,
    /// Reprocessing stopped
    ReprocessingStopped,
    /// Trigger, for example the operator pressing the event button while recording
    Trigger,
}

impl TryFrom<u8> for QtmEvent {
    type Error = QtmError;

    fn try_from(value: u8) -> Result<Self> {
        let event = match value {
            1 => QtmEvent::Connected,
            2 => QtmEvent::ConnectionClosed,
            3 => QtmEvent::CaptureStarted,
            4 => QtmEvent::CaptureStopped,
            5 => QtmEvent::CaptureFetchingFinished,
            6 => QtmEvent::CalibrationStarted,
            7 => QtmEvent::CalibrationStopped,
            8 => QtmEvent::RtFromFileStarted,
            9 => QtmEvent::RtFromFileStopped,
            10 => QtmEvent::WaitingForTrigger,
            11 => QtmEvent::CameraSettingsChanged,
            12 => QtmEvent::QtmShuttingDown,
            13 => QtmEvent::CaptureSaved,
            14 => QtmEvent::ReprocessingStarted,
            15 => QtmEvent::ReprocessingStopped,
            16 => QtmEvent::Trigger,
            other => return Err(QtmError::Malformed(format!("unknown event {}", other))),
        };
        Ok(event)
    }
}

impl Display for QtmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decode an event packet body
pub fn parse_event(body: &[u8]) -> Result<QtmEvent> {
    let code = body.first().ok_or_else(|| QtmError::Malformed("empty event packet".to_string()))?;
    QtmEvent::try_from(*code)
}

/// Rigid body of a 6D component
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SixDof {
    /// Position, millimetres
    pub position: [f32; 3],
    /// Rotation matrix, column by column
    pub rotation: [f32; 9],
}

/// Rigid body of a 6D Euler component
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SixDofEuler {
    /// Position, millimetres
    pub position: [f32; 3],
    /// Euler angles in the order configured in QTM, degrees
    pub angles: [f32; 3],
}

/// Components of a frame that the client can stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// 6DOF bodies with rotation matrix
    SixD,
    /// 6DOF bodies with Euler angles
    SixDEuler,
}

impl Component {
    /// Name in the StreamFrames command
    pub fn command_name(&self) -> &'static str {
        match self {
            Component::SixD => "6D",
            Component::SixDEuler => "6DEuler",
        }
    }
}

/// One streamed frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Capture timestamp, microseconds
    pub timestamp: u64,
    /// Frame number
    pub frame_number: u32,
    /// 6D component, if streamed
    pub six_d: Option<Vec<SixDof>>,
    /// 6D Euler component, if streamed
    pub six_d_euler: Option<Vec<SixDofEuler>>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset + n > self.data.len() {
            return Err(QtmError::Malformed(format!(
                "data packet truncated: need {} bytes at offset {}, have {}",
                n,
                self.offset,
                self.data.len()
            )));
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn f32s<const N: usize>(&mut self) -> Result<[f32; N]> {
        let mut values = [0f32; N];
        for value in values.iter_mut() {
            *value = f32::from_bits(self.u32()?);
        }
        Ok(values)
    }
}

/// Decode a data packet body
///
/// Components other than 6D and 6D Euler are skipped.
pub fn parse_frame(body: &[u8]) -> Result<Frame> {
    let mut cursor = Cursor::new(body);
    let timestamp = cursor.u64()?;
    let frame_number = cursor.u32()?;
    let component_count = cursor.u32()?;

    let mut frame = Frame { timestamp, frame_number, ..Default::default() };

    for _ in 0..component_count {
        let component_size = cursor.u32()? as usize;
        let component_type = cursor.u32()?;
        if component_size < 8 {
            return Err(QtmError::Malformed(format!("invalid component size {}", component_size)));
        }
        let mut component = Cursor::new(cursor.take(component_size - 8)?);

        match component_type {
            COMPONENT_6D => {
                let count = body_count(&mut component, SIX_D_BODY_SIZE)?;
                let mut bodies = Vec::with_capacity(count);
                for _ in 0..count {
                    bodies.push(SixDof { position: component.f32s()?, rotation: component.f32s()? });
                }
                frame.six_d = Some(bodies);
            }
            COMPONENT_6D_EULER => {
                let count = body_count(&mut component, SIX_D_EULER_BODY_SIZE)?;
                let mut bodies = Vec::with_capacity(count);
                for _ in 0..count {
                    bodies.push(SixDofEuler { position: component.f32s()?, angles: component.f32s()? });
                }
                frame.six_d_euler = Some(bodies);
            }
            _ => {}
        }
    }

    Ok(frame)
}

// Body count, then 2D drop rate and out of sync rate which are not used.
// The count must fit in what is left of the component.
fn body_count(component: &mut Cursor, body_size: usize) -> Result<usize> {
    let count = component.u32()? as usize;
    let _drop_rate = component.u16()?;
    let _out_of_sync_rate = component.u16()?;
    if count > component.remaining() / body_size {
        return Err(QtmError::Malformed(format!(
            "{} bodies announced, component holds {} bytes",
            count,
            component.remaining()
        )));
    }
    Ok(count)
}
