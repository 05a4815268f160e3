// QTM RT connection: a reader task routes incoming packets, commands are serialized

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::packet::{self, PacketType, RawPacket};
use super::{Component, Frame, QtmError, QtmEvent, QtmParameters, Result};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// Frames are dropped when the consumer lags more than this
const FRAME_QUEUE_LEN: usize = 16;
const EVENT_QUEUE_LEN: usize = 64;

const GREETING: &str = "QTM RT Interface connected";

/// Streams fed by the connection reader
///
/// Both end when the connection to QTM is closed.
pub struct QtmStreams {
    /// Streamed frames
    pub frames: mpsc::Receiver<Frame>,
    /// QTM events
    pub events: mpsc::Receiver<QtmEvent>,
}

/// Connection to a QTM RT server
///
/// Only one command is in flight at a time: commands take the response queue for the duration
/// of the exchange.
pub struct QtmConnection {
    writer: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::Receiver<RawPacket>>,
    reader: JoinHandle<()>,
    version: String,
}

impl QtmConnection {
    /// Connect to QTM and negotiate the protocol version
    pub async fn connect(host: &str, port: u16, version: &str) -> Result<(Self, QtmStreams)> {
        log::debug!("Connecting to QTM at {}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| QtmError::Timeout(format!("connect to {}:{}", host, port)))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (response_tx, response_rx) = mpsc::channel(8);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_LEN);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_LEN);

        let reader = tokio::spawn(run_reader(read_half, response_tx, frame_tx, event_tx));

        let connection = QtmConnection {
            writer: Mutex::new(write_half),
            responses: Mutex::new(response_rx),
            reader,
            version: version.to_string(),
        };

        let greeting = connection.next_response("connection").await?;
        if greeting.packet_type != PacketType::Command || greeting.text() != GREETING {
            return Err(QtmError::UnexpectedResponse(greeting.text()));
        }

        connection
            .command_expecting(&format!("Version {}", version), &format!("Version set to {}", version))
            .await?;
        log::info!("Connected to QTM {}:{}, protocol version {}", host, port, version);

        Ok((connection, QtmStreams { frames: frame_rx, events: event_rx }))
    }

    /// Protocol version in use
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Read the General and 6D parameters of the current measurement
    pub async fn get_parameters(&self) -> Result<QtmParameters> {
        let response = self.request("GetParameters General 6D").await?;
        if response.packet_type != PacketType::Xml {
            return Err(QtmError::UnexpectedResponse(response.text()));
        }
        QtmParameters::parse(&response.text())
    }

    /// Take control of QTM, required to create measurements and start captures
    pub async fn take_control(&self, password: Option<&str>) -> Result<()> {
        let command = match password {
            Some(password) if !password.is_empty() => format!("TakeControl {}", password),
            _ => "TakeControl".to_string(),
        };
        self.command_expecting(&command, "You are now master").await
    }

    /// Create a new measurement
    pub async fn new_measurement(&self) -> Result<()> {
        self.command_expecting("New", "Creating new connection").await
    }

    /// Start capturing
    pub async fn start_capture(&self) -> Result<()> {
        self.command_expecting("Start", "Starting measurement").await
    }

    /// Stream every frame with the given components
    pub async fn stream_frames(&self, components: &[Component]) -> Result<()> {
        let names: Vec<&str> = components.iter().map(Component::command_name).collect();
        self.send(&format!("StreamFrames AllFrames {}", names.join(" "))).await
    }

    /// Stop streaming frames
    pub async fn stream_frames_stop(&self) -> Result<()> {
        self.send("StreamFrames Stop").await
    }

    /// Close the connection
    pub async fn disconnect(self) -> Result<()> {
        let result = self.writer.lock().await.shutdown().await;
        self.reader.abort();
        log::info!("Disconnected from QTM");
        result.map_err(QtmError::from)
    }

    async fn command_expecting(&self, command: &str, expected: &str) -> Result<()> {
        let response = self.request(command).await?;
        let text = response.text();
        if response.packet_type == PacketType::Command && text == expected {
            Ok(())
        } else {
            Err(QtmError::UnexpectedResponse(format!("'{}' to '{}'", text, command)))
        }
    }

    // Send a command and wait for its response. Error packets become errors.
    async fn request(&self, command: &str) -> Result<RawPacket> {
        let mut responses = self.responses.lock().await;

        // Responses nobody waited for, usually errors to commands without response
        while let Ok(stale) = responses.try_recv() {
            log::warn!("Unsolicited QTM {:?} packet: {}", stale.packet_type, stale.text());
        }

        self.write(command).await?;

        let response = tokio::time::timeout(RESPONSE_TIMEOUT, responses.recv())
            .await
            .map_err(|_| QtmError::Timeout(command.to_string()))?
            .ok_or(QtmError::Closed)?;

        if response.packet_type == PacketType::Error {
            return Err(QtmError::Server(response.text()));
        }
        Ok(response)
    }

    async fn next_response(&self, what: &str) -> Result<RawPacket> {
        let mut responses = self.responses.lock().await;
        tokio::time::timeout(RESPONSE_TIMEOUT, responses.recv())
            .await
            .map_err(|_| QtmError::Timeout(what.to_string()))?
            .ok_or(QtmError::Closed)
    }

    // Command without response
    async fn send(&self, command: &str) -> Result<()> {
        let _responses = self.responses.lock().await;
        self.write(command).await
    }

    async fn write(&self, command: &str) -> Result<()> {
        log::debug!("QTM <- {}", command);
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet::encode_command(command)).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for QtmConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    responses: mpsc::Sender<RawPacket>,
    frames: mpsc::Sender<Frame>,
    events: mpsc::Sender<QtmEvent>,
) {
    loop {
        let packet = match packet::read_packet(&mut reader).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                log::info!("QTM closed the connection");
                break;
            }
            Err(e) => {
                log::error!("QTM connection lost: {}", e);
                break;
            }
        };

        match packet.packet_type {
            PacketType::Data => match packet::parse_frame(&packet.body) {
                Ok(frame) => {
                    if let Err(mpsc::error::TrySendError::Full(frame)) = frames.try_send(frame) {
                        log::debug!("Frame {} dropped, consumer is late", frame.frame_number);
                    }
                }
                Err(e) => log::warn!("Ignoring QTM frame: {}", e),
            },
            PacketType::Event => match packet::parse_event(&packet.body) {
                Ok(event) => {
                    log::debug!("QTM event: {}", event);
                    let _ = events.send(event).await;
                }
                Err(e) => log::warn!("Ignoring QTM event: {}", e),
            },
            PacketType::Command | PacketType::Xml | PacketType::Error => {
                log::debug!("QTM -> {:?} {}", packet.packet_type, packet.text());
                if responses.send(packet).await.is_err() {
                    break;
                }
            }
            PacketType::NoMoreData => log::debug!("QTM has no more data"),
            other => log::debug!("Ignoring QTM {:?} packet", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Journal, MockQtm, qtm_frame};

    fn journal() -> Journal {
        Journal::default()
    }

    #[tokio::test]
    async fn handshake_and_parameters() {
        let journal = journal();
        let port = MockQtm::new(journal.clone(), &["Crazyflie", "Tiara"]).serve().await;

        let (qtm, _streams) = QtmConnection::connect("127.0.0.1", port, "1.17").await.unwrap();
        assert_eq!(qtm.version(), "1.17");
        let params = qtm.get_parameters().await.unwrap();
        assert_eq!(params.bodies, vec!["Crazyflie", "Tiara"]);
        assert_eq!(params.frequency, Some(100));

        qtm.take_control(Some("secret")).await.unwrap();
        qtm.new_measurement().await.unwrap();
        qtm.start_capture().await.unwrap();
        qtm.disconnect().await.unwrap();

        let journal = journal.lock().unwrap().clone();
        assert_eq!(
            journal,
            vec![
                "qtm Version 1.17",
                "qtm GetParameters General 6D",
                "qtm TakeControl secret",
                "qtm New",
                "qtm Start",
            ]
        );
    }

    #[tokio::test]
    async fn streams_frames_then_events() {
        let journal = journal();
        let mut qtm = MockQtm::new(journal.clone(), &["Crazyflie"]);
        qtm.frames = (1..=3).map(|n| qtm_frame(n, &[([0.0, 0.0, 300.0], [0.0; 3])])).collect();
        qtm.events = vec![16, 4];
        let port = qtm.serve().await;

        let (qtm, mut streams) = QtmConnection::connect("127.0.0.1", port, "1.17").await.unwrap();
        qtm.stream_frames(&[Component::SixD, Component::SixDEuler]).await.unwrap();

        for n in 1..=3 {
            let frame = streams.frames.recv().await.unwrap();
            assert_eq!(frame.frame_number, n);
            assert_eq!(frame.six_d.unwrap()[0].position[2], 300.0);
        }
        assert_eq!(streams.events.recv().await, Some(QtmEvent::Trigger));
        assert_eq!(streams.events.recv().await, Some(QtmEvent::CaptureStopped));

        qtm.stream_frames_stop().await.unwrap();
        qtm.disconnect().await.unwrap();

        let journal = journal.lock().unwrap().clone();
        assert!(journal.contains(&"qtm StreamFrames AllFrames 6D 6DEuler".to_string()));
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let port = MockQtm::new(journal(), &["Crazyflie"]).serve().await;

        let (qtm, _streams) = QtmConnection::connect("127.0.0.1", port, "1.17").await.unwrap();
        // Unknown commands are answered with an error packet
        let result = qtm.request("Calibrate").await;
        assert!(matches!(result, Err(QtmError::Server(msg)) if msg == "Parse error"));
    }

    #[tokio::test]
    async fn connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(QtmConnection::connect("127.0.0.1", port, "1.17").await.is_err());
    }

    #[tokio::test]
    async fn streams_end_when_server_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&crate::testing::qtm_string(1, GREETING)).await.unwrap();
            let command = crate::testing::read_command(&mut stream).await.unwrap();
            assert_eq!(command, "Version 1.17");
            stream.write_all(&crate::testing::qtm_string(1, "Version set to 1.17")).await.unwrap();
        });

        let (_qtm, mut streams) = QtmConnection::connect("127.0.0.1", port, "1.17").await.unwrap();
        assert!(streams.frames.recv().await.is_none());
        assert!(streams.events.recv().await.is_none());
    }
}
