// Test doubles: a fake Crazyflie behind a fake radio, and a mock QTM RT server

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crazyradio::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::crazyflie::Crazyflie;
use crate::crtp::{PORT_LOG, PORT_PARAM, Packet};
use crate::radiolink::Transport;

/// Ordered record of what the fakes received, shared between fakes
pub type Journal = Arc<Mutex<Vec<String>>>;

struct Firmware {
    silent: bool,
    downlink: VecDeque<Vec<u8>>,
    param_errors: HashMap<String, u8>,
    toc: Vec<(&'static str, u8)>,
    log_values: HashMap<String, f32>,
    blocks: HashMap<u8, Vec<u16>>,
    running: Option<(u8, Duration, Option<Instant>)>,
    timestamp: u32,
    journal: Option<Journal>,
}

/// Simulates the few Crazyflie firmware replies the crate relies on
#[derive(Clone)]
pub struct FakeRadio {
    firmware: Arc<Mutex<Firmware>>,
    sent: Arc<Mutex<Vec<Packet>>>,
}

impl FakeRadio {
    pub fn new() -> Self {
        let firmware = Firmware {
            silent: false,
            downlink: VecDeque::new(),
            param_errors: HashMap::new(),
            toc: vec![
                ("stabilizer.roll", 7),
                ("stabilizer.pitch", 7),
                ("kalman.varPX", 7),
                ("kalman.varPY", 7),
                ("kalman.varPZ", 7),
            ],
            log_values: HashMap::new(),
            blocks: HashMap::new(),
            running: None,
            timestamp: 0,
            journal: None,
        };
        FakeRadio { firmware: Arc::new(Mutex::new(firmware)), sent: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn silent() -> Self {
        let radio = FakeRadio::new();
        radio.control().go_silent();
        radio
    }

    pub fn with_journal(journal: Journal) -> Self {
        let radio = FakeRadio::new();
        radio.firmware.lock().unwrap().journal = Some(journal);
        radio
    }

    pub fn control(&self) -> FakeRadio {
        self.clone()
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<Packet>>> {
        self.sent.clone()
    }

    pub fn go_silent(&self) {
        self.firmware.lock().unwrap().silent = true;
    }

    pub fn fail_param(&self, name: &str, code: u8) {
        self.firmware.lock().unwrap().param_errors.insert(name.to_string(), code);
    }

    pub fn set_log_value(&self, name: &str, value: f32) {
        self.firmware.lock().unwrap().log_values.insert(name.to_string(), value);
    }

    /// (port, channel, payload) of every packet sent, link control excluded
    pub fn payloads(sent: &Arc<Mutex<Vec<Packet>>>) -> Vec<(u8, u8, Vec<u8>)> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_link_control())
            .map(|p| (p.port(), p.channel(), p.data().to_vec()))
            .collect()
    }

    fn handle(&self, payload: &[u8]) -> (bool, Vec<u8>) {
        let mut firmware = self.firmware.lock().unwrap();
        if firmware.silent {
            return (false, Vec::new());
        }

        let packet = Packet::from_bytes(payload).unwrap();
        if !packet.is_link_control() {
            if let Some(journal) = &firmware.journal {
                let first = packet.data().first().copied().unwrap_or(0xff);
                journal.lock().unwrap().push(format!("crtp {}:{}:{}", packet.port(), packet.channel(), first));
            }
            self.sent.lock().unwrap().push(packet.clone());
            firmware.reply(&packet);
        }

        if firmware.downlink.is_empty() {
            firmware.emit_log_data();
        }

        (true, firmware.downlink.pop_front().unwrap_or_default())
    }
}

impl Firmware {
    fn queue(&mut self, port: u8, channel: u8, data: Vec<u8>) {
        self.downlink.push_back(Packet::new(port, channel, data).unwrap().to_bytes());
    }

    fn reply(&mut self, packet: &Packet) {
        let data = packet.data();
        match (packet.port(), packet.channel(), data.first().copied()) {
            (PORT_PARAM, 3, Some(0)) => {
                let mut parts = data[1..].splitn(3, |b| *b == 0);
                let group = String::from_utf8_lossy(parts.next().unwrap()).to_string();
                let name = String::from_utf8_lossy(parts.next().unwrap()).to_string();
                let names_len = 1 + group.len() + 1 + name.len() + 1;
                let code = self.param_errors.get(&format!("{}.{}", group, name)).copied().unwrap_or(0);

                let mut reply = data[..names_len].to_vec();
                reply.push(code);
                self.queue(PORT_PARAM, 3, reply);
            }
            (PORT_LOG, 0, Some(3)) => {
                let len = self.toc.len() as u16;
                let mut reply = vec![3];
                reply.extend_from_slice(&len.to_le_bytes());
                reply.extend_from_slice(&[0, 0, 0, 0, 30, 16]);
                self.queue(PORT_LOG, 0, reply);
            }
            (PORT_LOG, 0, Some(2)) => {
                let index = u16::from_le_bytes([data[1], data[2]]);
                let (name, var_type) = self.toc[index as usize];
                let (group, name) = name.split_once('.').unwrap();
                let mut reply = vec![2, data[1], data[2], var_type];
                reply.extend_from_slice(group.as_bytes());
                reply.push(0);
                reply.extend_from_slice(name.as_bytes());
                reply.push(0);
                self.queue(PORT_LOG, 0, reply);
            }
            (PORT_LOG, 1, Some(5)) => {
                self.blocks.clear();
                self.running = None;
                self.queue(PORT_LOG, 1, vec![5, 0, 0]);
            }
            (PORT_LOG, 1, Some(6)) => {
                let ids = data[2..].chunks(3).map(|c| u16::from_le_bytes([c[1], c[2]])).collect();
                self.blocks.insert(data[1], ids);
                self.queue(PORT_LOG, 1, vec![6, data[1], 0]);
            }
            (PORT_LOG, 1, Some(3)) => {
                let period = Duration::from_millis(data[2] as u64 * 10);
                self.running = Some((data[1], period, None));
                self.queue(PORT_LOG, 1, vec![3, data[1], 0]);
            }
            _ => {}
        }
    }

    fn emit_log_data(&mut self) {
        let Some((block_id, period, last)) = self.running else {
            return;
        };
        if last.is_some_and(|last| last.elapsed() < period) {
            return;
        }
        self.running = Some((block_id, period, Some(Instant::now())));

        self.timestamp += period.as_millis() as u32;
        let mut data = vec![block_id];
        data.extend_from_slice(&self.timestamp.to_le_bytes()[..3]);
        for id in self.blocks.get(&block_id).cloned().unwrap_or_default() {
            let name = self.toc[id as usize].0;
            let value = self.log_values.get(name).copied().unwrap_or(1.0);
            data.extend_from_slice(&value.to_le_bytes());
        }
        self.queue(PORT_LOG, 2, data);
    }
}

impl Transport for FakeRadio {
    async fn send_packet(&self, _channel: Channel, _address: [u8; 5], payload: Vec<u8>) -> anyhow::Result<(bool, Vec<u8>)> {
        let answer = self.handle(&payload);
        tokio::task::yield_now().await;
        Ok(answer)
    }
}

pub async fn connect(radio: FakeRadio) -> Crazyflie {
    Crazyflie::with_transport(radio, Channel::from_number(80).unwrap(), [0xE7; 5])
        .await
        .unwrap()
}

// Mock QTM RT server

pub const PACKET_ERROR: u32 = 0;
pub const PACKET_COMMAND: u32 = 1;
pub const PACKET_XML: u32 = 2;
pub const PACKET_DATA: u32 = 3;
pub const PACKET_EVENT: u32 = 6;

pub fn qtm_packet(packet_type: u32, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 8);
    bytes.extend_from_slice(&(body.len() as u32 + 8).to_le_bytes());
    bytes.extend_from_slice(&packet_type.to_le_bytes());
    bytes.extend_from_slice(body);
    bytes
}

pub fn qtm_string(packet_type: u32, text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    body.push(0);
    qtm_packet(packet_type, &body)
}

/// Body of a data packet with a 6D and a 6D Euler component
///
/// `bodies` are (position in mm, euler angles in degrees); rotation matrices are identity
/// rotated by the first euler angle around Z.
pub fn qtm_frame(frame_number: u32, bodies: &[([f32; 3], [f32; 3])]) -> Vec<u8> {
    let mut six_d = Vec::new();
    let mut six_d_euler = Vec::new();
    for (position, euler) in bodies {
        let yaw = euler[0].to_radians();
        let (s, c) = yaw.sin_cos();
        // Column-major, as sent by QTM
        let rotation = [c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0];
        for value in position.iter().chain(rotation.iter()) {
            six_d.extend_from_slice(&value.to_le_bytes());
        }
        for value in position.iter().chain(euler.iter()) {
            six_d_euler.extend_from_slice(&value.to_le_bytes());
        }
    }

    let mut body = Vec::new();
    body.extend_from_slice(&(frame_number as u64 * 10_000).to_le_bytes());
    body.extend_from_slice(&frame_number.to_le_bytes());
    body.extend_from_slice(&2u32.to_le_bytes());
    for (component_type, component) in [(5u32, six_d), (6u32, six_d_euler)] {
        body.extend_from_slice(&(component.len() as u32 + 16).to_le_bytes());
        body.extend_from_slice(&component_type.to_le_bytes());
        body.extend_from_slice(&(bodies.len() as u32).to_le_bytes());
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(&component);
    }
    qtm_packet(PACKET_DATA, &body)
}

pub fn qtm_parameters_xml(frequency: u32, bodies: &[&str]) -> String {
    let mut xml = format!(
        "<QTM_Parameters_Ver_1.17>\n<General>\n<Frequency>{}</Frequency>\n</General>\n<The_6D>\n<Bodies>{}</Bodies>\n",
        frequency,
        bodies.len()
    );
    xml.push_str("<Euler>\n<First>Z</First>\n<Second>Y</Second>\n<Third>X</Third>\n</Euler>\n");
    for body in bodies {
        xml.push_str(&format!("<Body>\n<Name>{}</Name>\n<RGBColor>255</RGBColor>\n</Body>\n", body));
    }
    xml.push_str("</The_6D>\n</QTM_Parameters_Ver_1.17>");
    xml
}

/// Read one command string sent by the client
pub async fn read_command(stream: &mut TcpStream) -> Option<String> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.ok()?;
    let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut body = vec![0u8; size - 8];
    stream.read_exact(&mut body).await.ok()?;
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    Some(String::from_utf8_lossy(&body[..end]).to_string())
}

/// Scripted QTM server
///
/// Answers the handshake and parameter requests, then streams `frames` once streaming is
/// requested and keeps serving commands until the client disconnects. `events` are sent right
/// after the frames. Received commands are recorded in the journal.
pub struct MockQtm {
    pub xml: String,
    pub frames: Vec<Vec<u8>>,
    pub events: Vec<u8>,
    pub frame_period: Duration,
    pub repeat_last_frame: bool,
    pub journal: Journal,
}

impl MockQtm {
    pub fn new(journal: Journal, bodies: &[&str]) -> Self {
        MockQtm {
            xml: qtm_parameters_xml(100, bodies),
            frames: Vec::new(),
            events: Vec::new(),
            frame_period: Duration::from_millis(10),
            repeat_last_frame: false,
            journal,
        }
    }

    /// Bind on localhost and serve one client, returns the port
    pub async fn serve(self) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            self.run(stream).await;
        });
        port
    }

    async fn run(self, stream: TcpStream) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        writer.lock().await.write_all(&qtm_string(PACKET_COMMAND, "QTM RT Interface connected")).await.unwrap();

        let mut streamer: Option<tokio::task::JoinHandle<()>> = None;
        let mut frames = Some(self.frames);
        let mut events = Some(self.events);

        loop {
            let mut header = [0u8; 8];
            if reader.read_exact(&mut header).await.is_err() {
                break;
            }
            let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let mut body = vec![0u8; size - 8];
            if reader.read_exact(&mut body).await.is_err() {
                break;
            }
            let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
            let command = String::from_utf8_lossy(&body[..end]).to_string();
            self.journal.lock().unwrap().push(format!("qtm {}", command));

            let reply = if let Some(version) = command.strip_prefix("Version ") {
                Some(qtm_string(PACKET_COMMAND, &format!("Version set to {}", version)))
            } else if command.starts_with("GetParameters") {
                Some(qtm_string(PACKET_XML, &self.xml))
            } else if command == "Start" {
                Some(qtm_string(PACKET_COMMAND, "Starting measurement"))
            } else if command.starts_with("TakeControl") {
                Some(qtm_string(PACKET_COMMAND, "You are now master"))
            } else if command == "New" {
                Some(qtm_string(PACKET_COMMAND, "Creating new connection"))
            } else if command == "StreamFrames Stop" {
                if let Some(handle) = streamer.take() {
                    handle.abort();
                }
                None
            } else if command.starts_with("StreamFrames") {
                let writer = writer.clone();
                let frames = frames.take().unwrap_or_default();
                let events = events.take().unwrap_or_default();
                let period = self.frame_period;
                let repeat = self.repeat_last_frame;
                streamer = Some(tokio::spawn(async move {
                    for frame in &frames {
                        if writer.lock().await.write_all(frame).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(period).await;
                    }
                    for event in events {
                        let _ = writer.lock().await.write_all(&qtm_packet(PACKET_EVENT, &[event])).await;
                        tokio::time::sleep(period).await;
                    }
                    while repeat {
                        let Some(frame) = frames.last() else { return };
                        if writer.lock().await.write_all(frame).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(period).await;
                    }
                }));
                None
            } else {
                Some(qtm_string(PACKET_ERROR, "Parse error"))
            };

            if let Some(reply) = reply {
                if writer.lock().await.write_all(&reply).await.is_err() {
                    break;
                }
            }
        }

        if let Some(handle) = streamer {
            handle.abort();
        }
    }
}
