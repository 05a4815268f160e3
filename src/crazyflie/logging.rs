//! # Log subsystem
//!
//! The firmware exposes its log variables in a table of content (TOC). Variables are grouped in
//! log blocks which, once started, are sent periodically by the Crazyflie.
//!
//! Only the TOC v2 protocol (16 bit variable ids) is supported.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::crtp::{PORT_LOG, Packet};
use crate::radiolink::RadioLink;

const TOC_CHANNEL: u8 = 0;
const SETTINGS_CHANNEL: u8 = 1;
const LOGDATA_CHANNEL: u8 = 2;

const CMD_TOC_ITEM_V2: u8 = 0x02;
const CMD_TOC_INFO_V2: u8 = 0x03;

const CMD_START_LOGGING: u8 = 0x03;
const CMD_RESET_LOGGING: u8 = 0x05;
const CMD_CREATE_BLOCK_V2: u8 = 0x06;

const LOG_TIMEOUT: Duration = Duration::from_millis(200);

/// Type of a log variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    /// `uint8_t`
    U8 = 1,
    /// `uint16_t`
    U16 = 2,
    /// `uint32_t`
    U32 = 3,
    /// `int8_t`
    I8 = 4,
    /// `int16_t`
    I16 = 5,
    /// `int32_t`
    I32 = 6,
    /// `float`
    Float = 7,
    /// Half precision float
    Fp16 = 8,
}

impl LogType {
    /// Decode a type code from the TOC
    pub fn from_code(code: u8) -> anyhow::Result<Self> {
        match code & 0x0f {
            1 => Ok(LogType::U8),
            2 => Ok(LogType::U16),
            3 => Ok(LogType::U32),
            4 => Ok(LogType::I8),
            5 => Ok(LogType::I16),
            6 => Ok(LogType::I32),
            7 => Ok(LogType::Float),
            8 => Ok(LogType::Fp16),
            other => Err(anyhow::anyhow!("Unknown log variable type {}", other)),
        }
    }

    /// Size in bytes of a value in a log data packet
    pub fn size(&self) -> usize {
        match self {
            LogType::U8 | LogType::I8 => 1,
            LogType::U16 | LogType::I16 | LogType::Fp16 => 2,
            LogType::U32 | LogType::I32 | LogType::Float => 4,
        }
    }

    fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            LogType::U8 => bytes[0] as f64,
            LogType::I8 => bytes[0] as i8 as f64,
            LogType::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            LogType::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
            LogType::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            LogType::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            LogType::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            LogType::Fp16 => fp16_to_f64(u16::from_le_bytes([bytes[0], bytes[1]])),
        }
    }
}

fn fp16_to_f64(half: u16) -> f64 {
    let sign = if half & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((half >> 10) & 0x1f) as i32;
    let mantissa = (half & 0x03ff) as f64;

    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}

/// Log variable found in the TOC
#[derive(Debug, Clone, PartialEq)]
pub struct LogVariable {
    /// Full name, `group.name`
    pub name: String,
    /// TOC id
    pub id: u16,
    /// Type
    pub var_type: LogType,
}

impl Display for LogVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (id {}, {:?})", self.name, self.id, self.var_type)
    }
}

/// One sample of a log block
#[derive(Debug, Clone)]
pub struct LogSample {
    /// Crazyflie timestamp in milliseconds
    pub timestamp: u32,
    /// Values by variable name
    pub values: HashMap<String, f64>,
}

impl LogSample {
    /// Value of a variable of the block
    pub fn get(&self, name: &str) -> anyhow::Result<f64> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Log variable {} not in sample", name))
    }
}

/// Log subsystem
pub struct Log {
    link: RadioLink,
}

impl Log {
    pub(crate) fn new(link: RadioLink) -> Self {
        Log { link }
    }

    /// Get the number of variables in the TOC
    pub async fn toc_len(&self) -> anyhow::Result<u16> {
        let request = Packet::new(PORT_LOG, TOC_CHANNEL, vec![CMD_TOC_INFO_V2])?;
        let response = self.link.request(request, 1, LOG_TIMEOUT).await?;
        let data = response.data();

        if data.len() < 3 {
            return Err(anyhow::anyhow!("Invalid TOC info response length: {}", data.len()));
        }
        Ok(u16::from_le_bytes([data[1], data[2]]))
    }

    /// Get one TOC item
    pub async fn toc_item(&self, index: u16) -> anyhow::Result<LogVariable> {
        let mut payload = vec![CMD_TOC_ITEM_V2];
        payload.extend_from_slice(&index.to_le_bytes());

        let request = Packet::new(PORT_LOG, TOC_CHANNEL, payload)?;
        let response = self.link.request(request, 3, LOG_TIMEOUT).await?;
        parse_toc_item(response.data())
    }

    /// Look up variables by name in the TOC
    ///
    /// The TOC is walked from the start until every requested variable has been found.
    ///
    /// # Errors
    ///
    /// Returns an error listing the variables that do not exist in the firmware
    pub async fn find_variables(&self, names: &[&str]) -> anyhow::Result<Vec<LogVariable>> {
        let toc_len = self.toc_len().await?;
        let mut found: HashMap<String, LogVariable> = HashMap::new();

        for index in 0..toc_len {
            if found.len() == names.len() {
                break;
            }
            let variable = self.toc_item(index).await?;
            if names.contains(&variable.name.as_str()) {
                found.insert(variable.name.clone(), variable);
            }
        }

        let missing: Vec<&str> = names.iter().copied().filter(|n| !found.contains_key(*n)).collect();
        if !missing.is_empty() {
            return Err(anyhow::anyhow!("Log variables not found in TOC: {}", missing.join(", ")));
        }

        Ok(names.iter().filter_map(|n| found.remove(*n)).collect())
    }

    /// Delete all log blocks
    pub async fn reset(&self) -> anyhow::Result<()> {
        let request = Packet::new(PORT_LOG, SETTINGS_CHANNEL, vec![CMD_RESET_LOGGING])?;
        let response = self.link.request(request, 1, LOG_TIMEOUT).await?;
        check_settings_error(response.data(), "reset log blocks")
    }

    /// Create a log block
    ///
    /// # Arguments
    ///
    /// * `block_id` - Block id, must not already exist
    /// * `variables` - Variables of the block, from [`find_variables`](Self::find_variables)
    ///
    /// # Errors
    ///
    /// Returns an error if the variables do not fit in one block or the Crazyflie refuses it
    pub async fn create_block(&self, block_id: u8, variables: &[LogVariable]) -> anyhow::Result<()> {
        let data_size: usize = variables.iter().map(|v| v.var_type.size()).sum();
        // Data packets carry the block id and a 3 byte timestamp
        if data_size > crate::crtp::MAX_PAYLOAD - 4 {
            return Err(anyhow::anyhow!("Log block too large: {} bytes of data", data_size));
        }

        let mut payload = vec![CMD_CREATE_BLOCK_V2, block_id];
        for variable in variables {
            let var_type = variable.var_type as u8;
            payload.push((var_type << 4) | var_type);
            payload.extend_from_slice(&variable.id.to_le_bytes());
        }

        let request = Packet::new(PORT_LOG, SETTINGS_CHANNEL, payload)?;
        let response = self.link.request(request, 2, LOG_TIMEOUT).await?;
        check_settings_error(response.data(), "create log block")
    }

    /// Start a log block and get its stream of samples
    ///
    /// # Arguments
    ///
    /// * `block_id` - Id of a created block
    /// * `variables` - The variables the block was created with, in the same order
    /// * `period` - Sampling period, 10 ms to 2.55 s in steps of 10 ms
    pub async fn start_block(&self, block_id: u8, variables: Vec<LogVariable>, period: Duration) -> anyhow::Result<LogStream> {
        let period_10ms = period.as_millis() / 10;
        if period_10ms == 0 || period_10ms > 255 {
            return Err(anyhow::anyhow!("Log period {:?} out of range (10ms to 2.55s)", period));
        }

        // Subscribe before starting so that no sample is lost
        let downlink = self.link.subscribe();

        let request = Packet::new(PORT_LOG, SETTINGS_CHANNEL, vec![CMD_START_LOGGING, block_id, period_10ms as u8])?;
        let response = self.link.request(request, 2, LOG_TIMEOUT).await?;
        check_settings_error(response.data(), "start log block")?;

        Ok(LogStream { block_id, variables, downlink })
    }
}

fn parse_toc_item(data: &[u8]) -> anyhow::Result<LogVariable> {
    // [cmd, id (2 bytes), type, group\0, name\0]
    if data.len() < 6 {
        return Err(anyhow::anyhow!("Invalid TOC item response length: {}", data.len()));
    }

    let id = u16::from_le_bytes([data[1], data[2]]);
    let var_type = LogType::from_code(data[3])?;

    let mut strings = data[4..].split(|b| *b == 0);
    let group = strings.next().unwrap_or_default();
    let name = strings.next().unwrap_or_default();

    Ok(LogVariable {
        name: format!("{}.{}", String::from_utf8_lossy(group), String::from_utf8_lossy(name)),
        id,
        var_type,
    })
}

fn check_settings_error(data: &[u8], action: &str) -> anyhow::Result<()> {
    match data.get(2) {
        None | Some(0) => Ok(()),
        Some(code) => Err(anyhow::anyhow!("Crazyflie refused to {}: error code {}", action, code)),
    }
}

/// Stream of samples of a started log block
pub struct LogStream {
    block_id: u8,
    variables: Vec<LogVariable>,
    downlink: broadcast::Receiver<Packet>,
}

impl LogStream {
    /// Wait for the next sample of the block
    ///
    /// # Errors
    ///
    /// Returns an error if the radio link is lost or the data packet does not match the block
    /// layout
    pub async fn next(&mut self) -> anyhow::Result<LogSample> {
        loop {
            let packet = match self.downlink.recv().await {
                Ok(packet) => packet,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("Log stream lagged, {} packets skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("Radio link closed"));
                }
            };

            if packet.port() != PORT_LOG || packet.channel() != LOGDATA_CHANNEL {
                continue;
            }
            if packet.data().first() != Some(&self.block_id) {
                continue;
            }

            return self.decode(packet.data());
        }
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<LogSample> {
        // [block id, timestamp (3 bytes), values]
        let expected: usize = 4 + self.variables.iter().map(|v| v.var_type.size()).sum::<usize>();
        if data.len() < expected {
            return Err(anyhow::anyhow!(
                "Invalid log data length for block {}: expected {}, got {}",
                self.block_id,
                expected,
                data.len()
            ));
        }

        let timestamp = u32::from_le_bytes([data[1], data[2], data[3], 0]);
        let mut values = HashMap::with_capacity(self.variables.len());
        let mut offset = 4;
        for variable in &self.variables {
            let size = variable.var_type.size();
            values.insert(variable.name.clone(), variable.var_type.decode(&data[offset..offset + size]));
            offset += size;
        }

        Ok(LogSample { timestamp, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRadio, connect};

    #[test]
    fn toc_item_is_parsed() {
        let mut data = vec![CMD_TOC_ITEM_V2, 0x2A, 0x01, 0x07];
        data.extend_from_slice(b"kalman\0varPX\0");
        let variable = parse_toc_item(&data).unwrap();
        assert_eq!(variable.name, "kalman.varPX");
        assert_eq!(variable.id, 0x012A);
        assert_eq!(variable.var_type, LogType::Float);
    }

    #[test]
    fn fp16_decoding() {
        assert_eq!(fp16_to_f64(0x3C00), 1.0);
        assert_eq!(fp16_to_f64(0xC000), -2.0);
        assert_eq!(fp16_to_f64(0x0000), 0.0);
    }

    #[tokio::test]
    async fn find_variables_reports_missing() {
        let cf = connect(FakeRadio::new()).await;

        let found = cf.log.find_variables(&["kalman.varPZ", "kalman.varPX"]).await.unwrap();
        assert_eq!(found[0].name, "kalman.varPZ");
        assert_eq!(found[1].name, "kalman.varPX");

        let error = cf.log.find_variables(&["kalman.varPX", "foo.bar"]).await.unwrap_err();
        assert!(error.to_string().contains("foo.bar"));
    }

    #[tokio::test]
    async fn started_block_streams_samples() {
        let radio = FakeRadio::new();
        radio.control().set_log_value("kalman.varPY", 0.25);
        let cf = connect(radio).await;

        let variables = cf.log.find_variables(&["kalman.varPX", "kalman.varPY"]).await.unwrap();
        cf.log.reset().await.unwrap();
        cf.log.create_block(1, &variables).await.unwrap();
        let mut stream = cf.log.start_block(1, variables, Duration::from_millis(10)).await.unwrap();

        let sample = stream.next().await.unwrap();
        assert_eq!(sample.get("kalman.varPY").unwrap(), 0.25);
        assert!(sample.get("kalman.varPZ").is_err());
    }

    #[tokio::test]
    async fn period_out_of_range_is_rejected() {
        let cf = connect(FakeRadio::new()).await;
        let variables = cf.log.find_variables(&["kalman.varPX"]).await.unwrap();
        assert!(cf.log.start_block(1, variables.clone(), Duration::from_millis(5)).await.is_err());
        assert!(cf.log.start_block(1, variables, Duration::from_secs(3)).await.is_err());
    }
}
