//! # Parameter subsystem
//!
//! Parameters are set by name using the "set by name" command of the misc channel. This avoids
//! downloading the whole parameter table of content, at the price of having to know the type of
//! the parameter.

use std::fmt::Display;
use std::time::Duration;

use crate::crtp::{PORT_PARAM, Packet};
use crate::radiolink::RadioLink;

const MISC_CHANNEL: u8 = 3;
const CMD_SET_BY_NAME: u8 = 0x00;

const PARAM_TIMEOUT: Duration = Duration::from_millis(200);

/// Typed parameter value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    /// `uint8_t`
    U8(u8),
    /// `uint16_t`
    U16(u16),
    /// `uint32_t`
    U32(u32),
    /// `int8_t`
    I8(i8),
    /// `int16_t`
    I16(i16),
    /// `int32_t`
    I32(i32),
    /// `float`
    F32(f32),
}

impl ParamValue {
    /// Type code used on the wire
    pub fn type_code(&self) -> u8 {
        match self {
            ParamValue::I8(_) => 0x00,
            ParamValue::I16(_) => 0x01,
            ParamValue::I32(_) => 0x02,
            ParamValue::F32(_) => 0x06,
            ParamValue::U8(_) => 0x08,
            ParamValue::U16(_) => 0x09,
            ParamValue::U32(_) => 0x0A,
        }
    }

    /// Little-endian encoding of the value
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ParamValue::U8(v) => v.to_le_bytes().to_vec(),
            ParamValue::U16(v) => v.to_le_bytes().to_vec(),
            ParamValue::U32(v) => v.to_le_bytes().to_vec(),
            ParamValue::I8(v) => v.to_le_bytes().to_vec(),
            ParamValue::I16(v) => v.to_le_bytes().to_vec(),
            ParamValue::I32(v) => v.to_le_bytes().to_vec(),
            ParamValue::F32(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl From<u8> for ParamValue {
    fn from(value: u8) -> Self {
        ParamValue::U8(value)
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        ParamValue::F32(value)
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ParamValue::U8(v) => write!(f, "{}", v),
            ParamValue::U16(v) => write!(f, "{}", v),
            ParamValue::U32(v) => write!(f, "{}", v),
            ParamValue::I8(v) => write!(f, "{}", v),
            ParamValue::I16(v) => write!(f, "{}", v),
            ParamValue::I32(v) => write!(f, "{}", v),
            ParamValue::F32(v) => write!(f, "{}", v),
        }
    }
}

/// Parameter subsystem
pub struct Param {
    link: RadioLink,
}

impl Param {
    pub(crate) fn new(link: RadioLink) -> Self {
        Param { link }
    }

    /// Set a parameter value
    ///
    /// # Arguments
    ///
    /// * `name` - Full parameter name, `group.name`
    /// * `value` - Value, its type must match the parameter type in the firmware
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed, if the Crazyflie does not answer or if it
    /// reports an error (unknown parameter, read-only parameter or type mismatch)
    pub async fn set(&self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        let value = value.into();
        let (group, param) = name
            .split_once('.')
            .filter(|(group, param)| !group.is_empty() && !param.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Invalid parameter name '{}', expected group.name", name))?;

        let mut payload = vec![CMD_SET_BY_NAME];
        payload.extend_from_slice(group.as_bytes());
        payload.push(0);
        payload.extend_from_slice(param.as_bytes());
        payload.push(0);
        let match_length = payload.len();
        payload.push(value.type_code());
        payload.extend_from_slice(&value.to_le_bytes());

        let request = Packet::new(PORT_PARAM, MISC_CHANNEL, payload)?;
        let response = self.link.request(request, match_length, PARAM_TIMEOUT).await
            .map_err(|e| anyhow::anyhow!("Setting parameter {} failed: {}", name, e))?;

        match response.data().get(match_length) {
            None | Some(0) => {
                log::debug!("Parameter {} set to {}", name, value);
                Ok(())
            }
            Some(code) => Err(anyhow::anyhow!(
                "Setting parameter {} to {} failed with error code {}",
                name,
                value,
                code
            )),
        }
    }
}
