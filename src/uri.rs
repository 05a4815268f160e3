//! # Crazyflie radio link URI
//!
//! Link URIs have the form `radio://<dongle>/<channel>/<datarate>[/<address>]`, for example
//! `radio://0/80/2M/E7E7E7E7E7`. When the address is omitted the default address is used.

use std::fmt::Display;
use std::str::FromStr;

/// Default radio address of a Crazyflie
pub const DEFAULT_ADDRESS: [u8; 5] = [0xE7, 0xE7, 0xE7, 0xE7, 0xE7];

const MAX_CHANNEL: u8 = 125;

/// Radio datarate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datarate {
    /// 250 kbit/s
    Dr250K,
    /// 1 Mbit/s
    Dr1M,
    /// 2 Mbit/s
    Dr2M,
}

impl From<Datarate> for crazyradio::Datarate {
    fn from(value: Datarate) -> Self {
        match value {
            Datarate::Dr250K => crazyradio::Datarate::Dr250K,
            Datarate::Dr1M => crazyradio::Datarate::Dr1M,
            Datarate::Dr2M => crazyradio::Datarate::Dr2M,
        }
    }
}

/// Parsed radio link URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUri {
    /// Index of the Crazyradio dongle to use
    pub dongle: usize,
    /// Radio channel, 0 to 125
    pub channel: u8,
    /// Radio datarate
    pub datarate: Datarate,
    /// 5-byte radio address
    pub address: [u8; 5],
}

impl FromStr for LinkUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("radio://")
            .ok_or_else(|| anyhow::anyhow!("Unsupported link URI '{}': expected radio://", s))?;

        let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(anyhow::anyhow!(
                "Invalid link URI '{}': expected radio://<dongle>/<channel>/<datarate>[/<address>]",
                s
            ));
        }

        let dongle = parts[0]
            .parse::<usize>()
            .map_err(|e| anyhow::anyhow!("Invalid dongle index '{}': {}", parts[0], e))?;

        let channel = parts[1]
            .parse::<u8>()
            .map_err(|e| anyhow::anyhow!("Invalid channel '{}': {}", parts[1], e))?;
        if channel > MAX_CHANNEL {
            return Err(anyhow::anyhow!("Channel {} out of range (0-{})", channel, MAX_CHANNEL));
        }

        let datarate = match parts[2].to_ascii_uppercase().as_str() {
            "250K" => Datarate::Dr250K,
            "1M" => Datarate::Dr1M,
            "2M" => Datarate::Dr2M,
            other => return Err(anyhow::anyhow!("Invalid datarate '{}'", other)),
        };

        let address = match parts.get(3) {
            Some(hex) => parse_address(hex)?,
            None => DEFAULT_ADDRESS,
        };

        Ok(LinkUri { dongle, channel, datarate, address })
    }
}

fn parse_address(hex: &str) -> anyhow::Result<[u8; 5]> {
    if hex.len() != 10 || !hex.is_ascii() {
        return Err(anyhow::anyhow!("Invalid address '{}': expected 10 hex digits", hex));
    }

    let mut address = [0u8; 5];
    for (i, byte) in address.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", hex, e))?;
    }
    Ok(address)
}

impl Display for LinkUri {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let datarate = match self.datarate {
            Datarate::Dr250K => "250K",
            Datarate::Dr1M => "1M",
            Datarate::Dr2M => "2M",
        };
        write!(f, "radio://{}/{}/{}/", self.dongle, self.channel, datarate)?;
        for byte in self.address {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: LinkUri = "radio://0/80/2M/E7E7E7E7E7".parse().unwrap();
        assert_eq!(uri.dongle, 0);
        assert_eq!(uri.channel, 80);
        assert_eq!(uri.datarate, Datarate::Dr2M);
        assert_eq!(uri.address, DEFAULT_ADDRESS);
    }

    #[test]
    fn address_defaults_when_missing() {
        let uri: LinkUri = "radio://1/10/250K".parse().unwrap();
        assert_eq!(uri.dongle, 1);
        assert_eq!(uri.datarate, Datarate::Dr250K);
        assert_eq!(uri.address, DEFAULT_ADDRESS);
        assert_eq!(uri.to_string(), "radio://1/10/250K/E7E7E7E7E7");
    }

    #[test]
    fn parses_custom_address() {
        let uri: LinkUri = "radio://0/90/2M/F00D2BEFED".parse().unwrap();
        assert_eq!(uri.address, [0xF0, 0x0D, 0x2B, 0xEF, 0xED]);
    }

    #[test]
    fn rejects_malformed_uris() {
        assert!("usb://0".parse::<LinkUri>().is_err());
        assert!("radio://0/80".parse::<LinkUri>().is_err());
        assert!("radio://0/126/2M".parse::<LinkUri>().is_err());
        assert!("radio://0/80/3M".parse::<LinkUri>().is_err());
        assert!("radio://0/80/2M/E7E7".parse::<LinkUri>().is_err());
        assert!("radio://0/80/2M/GGGGGGGGGG".parse::<LinkUri>().is_err());
    }
}
