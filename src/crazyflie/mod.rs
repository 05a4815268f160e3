//! # Crazyflie connection and subsystems
//!
//! Only the subsystems needed to fly with an external positioning system are implemented:
//! - [`Commander`] to send low-level setpoints
//! - [`Localization`] to push externally measured position or pose
//! - [`Param`] to set parameters by name
//! - [`Log`] to stream log variables
//!
//! The subsystems are thin encoders of CRTP packets on top of a [`RadioLink`].

mod commander;
mod localization;
mod logging;
mod param;

pub use commander::Commander;
pub use localization::Localization;
pub use logging::{Log, LogSample, LogStream, LogType, LogVariable};
pub use param::{Param, ParamValue};

use crazyradio::{Channel, Crazyradio, SharedCrazyradio};

use crate::radiolink::{RadioLink, Transport};
use crate::uri::LinkUri;

/// A connected Crazyflie
///
/// Subsystems are public fields, all their methods take `&self` so the struct can be shared
/// between tasks behind an `Arc`.
pub struct Crazyflie {
    /// Low-level setpoints
    pub commander: Commander,
    /// External position input
    pub localization: Localization,
    /// Parameters
    pub param: Param,
    /// Log blocks
    pub log: Log,
    link: RadioLink,
}

impl Crazyflie {
    /// Connect to a Crazyflie over a Crazyradio
    ///
    /// Opens the dongle designated by the URI, configures its datarate and starts the radio
    /// link.
    ///
    /// # Errors
    ///
    /// Returns an error if the dongle cannot be opened or the Crazyflie does not answer
    pub async fn connect(uri: &LinkUri) -> anyhow::Result<Self> {
        let dongle = uri.dongle;
        let datarate = uri.datarate;

        // Opening the USB device is blocking
        let radio = tokio::task::spawn_blocking(move || -> anyhow::Result<Crazyradio> {
            let mut radio = Crazyradio::open_nth(dongle)
                .map_err(|e| anyhow::anyhow!("Cannot open Crazyradio #{}: {}", dongle, e))?;
            radio.set_datarate(datarate.into())
                .map_err(|e| anyhow::anyhow!("Cannot set radio datarate: {}", e))?;
            Ok(radio)
        })
        .await??;

        let channel = Channel::from_number(uri.channel)
            .map_err(|e| anyhow::anyhow!("Invalid radio channel {}: {}", uri.channel, e))?;

        let crazyflie = Self::with_transport(SharedCrazyradio::new(radio), channel, uri.address).await
            .map_err(|e| anyhow::anyhow!("Cannot connect to Crazyflie at {}: {}", uri, e))?;
        log::info!("Connected to Crazyflie at {}", uri);

        Ok(crazyflie)
    }

    /// Connect to a Crazyflie using any transport
    pub async fn with_transport<T: Transport>(transport: T, channel: Channel, address: [u8; 5]) -> anyhow::Result<Self> {
        let link = RadioLink::spawn(transport, channel, address).await?;

        Ok(Crazyflie {
            commander: Commander::new(link.clone()),
            localization: Localization::new(link.clone()),
            param: Param::new(link.clone()),
            log: Log::new(link.clone()),
            link,
        })
    }

    /// Whether the radio link has been lost or closed
    pub fn is_disconnected(&self) -> bool {
        self.link.is_closed()
    }

    /// Wait until every packet sent so far has been transmitted
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.link.flush().await
    }

    /// Flush queued packets and close the radio link
    pub async fn disconnect(&self) {
        self.link.close().await;
    }
}
