use std::future::Future;
use std::time::Duration;

use crazyradio::{Channel, SharedCrazyradio};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::crtp::{NULL_PACKET, Packet};

const MAX_RETRIES: usize = 10; // Maximum number of retries for packet transmission
const POLL_INTERVAL: Duration = Duration::from_millis(5); // Downlink poll period when idle
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const UPLINK_QUEUE: usize = 64;
const DOWNLINK_QUEUE: usize = 256;

/// Raw radio access used by the link
///
/// Implemented for [`SharedCrazyradio`]. Sends one packet on the given channel and address and
/// reports whether an ACK was received along with the ACK payload.
pub trait Transport: Send + Sync + 'static {
    /// Send one raw packet, return (ack received, ack payload)
    fn send_packet(
        &self,
        channel: Channel,
        address: [u8; 5],
        payload: Vec<u8>,
    ) -> impl Future<Output = anyhow::Result<(bool, Vec<u8>)>> + Send;
}

impl Transport for SharedCrazyradio {
    async fn send_packet(&self, channel: Channel, address: [u8; 5], payload: Vec<u8>) -> anyhow::Result<(bool, Vec<u8>)> {
        let (ack, answer) = self.send_packet_async(channel, address, payload).await
            .map_err(|e| anyhow::anyhow!("Radio error: {}", e))?;
        Ok((ack.received, answer))
    }
}

enum Uplink {
    Packet(Packet),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// # Crazyflie radio link
///
/// The link is run by a background task owning the radio. Packets queued with [`send`](Self::send)
/// are transmitted in order. When nothing is queued the task sends null packets so that the
/// Crazyflie can return its downlink packets in the ACK payloads. Downlink packets are
/// broadcast to every subscriber.
///
/// A packet that is not acknowledged after `MAX_RETRIES` attempts means the Crazyflie is
/// gone: the task stops and every further send fails.
///
/// The handle is cheap to clone, subsystems each keep their own clone.
#[derive(Clone)]
pub struct RadioLink {
    uplink: mpsc::Sender<Uplink>,
    downlink: broadcast::Sender<Packet>,
}

impl RadioLink {
    /// Start the link task over an existing transport
    ///
    /// The Crazyflie is pinged first; the link is only started if it answers.
    ///
    /// # Errors
    ///
    /// Returns an error if no ACK is received within one second
    pub async fn spawn<T: Transport>(transport: T, channel: Channel, address: [u8; 5]) -> anyhow::Result<Self> {
        ping(&transport, channel, address, PING_TIMEOUT).await?;

        let (uplink, uplink_rx) = mpsc::channel(UPLINK_QUEUE);
        let (downlink, _) = broadcast::channel(DOWNLINK_QUEUE);

        let task_downlink = downlink.clone();
        tokio::spawn(async move {
            if let Err(e) = run_link(transport, channel, address, uplink_rx, task_downlink).await {
                log::error!("Radio link lost: {:#}", e);
            }
        });

        Ok(RadioLink { uplink, downlink })
    }

    /// Queue a packet for transmission
    ///
    /// # Errors
    ///
    /// Returns an error if the link has been closed or lost
    pub async fn send(&self, packet: Packet) -> anyhow::Result<()> {
        self.uplink.send(Uplink::Packet(packet)).await
            .map_err(|_| anyhow::anyhow!("Radio link closed"))
    }

    /// Subscribe to downlink packets
    ///
    /// Only packets received after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.downlink.subscribe()
    }

    /// Whether the link task has stopped
    pub fn is_closed(&self) -> bool {
        self.uplink.is_closed()
    }

    /// Send a packet as request, expect one downlink packet as response
    ///
    /// The response must come from the same port and channel, and its first `match_length`
    /// bytes of payload must match the request payload. If no valid response is received within
    /// the timeout duration, the request is sent again, up to MAX_RETRIES times.
    ///
    /// # Arguments
    ///
    /// * `packet` - The request packet
    /// * `match_length` - Number of payload bytes the response must share with the request
    /// * `timeout_duration` - Maximum time to wait for a response per attempt
    ///
    /// # Errors
    ///
    /// Returns an error if no valid response is received after MAX_RETRIES attempts
    pub async fn request(&self, packet: Packet, match_length: usize, timeout_duration: Duration) -> anyhow::Result<Packet> {
        if match_length > packet.data().len() {
            return Err(anyhow::anyhow!(
                "match_length {} cannot be greater than data length {}",
                match_length,
                packet.data().len()
            ));
        }

        for attempt in 0..MAX_RETRIES {
            match self.try_request(&packet, match_length, timeout_duration).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt == MAX_RETRIES - 1 || self.is_closed() {
                        return Err(anyhow::anyhow!(
                            "Failed to get matching response after {} attempts: {}",
                            attempt + 1,
                            e
                        ));
                    }
                    log::debug!("Request attempt {} failed: {}, retrying...", attempt + 1, e);
                }
            }
        }
        unreachable!()
    }

    // Internal method to try a single request
    async fn try_request(&self, packet: &Packet, match_length: usize, timeout_duration: Duration) -> anyhow::Result<Packet> {
        // Subscribe before sending so that a fast answer is not missed
        let mut downlink = self.subscribe();
        self.send(packet.clone()).await?;

        let deadline = Instant::now() + timeout_duration;
        let match_data = &packet.data()[..match_length];

        loop {
            match tokio::time::timeout_at(deadline, downlink.recv()).await {
                Ok(Ok(response)) => {
                    if response.port() == packet.port()
                        && response.channel() == packet.channel()
                        && response.data().starts_with(match_data)
                    {
                        return Ok(response);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::debug!("Downlink subscriber lagged, {} packets skipped", skipped);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(anyhow::anyhow!("Radio link closed"));
                }
                Err(_) => {
                    return Err(anyhow::anyhow!(
                        "Timeout: No valid response received within {:?} for port {} channel {}",
                        timeout_duration,
                        packet.port(),
                        packet.channel()
                    ));
                }
            }
        }
    }

    /// Wait until every packet queued before this call has been acknowledged
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed or lost before the queue is flushed
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (done, wait) = oneshot::channel();
        self.uplink.send(Uplink::Flush(done)).await
            .map_err(|_| anyhow::anyhow!("Radio link closed"))?;
        wait.await.map_err(|_| anyhow::anyhow!("Radio link lost before flush"))
    }

    /// Close the link
    ///
    /// Packets queued before this call are transmitted first.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.uplink.send(Uplink::Close(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

// Internal method to wait for the Crazyflie to answer a null packet
async fn ping<T: Transport>(transport: &T, channel: Channel, address: [u8; 5], timeout_duration: Duration) -> anyhow::Result<()> {
    let start_time = Instant::now();

    while start_time.elapsed() < timeout_duration {
        let (acked, _answer) = transport.send_packet(channel, address, NULL_PACKET.to_vec()).await?;
        if acked {
            return Ok(());
        }

        // Short delay before retry
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    Err(anyhow::anyhow!("Timeout: Crazyflie did not answer within {:?}", timeout_duration))
}

// Send one raw packet, retrying until it is acknowledged
async fn send_with_retries<T: Transport>(transport: &T, channel: Channel, address: [u8; 5], data: &[u8]) -> anyhow::Result<Vec<u8>> {
    for _ in 0..MAX_RETRIES {
        let (acked, answer) = transport.send_packet(channel, address, data.to_vec()).await?;
        if acked {
            return Ok(answer);
        }
    }

    Err(anyhow::anyhow!("No ACK received after {} attempts", MAX_RETRIES))
}

async fn run_link<T: Transport>(
    transport: T,
    channel: Channel,
    address: [u8; 5],
    mut uplink: mpsc::Receiver<Uplink>,
    downlink: broadcast::Sender<Packet>,
) -> anyhow::Result<()> {
    let mut downlink_pending = false;

    loop {
        let next = match uplink.try_recv() {
            Ok(next) => Some(next),
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            Err(mpsc::error::TryRecvError::Empty) if downlink_pending => None,
            Err(mpsc::error::TryRecvError::Empty) => {
                match tokio::time::timeout(POLL_INTERVAL, uplink.recv()).await {
                    Ok(Some(next)) => Some(next),
                    Ok(None) => return Ok(()),
                    Err(_) => None,
                }
            }
        };

        let bytes = match next {
            Some(Uplink::Packet(packet)) => packet.to_bytes(),
            Some(Uplink::Flush(done)) => {
                let _ = done.send(());
                continue;
            }
            Some(Uplink::Close(done)) => {
                let _ = done.send(());
                log::debug!("Radio link closed");
                return Ok(());
            }
            None => NULL_PACKET.to_vec(),
        };

        let answer = send_with_retries(&transport, channel, address, &bytes).await?;

        downlink_pending = false;
        if answer.is_empty() {
            continue;
        }

        match Packet::from_bytes(&answer) {
            Ok(packet) if packet.is_link_control() => {}
            Ok(packet) => {
                downlink_pending = true;
                // No subscriber is not an error, the packet is just dropped
                let _ = downlink.send(packet);
            }
            Err(e) => log::debug!("Dropping malformed downlink packet: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRadio;

    fn channel() -> Channel {
        Channel::from_number(80).unwrap()
    }

    #[tokio::test]
    async fn spawn_fails_when_nobody_answers() {
        let radio = FakeRadio::silent();
        let result = RadioLink::spawn(radio, channel(), [0xE7; 5]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn queued_packets_are_transmitted_in_order() {
        let radio = FakeRadio::new();
        let sent = radio.sent();
        let link = RadioLink::spawn(radio, channel(), [0xE7; 5]).await.unwrap();

        link.send(Packet::new(7, 0, vec![0]).unwrap()).await.unwrap();
        link.send(Packet::new(6, 0, vec![1, 2]).unwrap()).await.unwrap();
        link.close().await;

        let sent = sent.lock().unwrap();
        let non_null: Vec<_> = sent.iter().filter(|p| !p.is_link_control()).collect();
        assert_eq!(non_null.len(), 2);
        assert_eq!(non_null[0].port(), 7);
        assert_eq!(non_null[1].data(), &[1, 2]);
    }

    #[tokio::test]
    async fn flush_waits_for_transmission() {
        let radio = FakeRadio::new();
        let sent = radio.sent();
        let link = RadioLink::spawn(radio, channel(), [0xE7; 5]).await.unwrap();

        for i in 0..5 {
            link.send(Packet::new(7, 0, vec![i]).unwrap()).await.unwrap();
        }
        link.flush().await.unwrap();
        assert_eq!(FakeRadio::payloads(&sent).len(), 5);
        assert!(!link.is_closed());
        link.close().await;
    }

    #[tokio::test]
    async fn request_matches_response_prefix() {
        let radio = FakeRadio::new();
        let link = RadioLink::spawn(radio, channel(), [0xE7; 5]).await.unwrap();

        // The fake echoes param set-by-name requests with a trailing status byte
        let request = Packet::new(2, 3, vec![0, b'a', 0, b'b', 0, 0x08, 1]).unwrap();
        let response = link.request(request, 5, Duration::from_millis(200)).await.unwrap();
        assert_eq!(response.port(), 2);
        assert_eq!(response.channel(), 3);
        assert_eq!(response.data()[..5], [0, b'a', 0, b'b', 0]);
    }

    #[tokio::test]
    async fn link_lost_after_unacked_retries() {
        let radio = FakeRadio::new();
        let control = radio.control();
        let link = RadioLink::spawn(radio, channel(), [0xE7; 5]).await.unwrap();

        control.go_silent();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(link.is_closed());
        assert!(link.send(Packet::new(7, 0, vec![0]).unwrap()).await.is_err());
    }
}
