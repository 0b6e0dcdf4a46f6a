//! UDP transport for RTP and RTCP.
//!
//! Sockets are received from on their own tokio task; decoded traffic and
//! socket failures are forwarded over a channel so the media scheduler can
//! process them in its own tick instead of inline.

use crate::error::SessionError;
use mgw_common::RtpPacket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Largest datagram the gateway accepts.
const MAX_DATAGRAM: usize = 2048;

/// Which flow a socket carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Rtp,
    Rtcp,
}

/// One datagram, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Rtp(RtpPacket),
    Rtcp(Vec<u8>),
    Invalid,
}

/// What the receive tasks report to the session.
#[derive(Debug)]
pub enum TransportEvent {
    Rtp { packet: RtpPacket, source: SocketAddr },
    Rtcp { data: Vec<u8>, source: SocketAddr },
    RtpFailure(String),
    RtcpFailure(String),
}

/// A bound UDP socket for one channel of a media session.
#[derive(Debug)]
pub struct MediaSocket {
    // ---
    socket: Arc<UdpSocket>,
    channel: Channel,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl MediaSocket {
    // ---
    /// Binds a socket for `channel` on `addr`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Bind` if the address is unavailable.
    pub async fn bind(addr: SocketAddr, channel: Channel) -> Result<Self, SessionError> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;

        debug!("{:?} socket bound to {}", channel, socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            channel,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn channel(&self) -> Channel {
        // ---
        self.channel
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        // ---
        Ok(self.socket.local_addr()?)
    }

    /// Serializes and sends an RTP packet.
    pub async fn send_packet(&self, packet: &RtpPacket, dest: SocketAddr) -> Result<usize, SessionError> {
        // ---
        let sent = self.send_raw(&packet.serialize(), dest).await?;

        let packets = self.packets_sent.load(Ordering::Relaxed);
        if packets % 100 == 0 {
            debug!(
                "Sent {} packets ({} bytes) - seq={}",
                packets,
                self.bytes_sent.load(Ordering::Relaxed),
                packet.sequence
            );
        }
        Ok(sent)
    }

    pub async fn send_raw(&self, data: &[u8], dest: SocketAddr) -> Result<usize, SessionError> {
        // ---
        let sent = self.socket.send_to(data, dest).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    /// Waits for the next datagram and classifies it.
    ///
    /// RTCP arriving on the RTP socket (rtcp-mux) is recognised by its
    /// packet type byte.
    pub async fn receive(&self) -> std::io::Result<(Received, SocketAddr)> {
        // ---
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);

        if self.channel == Channel::Rtcp || RtpPacket::is_rtcp(&buf) {
            return Ok((Received::Rtcp(buf), src));
        }

        match RtpPacket::deserialize(&buf) {
            Ok(packet) => Ok((Received::Rtp(packet), src)),
            Err(e) => {
                warn!("Dropped invalid packet from {}: {}", src, e);
                Ok((Received::Invalid, src))
            }
        }
    }

    /// Returns statistics about packets sent as (packets, bytes).
    pub fn stats(&self) -> (u64, u64) {
        // ---
        (
            self.packets_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }

    /// Spawns the receive loop, forwarding into `events` until the socket
    /// fails or the receiver side is dropped.
    pub fn spawn_receiver(&self, events: mpsc::UnboundedSender<TransportEvent>) -> JoinHandle<()> {
        // ---
        let socket = MediaSocket {
            socket: Arc::clone(&self.socket),
            channel: self.channel,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        };

        tokio::spawn(async move {
            // ---
            loop {
                let event = match socket.receive().await {
                    Ok((Received::Rtp(packet), source)) => TransportEvent::Rtp { packet, source },
                    Ok((Received::Rtcp(data), source)) => TransportEvent::Rtcp { data, source },
                    Ok((Received::Invalid, _)) => continue,
                    Err(e) => {
                        let reason = e.to_string();
                        info!("{:?} receive loop stopped: {}", socket.channel, reason);
                        let failure = match socket.channel {
                            Channel::Rtp => TransportEvent::RtpFailure(reason),
                            Channel::Rtcp => TransportEvent::RtcpFailure(reason),
                        };
                        let _ = events.send(failure);
                        break;
                    }
                };

                if events.send(event).is_err() {
                    trace!("{:?} event channel closed", socket.channel);
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("addr")
    }

    #[tokio::test]
    async fn test_socket_creation() {
        // ---
        let socket = MediaSocket::bind(loopback(), Channel::Rtp).await;
        assert!(socket.is_ok());
    }

    #[tokio::test]
    async fn test_send_and_classify() {
        // ---
        let a = MediaSocket::bind(loopback(), Channel::Rtp).await.expect("bind a");
        let b = MediaSocket::bind(loopback(), Channel::Rtp).await.expect("bind b");
        let b_addr = b.local_addr().expect("addr");

        let packet = RtpPacket::new(0, 7, 160, 42, vec![1, 2, 3]);
        a.send_packet(&packet, b_addr).await.expect("send");
        a.send_raw(&[0x80, 200, 0, 1, 0, 0, 0, 42], b_addr).await.expect("send rtcp");

        let (first, src) = b.receive().await.expect("recv");
        assert_eq!(first, Received::Rtp(packet));
        assert_eq!(src, a.local_addr().expect("addr"));

        let (second, _) = b.receive().await.expect("recv");
        assert!(matches!(second, Received::Rtcp(_)));

        assert_eq!(a.stats().0, 2);
    }

    #[tokio::test]
    async fn test_receiver_task_forwards_events() {
        // ---
        let a = MediaSocket::bind(loopback(), Channel::Rtp).await.expect("bind a");
        let b = MediaSocket::bind(loopback(), Channel::Rtp).await.expect("bind b");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = b.spawn_receiver(tx);

        let packet = RtpPacket::new(8, 1, 0, 9, vec![0xAA]);
        a.send_packet(&packet, b.local_addr().expect("addr"))
            .await
            .expect("send");

        match rx.recv().await {
            Some(TransportEvent::Rtp { packet: received, .. }) => assert_eq!(received, packet),
            other => panic!("unexpected event: {other:?}"),
        }
        task.abort();
    }
}
