//! Media session: one RTP stream of one media type.
//!
//! A session owns its sockets, its jitter buffer and its RTP clock. State
//! sits behind a `parking_lot::Mutex` that is never held across an await,
//! so async operations re-validate state once their I/O completes.

use crate::clock::{RtpClock, WallClock};
use crate::error::{NegotiationError, SessionError};
use crate::format::{MediaType, RtpFormat, RtpFormats};
use crate::jitter_buffer::{Frame, JitterBuffer, JitterBufferConfig, JitterBufferStatus, WriteOutcome};
use crate::negotiation::FormatNegotiator;
use crate::port::PortManager;
use crate::sdp::{Fingerprint, IceCredentials, LocalMedia, MediaDescription, SessionDescription};
use crate::stats::RtpStatistics;
use crate::transport::{Channel, MediaSocket, TransportEvent};
use mgw_common::{ConnectionMode, DtmfEvent, MetricsContext, RtpPacket};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Ports tried before `open` gives up.
const BIND_ATTEMPTS: usize = 10;

/// Random alphanumeric CNAME, 16 characters.
pub fn generate_cname() -> String {
    // ---
    random_token(16)
}

fn random_token(len: usize) -> String {
    // ---
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Static configuration of a media session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    // ---
    pub jitter: JitterBufferConfig,

    /// Local capabilities, used for both directions
    pub formats: RtpFormats,

    /// Certificate fingerprint offered when DTLS is requested
    pub dtls_fingerprint: Option<Fingerprint>,

    /// How often RTP statistics are logged
    pub stats_interval: Duration,
}

impl SessionConfig {
    // ---
    pub fn new(formats: RtpFormats) -> Self {
        // ---
        Self {
            jitter: JitterBufferConfig::default(),
            formats,
            dtls_fingerprint: None,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Sockets plus the receive tasks feeding `events`.
struct Transport {
    rtp: Arc<MediaSocket>,
    rtcp: Option<Arc<MediaSocket>>,
    rtp_task: JoinHandle<()>,
    rtcp_task: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events: mpsc::UnboundedReceiver<TransportEvent>,

    /// Bound to an OS-chosen port, so RTCP takes one too
    ephemeral: bool,
}

impl Transport {
    // ---
    fn close_rtcp(&mut self) {
        // ---
        if let Some(task) = self.rtcp_task.take() {
            task.abort();
        }
        self.rtcp = None;
    }

    fn shutdown(mut self) {
        // ---
        self.close_rtcp();
        self.rtp_task.abort();
    }
}

struct SessionInner {
    transport: Option<Transport>,
    mode: ConnectionMode,
    ssrc: u32,
    remote_ssrc: Option<u32>,
    /// SSRC of the stream currently feeding the jitter buffer
    stream_ssrc: Option<u32>,
    remote_rtp: Option<SocketAddr>,
    remote_rtcp: Option<SocketAddr>,
    rtcp_mux: bool,
    negotiated: RtpFormats,
    ice: Option<IceCredentials>,
    dtls: bool,
    jitter: JitterBuffer,
    stats: RtpStatistics,
    tx_sequence: u16,
    tx_timestamp_base: u32,
    rtcp_received: u64,
}

/// One RTP media stream.
pub struct MediaSession {
    // ---
    media: MediaType,
    clock: Arc<RtpClock>,
    negotiator: FormatNegotiator,
    local_fingerprint: Option<Fingerprint>,
    metrics: Option<MetricsContext>,
    inner: Mutex<SessionInner>,
}

impl MediaSession {
    // ---
    pub fn new(media: MediaType, config: SessionConfig, wall: Arc<dyn WallClock>) -> Self {
        // ---
        let clock = Arc::new(RtpClock::new(wall));
        let mut rng = rand::thread_rng();

        Self {
            media,
            negotiator: FormatNegotiator::symmetric(media, config.formats),
            local_fingerprint: config.dtls_fingerprint,
            metrics: None,
            inner: Mutex::new(SessionInner {
                transport: None,
                mode: ConnectionMode::Inactive,
                ssrc: rng.gen(),
                remote_ssrc: None,
                stream_ssrc: None,
                remote_rtp: None,
                remote_rtcp: None,
                rtcp_mux: false,
                negotiated: RtpFormats::new(),
                ice: None,
                dtls: false,
                jitter: JitterBuffer::new(config.jitter, Arc::clone(&clock)),
                stats: RtpStatistics::new(config.stats_interval),
                tx_sequence: rng.gen(),
                tx_timestamp_base: rng.gen(),
                rtcp_received: 0,
            }),
            clock,
        }
    }

    /// Mirrors packet counters and jitter readings into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        {
            let inner = self.inner.get_mut();
            inner.stats = inner.stats.clone().with_metrics(metrics.clone());
        }
        self.metrics = Some(metrics);
        self
    }

    pub fn media(&self) -> MediaType {
        // ---
        self.media
    }

    pub fn clock(&self) -> &Arc<RtpClock> {
        // ---
        &self.clock
    }

    /// Binds the RTP socket on `ip` with a port from `ports`.
    ///
    /// Already-open sessions return their current address.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Bind` when no port in `BIND_ATTEMPTS` tries
    /// could be bound.
    pub async fn open(&self, ip: IpAddr, ports: &PortManager) -> Result<SocketAddr, SessionError> {
        // ---
        if let Some(addr) = self.local_rtp_address() {
            return Ok(addr);
        }

        let mut last_error = None;
        let mut bound = None;
        for _ in 0..BIND_ATTEMPTS {
            let addr = SocketAddr::new(ip, ports.next());
            match MediaSocket::bind(addr, Channel::Rtp).await {
                Ok(socket) => {
                    bound = Some((socket, addr.port() == 0));
                    break;
                }
                Err(e) => {
                    debug!("{} session could not bind {}: {}", self.media, addr, e);
                    last_error = Some(e);
                }
            }
        }
        let (socket, ephemeral) = match (bound, last_error) {
            (Some(bound), _) => bound,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(SessionError::NotOpen(self.media)),
        };
        let local = socket.local_addr()?;

        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.transport {
            // Lost a race with a concurrent open; keep the first socket
            return existing.rtp.local_addr();
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let rtp = Arc::new(socket);
        let rtp_task = rtp.spawn_receiver(events_tx.clone());
        inner.transport = Some(Transport {
            rtp,
            rtcp: None,
            rtp_task,
            rtcp_task: None,
            events_tx,
            events,
            ephemeral,
        });

        info!("{} session opened on {}", self.media, local);
        Ok(local)
    }

    /// Applies rtcp-mux, or binds RTCP on the RTP port + 1 without it.
    pub async fn configure_rtcp(&self, mux: bool) -> Result<(), SessionError> {
        // ---
        let rtcp_addr = {
            let mut inner = self.inner.lock();
            inner.rtcp_mux = mux;
            let transport = inner.transport.as_mut().ok_or(SessionError::NotOpen(self.media))?;
            if mux {
                transport.close_rtcp();
                return Ok(());
            }
            if transport.rtcp.is_some() {
                return Ok(());
            }
            let rtp = transport.rtp.local_addr()?;
            let port = if transport.ephemeral { 0 } else { rtp.port().wrapping_add(1) };
            SocketAddr::new(rtp.ip(), port)
        };

        let socket = Arc::new(MediaSocket::bind(rtcp_addr, Channel::Rtcp).await?);

        let mut inner = self.inner.lock();
        match inner.transport.as_mut() {
            Some(transport) if transport.rtcp.is_none() => {
                transport.rtcp_task = Some(socket.spawn_receiver(transport.events_tx.clone()));
                transport.rtcp = Some(socket);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(SessionError::NotOpen(self.media)),
        }
    }

    /// Negotiates formats against the remote description and records the
    /// remote transport addresses.
    ///
    /// # Errors
    ///
    /// Fails when no common codec exists or the remote address is unusable.
    pub fn negotiate(
        &self,
        remote: &SessionDescription,
        md: &MediaDescription,
    ) -> Result<RtpFormats, NegotiationError> {
        // ---
        let formats = self.negotiator.negotiate(md)?;
        let remote_rtp = remote.rtp_address(md)?;
        let remote_rtcp = remote.rtcp_address(md)?;

        let mut inner = self.inner.lock();
        if inner.ice.is_none() {
            if remote_rtp.is_none() {
                return Err(NegotiationError::NoRemoteAddress(self.media));
            }
            inner.remote_rtp = remote_rtp;
        }
        inner.remote_rtcp = remote_rtcp;
        inner.remote_ssrc = md.ssrc.as_ref().map(|s| s.ssrc);

        if let Some(format) = formats.media() {
            self.clock.set_clock_rate(format.clock_rate);
        }
        inner.jitter.set_formats(formats.clone());
        inner.negotiated = formats.clone();

        info!(
            "{} session negotiated {:?} with {:?}",
            self.media,
            formats.payload_types(),
            inner.remote_rtp
        );
        Ok(formats)
    }

    /// Turns on ICE-lite: local credentials are generated and the remote
    /// RTP address is latched from the first packet received.
    pub fn enable_ice(&self) -> IceCredentials {
        // ---
        let mut inner = self.inner.lock();
        let credentials = inner
            .ice
            .get_or_insert_with(|| IceCredentials {
                ufrag: random_token(8),
                pwd: random_token(24),
            })
            .clone();
        inner.remote_rtp = None;
        credentials
    }

    /// Marks the session as DTLS-SRTP protected.
    pub fn enable_dtls(&self) -> Result<(), NegotiationError> {
        // ---
        if self.local_fingerprint.is_none() {
            return Err(NegotiationError::DtlsUnavailable);
        }
        self.inner.lock().dtls = true;
        Ok(())
    }

    /// What this session contributes to a local offer or answer.
    ///
    /// Offers list every local capability; answers list the negotiated set.
    pub fn local_media(&self, offer: bool) -> Result<LocalMedia, SessionError> {
        // ---
        let inner = self.inner.lock();
        let transport = inner.transport.as_ref().ok_or(SessionError::NotOpen(self.media))?;

        let rtcp_address = match (&transport.rtcp, inner.rtcp_mux) {
            (Some(rtcp), false) => Some(rtcp.local_addr()?),
            _ => None,
        };

        Ok(LocalMedia {
            media: self.media,
            rtp_address: transport.rtp.local_addr()?,
            rtcp_address,
            formats: if offer {
                self.negotiator.supported()
            } else {
                inner.negotiated.clone()
            },
            mode: inner.mode,
            ssrc: inner.ssrc,
            ice: inner.ice.clone(),
            dtls: if inner.dtls {
                self.local_fingerprint.clone()
            } else {
                None
            },
        })
    }

    /// Starts or stops the rx/tx directions.
    pub fn update_mode(&self, mode: ConnectionMode) {
        // ---
        let mut inner = self.inner.lock();
        if inner.mode == mode {
            return;
        }
        if inner.mode.receives() && !mode.receives() {
            inner.jitter.reset();
        }
        debug!("{} session mode {} -> {}", self.media, inner.mode, mode);
        inner.mode = mode;
    }

    /// Drains transport events into the jitter buffer.
    ///
    /// Returns how many RTP packets arrived. RTCP socket failures close the
    /// RTCP socket and are logged.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RtpFailure` when the RTP socket failed.
    pub fn poll(&self) -> Result<usize, SessionError> {
        // ---
        let mut inner = self.inner.lock();
        let mut received = 0;

        loop {
            let event = match inner.transport.as_mut().map(|t| t.events.try_recv()) {
                Some(Ok(event)) => event,
                _ => break,
            };

            match event {
                TransportEvent::Rtp { packet, source } => {
                    received += 1;
                    self.on_rtp(&mut inner, packet, source);
                }
                TransportEvent::Rtcp { data, source } => {
                    inner.rtcp_received += 1;
                    trace!("RTCP from {}: {} bytes", source, data.len());
                }
                TransportEvent::RtpFailure(reason) => {
                    return Err(SessionError::RtpFailure(reason));
                }
                TransportEvent::RtcpFailure(reason) => {
                    warn!("{} RTCP channel failed, closing it: {}", self.media, reason);
                    if let Some(transport) = inner.transport.as_mut() {
                        transport.close_rtcp();
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .jitter_buffer_occupancy_packets
                .set(inner.jitter.len() as i64);
        }
        Ok(received)
    }

    fn on_rtp(&self, inner: &mut SessionInner, packet: RtpPacket, source: SocketAddr) {
        // ---
        if inner.ice.is_some() && inner.remote_rtp.is_none() {
            info!("{} session latched remote RTP address {}", self.media, source);
            inner.remote_rtp = Some(source);
        }
        if !inner.mode.receives() {
            return;
        }

        if inner.stream_ssrc != Some(packet.ssrc) {
            if let Some(previous) = inner.stream_ssrc {
                info!(
                    "{} stream restarted: ssrc {:#010x} -> {:#010x}",
                    self.media, previous, packet.ssrc
                );
                inner.jitter.reset();
                inner.stats.reset();
            }
            inner.stream_ssrc = Some(packet.ssrc);
        }

        inner.stats.record_received(packet.sequence, packet.payload.len());
        let dropped_before = inner.jitter.dropped();
        let outcome = inner.jitter.write_mapped(packet);
        let mut discarded = inner.jitter.dropped() - dropped_before;
        if outcome == WriteOutcome::Late {
            inner.stats.record_late_packet();
            discarded -= 1;
        }
        if discarded > 0 {
            inner.stats.record_discarded(discarded);
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .interarrival_jitter_units
                .observe(inner.jitter.estimated_jitter() as f64);
        }
    }

    /// Next frame due for playout, if any.
    pub fn read_frame(&self) -> Option<Frame> {
        // ---
        let mut inner = self.inner.lock();
        if !inner.mode.receives() {
            return None;
        }
        inner.jitter.read(self.clock.wall_millis())
    }

    /// Sends one media payload in the negotiated codec.
    ///
    /// Returns `Ok(false)` when the current mode does not transmit.
    pub async fn send(&self, payload: Vec<u8>, marker: bool) -> Result<bool, SessionError> {
        // ---
        self.transmit(false, payload, marker).await
    }

    /// Sends one RFC 2833 event packet.
    pub async fn send_dtmf(&self, event: DtmfEvent) -> Result<bool, SessionError> {
        // ---
        let marker = event.duration == 0;
        self.transmit(true, event.serialize().to_vec(), marker).await
    }

    async fn transmit(&self, dtmf: bool, payload: Vec<u8>, marker: bool) -> Result<bool, SessionError> {
        // ---
        let (socket, dest, packet) = {
            let mut inner = self.inner.lock();
            if !inner.mode.sends() {
                return Ok(false);
            }
            let socket = match &inner.transport {
                Some(transport) => Arc::clone(&transport.rtp),
                None => return Err(SessionError::NotOpen(self.media)),
            };
            let dest = inner.remote_rtp.ok_or(SessionError::NoRemotePeer(self.media))?;
            let format: RtpFormat = if dtmf {
                inner.negotiated.dtmf().cloned().ok_or(SessionError::NoFormat(self.media, "DTMF"))?
            } else {
                inner.negotiated.media().cloned().ok_or(SessionError::NoFormat(self.media, "media"))?
            };

            let elapsed = self.clock.wall_millis() * format.clock_rate as u64 / 1000;
            let timestamp = inner.tx_timestamp_base.wrapping_add(elapsed as u32);
            let sequence = inner.tx_sequence;
            inner.tx_sequence = sequence.wrapping_add(1);

            let packet = RtpPacket::new(format.payload_type, sequence, timestamp, inner.ssrc, payload)
                .with_marker(marker);
            (socket, dest, packet)
        };

        socket.send_packet(&packet, dest).await?;
        self.inner.lock().stats.record_sent(packet.payload.len());
        Ok(true)
    }

    /// Releases sockets and negotiated state. The SSRC is kept.
    pub fn close(&self) {
        // ---
        let mut inner = self.inner.lock();
        if let Some(transport) = inner.transport.take() {
            transport.shutdown();
            inner.stats.log();
            info!("{} session closed", self.media);
        }
        inner.mode = ConnectionMode::Inactive;
        inner.remote_rtp = None;
        inner.remote_rtcp = None;
        inner.remote_ssrc = None;
        inner.stream_ssrc = None;
        inner.rtcp_mux = false;
        inner.negotiated.clear();
        inner.ice = None;
        inner.dtls = false;
        inner.rtcp_received = 0;
        inner.jitter.reset();
        inner.stats.reset();
    }

    /// Closes and picks a fresh SSRC and sequence space.
    pub fn reset(&self) {
        // ---
        self.close();
        let mut rng = rand::thread_rng();
        let mut inner = self.inner.lock();
        inner.ssrc = rng.gen();
        inner.tx_sequence = rng.gen();
        inner.tx_timestamp_base = rng.gen();
    }

    pub fn is_open(&self) -> bool {
        // ---
        self.inner.lock().transport.is_some()
    }

    /// Open, negotiated and with a remote peer (or waiting to latch one).
    pub fn is_usable(&self) -> bool {
        // ---
        let inner = self.inner.lock();
        inner.transport.is_some()
            && inner.negotiated.has_non_dtmf()
            && (inner.remote_rtp.is_some() || inner.ice.is_some())
    }

    pub fn mode(&self) -> ConnectionMode {
        // ---
        self.inner.lock().mode
    }

    pub fn ssrc(&self) -> u32 {
        // ---
        self.inner.lock().ssrc
    }

    pub fn remote_ssrc(&self) -> Option<u32> {
        // ---
        self.inner.lock().remote_ssrc
    }

    pub fn local_rtp_address(&self) -> Option<SocketAddr> {
        // ---
        let inner = self.inner.lock();
        inner.transport.as_ref().and_then(|t| t.rtp.local_addr().ok())
    }

    pub fn local_rtcp_address(&self) -> Option<SocketAddr> {
        // ---
        let inner = self.inner.lock();
        inner
            .transport
            .as_ref()
            .and_then(|t| t.rtcp.as_ref())
            .and_then(|s| s.local_addr().ok())
    }

    pub fn remote_rtp_address(&self) -> Option<SocketAddr> {
        // ---
        self.inner.lock().remote_rtp
    }

    pub fn remote_rtcp_address(&self) -> Option<SocketAddr> {
        // ---
        self.inner.lock().remote_rtcp
    }

    pub fn rtcp_mux(&self) -> bool {
        // ---
        self.inner.lock().rtcp_mux
    }

    pub fn ice_enabled(&self) -> bool {
        // ---
        self.inner.lock().ice.is_some()
    }

    pub fn dtls_enabled(&self) -> bool {
        // ---
        self.inner.lock().dtls
    }

    pub fn negotiated_formats(&self) -> RtpFormats {
        // ---
        self.inner.lock().negotiated.clone()
    }

    /// Capabilities this session offers.
    pub fn supported_formats(&self) -> RtpFormats {
        // ---
        self.negotiator.supported()
    }

    pub fn jitter_status(&self) -> JitterBufferStatus {
        // ---
        self.inner.lock().jitter.status()
    }

    pub fn statistics(&self) -> RtpStatistics {
        // ---
        self.inner.lock().stats.clone()
    }

    pub fn rtcp_received(&self) -> u64 {
        // ---
        self.inner.lock().rtcp_received
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        if let Some(transport) = self.inner.get_mut().transport.take() {
            transport.shutdown();
        }
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("media", &self.media)
            .field("open", &self.is_open())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::clock::SystemClock;
    use crate::format::AvProfile;
    use crate::sdp::SdpBuilder;

    fn session(formats: RtpFormats) -> MediaSession {
        let mut config = SessionConfig::new(formats);
        config.jitter.tolerance_ms = 0;
        MediaSession::new(MediaType::Audio, config, Arc::new(SystemClock::new()))
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().expect("ip")
    }

    fn ephemeral() -> PortManager {
        PortManager::new(0, 0)
    }

    async fn poll_until_received(session: &MediaSession) -> usize {
        for _ in 0..100 {
            let received = session.poll().expect("poll");
            if received > 0 {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    fn describe(session: &MediaSession, offer: bool) -> SessionDescription {
        let media = session.local_media(offer).expect("local media");
        SdpBuilder::new("127.0.0.1", None).build(offer, "test", &[media])
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        // ---
        let s = session(AvProfile::audio());
        let first = s.open(localhost(), &ephemeral()).await.expect("open");
        let second = s.open(localhost(), &ephemeral()).await.expect("open again");

        assert_eq!(first, second);
        assert!(s.is_open());
        assert!(!s.is_usable());
    }

    #[tokio::test]
    async fn test_rtcp_port_and_mux() {
        // ---
        let s = session(AvProfile::audio());
        s.open(localhost(), &ephemeral()).await.expect("open");

        s.configure_rtcp(false).await.expect("rtcp");
        assert!(s.local_rtcp_address().is_some());
        assert!(s.local_media(true).expect("media").rtcp_address.is_some());

        s.configure_rtcp(true).await.expect("mux");
        assert!(s.local_rtcp_address().is_none());
        assert!(s.rtcp_mux());
    }

    #[tokio::test]
    async fn test_media_flows_between_sessions() {
        // ---
        let caller = session(AvProfile::audio());
        let callee = session(AvProfile::audio());
        caller.open(localhost(), &ephemeral()).await.expect("open caller");
        callee.open(localhost(), &ephemeral()).await.expect("open callee");

        let offer = describe(&caller, true);
        callee
            .negotiate(&offer, &offer.media[0])
            .expect("callee negotiates");
        let answer = describe(&callee, false);
        caller
            .negotiate(&answer, &answer.media[0])
            .expect("caller negotiates");

        assert!(caller.is_usable() && callee.is_usable());
        assert_eq!(caller.remote_ssrc(), Some(callee.ssrc()));

        caller.update_mode(ConnectionMode::SendOnly);
        callee.update_mode(ConnectionMode::RecvOnly);
        assert!(caller.send(vec![0xFF; 160], true).await.expect("send"));

        assert_eq!(poll_until_received(&callee).await, 1);
        let frame = callee.read_frame().expect("frame due");
        assert_eq!(frame.payload.len(), 160);
        assert_eq!(frame.format.encoding, "PCMU");
        assert!(frame.marker);
        assert_eq!(callee.statistics().packets_received, 1);
    }

    /// Opens `session` as the answerer of a plain PCMU offer and returns
    /// the address it receives RTP on.
    async fn open_receiver(session: &MediaSession) -> SocketAddr {
        let peer = session_with(AvProfile::audio(), JitterBufferConfig::default());
        peer.open(localhost(), &ephemeral()).await.expect("open peer");
        session.open(localhost(), &ephemeral()).await.expect("open receiver");

        let offer = describe(&peer, true);
        session.negotiate(&offer, &offer.media[0]).expect("negotiates");
        session.update_mode(ConnectionMode::RecvOnly);
        session.local_rtp_address().expect("rtp address")
    }

    fn session_with(formats: RtpFormats, jitter: JitterBufferConfig) -> MediaSession {
        let mut config = SessionConfig::new(formats);
        config.jitter = jitter;
        MediaSession::new(MediaType::Audio, config, Arc::new(SystemClock::new()))
    }

    async fn send_stream(
        socket: &tokio::net::UdpSocket,
        to: SocketAddr,
        ssrc: u32,
        sequences: std::ops::Range<u16>,
    ) {
        for seq in sequences {
            let packet = RtpPacket::new(0, seq, seq as u32 * 160, ssrc, vec![0xD5; 160]);
            socket.send_to(&packet.serialize(), to).await.expect("send");
        }
    }

    async fn collect_frames(session: &MediaSession, expected: usize) -> Vec<u16> {
        let mut sequences = Vec::new();
        for _ in 0..100 {
            session.poll().expect("poll");
            sequences.extend(std::iter::from_fn(|| session.read_frame()).map(|f| f.sequence));
            if sequences.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sequences
    }

    #[tokio::test]
    async fn test_new_ssrc_restarts_playout() {
        // ---
        let callee = session(AvProfile::audio());
        let target = open_receiver(&callee).await;
        let remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        send_stream(&remote, target, 0x1111_1111, 20000..20005).await;
        assert_eq!(
            collect_frames(&callee, 5).await,
            vec![20000, 20001, 20002, 20003, 20004]
        );

        // Restarted sender: new SSRC, sequence space far behind the old one
        send_stream(&remote, target, 0x2222_2222, 100..105).await;
        assert_eq!(collect_frames(&callee, 5).await, vec![100, 101, 102, 103, 104]);

        let stats = callee.statistics();
        assert_eq!(stats.packets_received, 5);
        assert_eq!(stats.packets_late, 0);
        assert_eq!(callee.jitter_status().dropped, 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_reach_metrics() {
        // ---
        let metrics = MetricsContext::new("session-test").expect("metrics init");
        let jitter = JitterBufferConfig {
            tolerance_ms: 60_000,
            max_packets: 2,
        };
        let callee = session_with(AvProfile::audio(), jitter).with_metrics(metrics.clone());
        let target = open_receiver(&callee).await;
        let remote = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        send_stream(&remote, target, 0x1111_1111, 1..6).await;
        let mut received = 0;
        for _ in 0..100 {
            received += callee.poll().expect("poll");
            if received >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(received, 5);
        assert_eq!(callee.jitter_status().buffered_packets, 2);
        assert_eq!(callee.statistics().packets_discarded, 3);
        assert_eq!(metrics.jitter_buffer_dropped_total.get(), 3);
    }

    #[tokio::test]
    async fn test_mode_gates_send() {
        // ---
        let s = session(AvProfile::audio());
        assert!(!s.send(vec![1], false).await.expect("inactive send is a no-op"));

        s.update_mode(ConnectionMode::SendRecv);
        assert!(matches!(
            s.send(vec![1], false).await,
            Err(SessionError::NotOpen(MediaType::Audio))
        ));
    }

    #[tokio::test]
    async fn test_negotiation_failure() {
        // ---
        let pcma_only: RtpFormats = [RtpFormat::new(8, "PCMA", 8000)].into_iter().collect();
        let s = session(pcma_only);
        s.open(localhost(), &ephemeral()).await.expect("open");

        let text = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n";
        let remote = SessionDescription::parse(text).expect("parses");

        assert_eq!(
            s.negotiate(&remote, &remote.media[0]),
            Err(NegotiationError::CodecsNotNegotiated(MediaType::Audio))
        );
        assert!(!s.is_usable());
    }

    #[tokio::test]
    async fn test_ice_latches_remote_address() {
        // ---
        let caller = session(AvProfile::audio());
        let callee = session(AvProfile::audio());
        caller.open(localhost(), &ephemeral()).await.expect("open caller");
        callee.open(localhost(), &ephemeral()).await.expect("open callee");

        callee.enable_ice();
        let offer = describe(&caller, true);
        callee.negotiate(&offer, &offer.media[0]).expect("negotiates");
        assert_eq!(callee.remote_rtp_address(), None);
        assert!(callee.is_usable());

        let answer = describe(&callee, false);
        assert!(answer.ice_lite);
        caller.negotiate(&answer, &answer.media[0]).expect("negotiates");
        caller.update_mode(ConnectionMode::SendRecv);
        caller.send(vec![0; 10], false).await.expect("send");

        poll_until_received(&callee).await;
        assert_eq!(callee.remote_rtp_address(), caller.local_rtp_address());
    }

    #[test]
    fn test_dtls_requires_fingerprint() {
        // ---
        let s = session(AvProfile::audio());
        assert_eq!(s.enable_dtls(), Err(NegotiationError::DtlsUnavailable));
    }

    #[tokio::test]
    async fn test_reset_changes_ssrc_and_closes() {
        // ---
        let s = session(AvProfile::audio());
        s.open(localhost(), &ephemeral()).await.expect("open");
        let ssrc = s.ssrc();

        s.reset();
        assert!(!s.is_open());
        // A collision here is a 1 in 2^32 event
        assert_ne!(s.ssrc(), ssrc);
        assert_eq!(generate_cname().len(), 16);
    }
}
