//! RTP connections: media legs to a remote peer negotiated with SDP.
//!
//! The offer/answer entry points are async because opening a session binds
//! sockets. Every await is followed by a check that the connection is still
//! on the binding the operation started on; a close racing an offer makes
//! the offer fail with `ConnectionError::Closed` instead of reopening media.

use crate::connection::{Connection, ConnectionKind, ConnectionType};
use crate::error::ConnectionError;
use crate::scheduler::{Queue, TaskStatus};
use mgw_common::ConnectionMode;
use mgw_rtp::{
    generate_cname, Frame, LocalMedia, MediaDescription, MediaSession, MediaType,
    NegotiationError, PortManager, SdpBuilder, SessionDescription,
};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Where played-out frames go.
pub type FrameSink = mpsc::UnboundedSender<(MediaType, Frame)>;

/// SDP state of the current binding.
#[derive(Debug, Default)]
struct Exchange {
    cname: String,
    outbound: bool,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
}

/// Media resources of an RTP connection.
pub struct RtpMedia {
    // ---
    audio: MediaSession,
    video: Option<MediaSession>,
    ports: Arc<PortManager>,
    bind_ip: IpAddr,
    sdp: SdpBuilder,
    exchange: Mutex<Exchange>,
    sink: Mutex<Option<FrameSink>>,
}

/// A connection carrying RTP media.
pub type RtpConnection = Connection<RtpMedia>;

impl RtpMedia {
    // ---
    /// Bundles the sessions of one RTP connection.
    ///
    /// # Arguments
    ///
    /// * `audio` - Mandatory audio session
    /// * `video` - Optional video session; offered video is rejected without it
    /// * `ports` - Shared RTP port range
    /// * `bind_ip` - Address the sessions bind to
    /// * `external_address` - Address advertised in SDP instead of `bind_ip`
    pub fn new(
        audio: MediaSession,
        video: Option<MediaSession>,
        ports: Arc<PortManager>,
        bind_ip: IpAddr,
        external_address: Option<String>,
    ) -> Self {
        // ---
        Self {
            audio,
            video,
            ports,
            bind_ip,
            sdp: SdpBuilder::new(bind_ip.to_string(), external_address),
            exchange: Mutex::new(Exchange {
                cname: generate_cname(),
                ..Exchange::default()
            }),
            sink: Mutex::new(None),
        }
    }

    pub fn audio(&self) -> &MediaSession {
        // ---
        &self.audio
    }

    pub fn video(&self) -> Option<&MediaSession> {
        // ---
        self.video.as_ref()
    }

    pub fn session(&self, media: MediaType) -> Option<&MediaSession> {
        // ---
        match media {
            MediaType::Audio => Some(&self.audio),
            MediaType::Video => self.video.as_ref(),
            MediaType::Application => None,
        }
    }

    fn sessions(&self) -> impl Iterator<Item = &MediaSession> {
        // ---
        std::iter::once(&self.audio).chain(self.video.as_ref())
    }

    pub fn cname(&self) -> String {
        // ---
        self.exchange.lock().cname.clone()
    }

    /// Whether this side generated the offer.
    pub fn is_outbound(&self) -> bool {
        // ---
        self.exchange.lock().outbound
    }

    /// The local offer or answer, empty until one was generated.
    pub fn local_descriptor(&self) -> String {
        // ---
        self.exchange
            .lock()
            .local
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// The remote offer or answer, empty until one was received.
    pub fn remote_descriptor(&self) -> String {
        // ---
        self.exchange
            .lock()
            .remote
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Routes played-out frames to `sink`. Without a sink, frames are
    /// dropped once due.
    pub fn set_frame_sink(&self, sink: FrameSink) {
        // ---
        *self.sink.lock() = Some(sink);
    }

    fn close_sessions(&self) {
        // ---
        for session in self.sessions() {
            session.close();
        }
    }
}

impl ConnectionKind for RtpMedia {
    const TYPE: ConnectionType = ConnectionType::Rtp;

    fn on_created(&self) -> anyhow::Result<()> {
        // ---
        for session in self.sessions() {
            session.reset();
        }
        let mut exchange = self.exchange.lock();
        *exchange = Exchange {
            cname: generate_cname(),
            ..Exchange::default()
        };
        debug!("RTP media reset, cname={}", exchange.cname);
        Ok(())
    }

    fn on_closed(&self) -> anyhow::Result<()> {
        // ---
        self.close_sessions();
        Ok(())
    }

    fn on_failed(&self) -> anyhow::Result<()> {
        // ---
        self.close_sessions();
        Ok(())
    }

    fn apply_mode(&self, mode: ConnectionMode) -> anyhow::Result<()> {
        // ---
        for session in self.sessions() {
            session.update_mode(mode);
        }
        Ok(())
    }
}

impl Connection<RtpMedia> {
    // ---
    /// Opens the media sessions and builds a local offer.
    ///
    /// A second call on the same binding returns the existing offer. With
    /// `webrtc` the offer uses rtcp-mux, ICE-lite and DTLS.
    ///
    /// # Errors
    ///
    /// `IllegalState` outside `HALF_OPEN`, `Closed` when the connection was
    /// closed meanwhile, `Session` when sockets could not be bound.
    pub async fn generate_offer(&self, webrtc: bool) -> Result<SessionDescription, ConnectionError> {
        // ---
        let generation = self.begin_negotiation("generate offer")?;
        let media = self.kind();

        {
            let mut exchange = media.exchange.lock();
            if let Some(local) = exchange.local.as_ref().filter(|_| exchange.outbound) {
                return Ok(local.clone());
            }
            exchange.outbound = true;
        }

        let result = self.build_offer(generation, webrtc).await;
        self.settle(generation, result)
    }

    async fn build_offer(
        &self,
        generation: u64,
        webrtc: bool,
    ) -> Result<SessionDescription, ConnectionError> {
        // ---
        let media = self.kind();
        let mut locals = Vec::new();

        for session in media.sessions() {
            self.open_session(session, generation, webrtc).await?;
            if webrtc {
                session.enable_ice();
                session.enable_dtls()?;
            }
            locals.push(session.local_media(true)?);
        }

        let mut exchange = media.exchange.lock();
        let offer = media.sdp.build(true, &exchange.cname, &locals);
        exchange.local = Some(offer.clone());
        exchange.remote = None;

        info!("Connection {:x} generated offer", self.id());
        Ok(offer)
    }

    /// Inbound call: negotiates against the remote offer, builds the answer
    /// and opens the connection.
    ///
    /// Audio is mandatory. Video is answered when a video session exists and
    /// a common codec is found; every other offered stream is rejected with
    /// port 0.
    ///
    /// # Errors
    ///
    /// `IllegalState` outside `HALF_OPEN`. Negotiation and transport errors
    /// fail the connection before being returned.
    pub async fn process_offer(&self, remote: &str) -> Result<SessionDescription, ConnectionError> {
        // ---
        let generation = self.begin_negotiation("process offer")?;
        let result = self.answer_offer(generation, remote).await;
        let answer = self.settle(generation, result)?;

        self.open_checked(Some(generation))?;
        Ok(answer)
    }

    async fn answer_offer(
        &self,
        generation: u64,
        text: &str,
    ) -> Result<SessionDescription, ConnectionError> {
        // ---
        let remote = SessionDescription::parse(text).map_err(NegotiationError::from)?;
        if remote.media_description(MediaType::Audio).is_none() {
            return Err(NegotiationError::MissingMedia(MediaType::Audio).into());
        }

        let media = self.kind();
        media.exchange.lock().outbound = false;

        let mut accepted: Vec<(usize, LocalMedia)> = Vec::new();
        let mut rejected: Vec<usize> = Vec::new();
        let mut answered_audio = false;
        let mut answered_video = false;

        for (index, md) in remote.media.iter().enumerate() {
            let session = match md.media_type() {
                _ if md.is_rejected() => None,
                Some(MediaType::Audio) if !answered_audio => {
                    answered_audio = true;
                    Some(&media.audio)
                }
                Some(MediaType::Video) if !answered_video => {
                    answered_video = true;
                    media.video.as_ref()
                }
                _ => None,
            };
            let Some(session) = session else {
                debug!("Rejecting offered {} stream", md.media);
                rejected.push(index);
                continue;
            };

            match self.setup_inbound(session, &remote, md, generation).await {
                Ok(local) => accepted.push((index, local)),
                Err(e) if session.media() != MediaType::Audio && e.is_negotiation() => {
                    info!("Rejecting {} stream: {}", session.media(), e);
                    session.close();
                    rejected.push(index);
                }
                Err(e) => return Err(e),
            }
        }

        let locals: Vec<LocalMedia> = accepted.iter().map(|(_, local)| local.clone()).collect();
        let mut exchange = media.exchange.lock();
        let mut answer = media.sdp.build(false, &exchange.cname, &locals);
        for index in &rejected {
            media.sdp.reject_media(&mut answer, &remote.media[*index]);
        }

        // Answer streams in offer order
        let order: Vec<usize> = accepted.iter().map(|(i, _)| *i).chain(rejected).collect();
        let mut streams: Vec<(usize, MediaDescription)> =
            order.into_iter().zip(answer.media.drain(..)).collect();
        streams.sort_by_key(|(index, _)| *index);
        answer.media = streams.into_iter().map(|(_, md)| md).collect();

        exchange.local = Some(answer.clone());
        exchange.remote = Some(remote);
        Ok(answer)
    }

    async fn setup_inbound(
        &self,
        session: &MediaSession,
        remote: &SessionDescription,
        md: &MediaDescription,
        generation: u64,
    ) -> Result<LocalMedia, ConnectionError> {
        // ---
        self.open_session(session, generation, md.rtcp_mux).await?;

        if remote.contains_ice() {
            session.enable_ice();
        }
        if remote.contains_dtls() {
            session.enable_dtls()?;
        }
        session.negotiate(remote, md)?;

        Ok(session.local_media(false)?)
    }

    /// Outbound call: applies the remote answer to the offered sessions and
    /// opens the connection.
    ///
    /// # Errors
    ///
    /// `IllegalState` outside `HALF_OPEN` or when no offer was generated.
    /// Negotiation errors fail the connection before being returned.
    pub async fn process_answer(&self, remote: &str) -> Result<(), ConnectionError> {
        // ---
        let generation = self.begin_negotiation("process answer")?;
        if !self.kind().is_outbound() {
            return Err(ConnectionError::IllegalState {
                operation: "process answer",
                state: self.state(),
                reason: "No local offer generated",
            });
        }

        let result = self.apply_answer(generation, remote).await;
        self.settle(generation, result)?;

        self.open_checked(Some(generation))
    }

    async fn apply_answer(&self, generation: u64, text: &str) -> Result<(), ConnectionError> {
        // ---
        let remote = SessionDescription::parse(text).map_err(NegotiationError::from)?;
        let media = self.kind();

        let audio = remote
            .media_description(MediaType::Audio)
            .ok_or(NegotiationError::MissingMedia(MediaType::Audio))?;
        self.connect_outbound(&media.audio, &remote, audio, generation)
            .await?;

        if let Some(video) = media.video.as_ref() {
            let answered = remote.media_description(MediaType::Video);
            let outcome = match answered {
                Some(md) => self.connect_outbound(video, &remote, md, generation).await,
                None => Err(NegotiationError::MissingMedia(MediaType::Video).into()),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_negotiation() => {
                    info!("Video not accepted by remote: {}", e);
                    video.close();
                }
                Err(e) => return Err(e),
            }
        }

        media.exchange.lock().remote = Some(remote);
        Ok(())
    }

    async fn connect_outbound(
        &self,
        session: &MediaSession,
        remote: &SessionDescription,
        md: &MediaDescription,
        generation: u64,
    ) -> Result<(), ConnectionError> {
        // ---
        session.configure_rtcp(md.rtcp_mux).await?;
        self.ensure_current(generation)?;
        session.negotiate(remote, md)?;
        Ok(())
    }

    /// Opens `session` and sets up RTCP, checking the binding after each
    /// await.
    async fn open_session(
        &self,
        session: &MediaSession,
        generation: u64,
        rtcp_mux: bool,
    ) -> Result<(), ConnectionError> {
        // ---
        session.open(self.kind().bind_ip, &self.kind().ports).await?;
        self.check_binding(session, generation)?;

        session.configure_rtcp(rtcp_mux).await?;
        self.check_binding(session, generation)
    }

    /// Fails with `Closed` when the binding is gone. Sockets opened after a
    /// close are released; after a rebind they belong to the new binding.
    fn check_binding(&self, session: &MediaSession, generation: u64) -> Result<(), ConnectionError> {
        // ---
        let stale = self.ensure_current(generation);
        if stale.is_err() && !self.state().is_bound() {
            session.close();
        }
        stale
    }

    /// Fails the connection for errors of a negotiation step.
    ///
    /// Illegal-state and closed errors leave the connection alone, as does
    /// any error surfacing after the binding it started on is gone.
    fn settle<T>(
        &self,
        generation: u64,
        result: Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        // ---
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match &error {
            ConnectionError::Closed(_) | ConnectionError::IllegalState { .. } => Err(error),
            _ if self.ensure_current(generation).is_err() => Err(ConnectionError::Closed(self.id())),
            _ => {
                if error.is_negotiation() {
                    if let Some(metrics) = self.metrics() {
                        metrics.negotiation_failures_total.inc();
                    }
                }
                self.fail_checked(Some(generation), &error.to_string());
                Err(error)
            }
        }
    }

    /// Drains socket traffic into the jitter buffers.
    ///
    /// Received RTP refreshes the connection TTL. An RTP socket failure
    /// fails the connection; RTCP failures are handled by the session.
    pub fn poll_media(&self) -> Result<usize, ConnectionError> {
        // ---
        if !self.state().is_bound() {
            return Ok(0);
        }

        let mut received = 0;
        for session in self.kind().sessions() {
            if !session.is_open() {
                continue;
            }
            match session.poll() {
                Ok(count) => received += count,
                Err(e) => {
                    self.fail(&e.to_string());
                    return Err(e.into());
                }
            }
        }

        if received > 0 {
            self.refresh();
        }
        Ok(received)
    }

    /// Polls media and hands every due frame to the sink. Returns the
    /// number of frames played out.
    pub fn pump(&self) -> Result<usize, ConnectionError> {
        // ---
        self.poll_media()?;

        let sink = self.kind().sink.lock().clone();
        let mut played = 0;
        for session in self.kind().sessions() {
            while let Some(frame) = session.read_frame() {
                played += 1;
                if let Some(sink) = &sink {
                    if sink.send((session.media(), frame)).is_err() {
                        trace!("Frame sink closed");
                    }
                }
            }
        }
        Ok(played)
    }

    /// Schedules [`Connection::pump`] on the media queue for as long as the
    /// connection exists.
    pub fn schedule_media(&self) {
        // ---
        let connection = self.weak();
        self.scheduler().submit(Queue::Media, move || {
            let Some(connection) = connection.upgrade() else {
                return TaskStatus::Cancel;
            };
            if let Err(e) = connection.pump() {
                warn!("Connection {:x} media error: {}", connection.id(), e);
            }
            TaskStatus::Reschedule
        });
    }
}
