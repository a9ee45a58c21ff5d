//! webrtc-rs backend
//!
//! [`RtcTransportFactory`] builds [`RtcPeerTransport`]s over
//! `webrtc::RTCPeerConnection`. [`SampleCapture`] is a capture device whose
//! tracks are fed by the application through [`SampleTrack::write_sample`]
//! (synthetic media, file playback, or a native capture pipeline).

use crate::config::IceServer;
use crate::media::{
    CaptureEnvironment, CaptureError, FacingMode, LocalMedia, MediaCapture, MediaConstraints,
    MediaTrack, TrackKind, TrackRef,
};
use crate::transport::{
    OfferOptions, PeerTransport, SignalingState, TransportError, TransportEvent,
    TransportEventSender, TransportFactory,
};
use crate::types::{ConnectionHealth, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "sightline";

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Local track backed by `TrackLocalStaticSample`
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    facing_mode: Mutex<Option<FacingMode>>,
    samples_written: AtomicU64,
    inner: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled())
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

impl SampleTrack {
    /// Create a track of `kind`
    pub fn new(kind: TrackKind, facing_mode: Option<FacingMode>) -> Self {
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let inner = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            facing_mode: Mutex::new(facing_mode),
            samples_written: AtomicU64::new(0),
            inner,
        }
    }

    /// Underlying webrtc-rs track
    pub fn webrtc_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.inner
    }

    /// Samples accepted for sending
    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Send one encoded media sample
    ///
    /// Disabled tracks drop samples silently.
    ///
    /// # Errors
    ///
    /// Returns error if the track was stopped or the write fails
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), CaptureError> {
        if !self.is_live() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "track {} stopped",
                self.id
            )));
        }
        if !self.enabled() {
            return Ok(());
        }

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner
            .write_sample(&sample)
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        self.samples_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn facing_mode(&self) -> Option<FacingMode> {
        *self.facing_mode.lock()
    }

    async fn apply_facing_mode(&self, mode: FacingMode) -> Result<(), CaptureError> {
        if self.kind != TrackKind::Video {
            return Err(CaptureError::Unsupported(format!(
                "{} track has no camera",
                self.kind
            )));
        }
        if !self.is_live() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "track {} stopped",
                self.id
            )));
        }
        *self.facing_mode.lock() = Some(mode);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture device producing [`SampleTrack`]s
#[derive(Debug)]
pub struct SampleCapture {
    environment: CaptureEnvironment,
    tracks: Mutex<Vec<Arc<SampleTrack>>>,
}

impl SampleCapture {
    /// Capture device in a fully capable environment
    pub fn new() -> Self {
        Self::with_environment(CaptureEnvironment::capable())
    }

    /// Capture device reporting `environment`
    pub fn with_environment(environment: CaptureEnvironment) -> Self {
        Self {
            environment,
            tracks: Mutex::new(Vec::new()),
        }
    }

    /// Every track handed out so far, for feeding samples
    pub fn tracks(&self) -> Vec<Arc<SampleTrack>> {
        self.tracks.lock().clone()
    }
}

impl Default for SampleCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCapture for SampleCapture {
    fn environment(&self) -> CaptureEnvironment {
        self.environment
    }

    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError> {
        if !constraints.audio && !constraints.video {
            return Err(CaptureError::ConstraintFailed(
                "at least one of audio or video must be requested".into(),
            ));
        }

        let audio = constraints
            .audio
            .then(|| Arc::new(SampleTrack::new(TrackKind::Audio, None)));
        let video = constraints
            .video
            .then(|| Arc::new(SampleTrack::new(TrackKind::Video, Some(constraints.facing_mode))));

        let mut tracks = self.tracks.lock();
        tracks.extend(audio.iter().cloned());
        tracks.extend(video.iter().cloned());

        Ok(LocalMedia {
            audio: audio.map(|t| t as TrackRef),
            video: video.map(|t| t as TrackRef),
        })
    }
}

// ============================================================================
// Remote tracks
// ============================================================================

/// Track received from the remote peer
#[derive(Debug)]
pub struct RtcRemoteTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: Arc<AtomicBool>,
    packets: Arc<AtomicU64>,
}

impl RtcRemoteTrack {
    fn spawn(track: Arc<TrackRemote>, kind: TrackKind) -> Arc<Self> {
        let remote = Arc::new(Self {
            id: track.id(),
            kind,
            enabled: AtomicBool::new(true),
            live: Arc::new(AtomicBool::new(true)),
            packets: Arc::new(AtomicU64::new(0)),
        });

        let live = Arc::clone(&remote.live);
        let packets = Arc::clone(&remote.packets);
        tokio::spawn(async move {
            while live.load(Ordering::Relaxed) {
                match track.read_rtp().await {
                    Ok(_) => {
                        packets.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Remote track ended");
                        break;
                    }
                }
            }
        });

        remote
    }

    /// RTP packets received
    pub fn packets_received(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Peer transport
// ============================================================================

fn map_peer_state(state: RTCPeerConnectionState) -> Option<ConnectionHealth> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionHealth::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionHealth::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionHealth::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionHealth::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionHealth::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionHealth::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<ConnectionHealth> {
    match state {
        RTCIceConnectionState::New => Some(ConnectionHealth::New),
        RTCIceConnectionState::Checking => Some(ConnectionHealth::Connecting),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(ConnectionHealth::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(ConnectionHealth::Disconnected),
        RTCIceConnectionState::Failed => Some(ConnectionHealth::Failed),
        RTCIceConnectionState::Closed => Some(ConnectionHealth::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| TransportError::SetDescription(e.to_string()))
}

/// Factory for [`RtcPeerTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    #[tracing::instrument(skip_all, fields(ice_servers = ice_servers.len()))]
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("Failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        register_handlers(&pc, &events);
        tracing::debug!("Peer connection created");

        Ok(Arc::new(RtcPeerTransport { pc }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: &TransportEventSender) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(health) = map_peer_state(state) {
            let _ = tx.send(TransportEvent::ConnectionState(health));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(health) = map_ice_state(state) {
            let _ = tx.send(TransportEvent::IceConnectionState(health));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => return,
            };
            let remote = RtcRemoteTrack::spawn(track, kind);
            let _ = tx.send(TransportEvent::RemoteTrack(remote));
        })
    }));
}

/// Peer transport over `RTCPeerConnection`
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: TrackRef) -> Result<(), TransportError> {
        let sample = track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .ok_or_else(|| {
                TransportError::AddTrack(format!("track {} is not a sample track", track.id()))
            })?;

        let sender = self
            .pc
            .add_track(Arc::clone(sample.webrtc_track()) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::AddTrack(e.to_string()))?;

        // RTCP must be drained for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Local track added");
        Ok(())
    }

    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), TransportError> {
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| TransportError::AddTrack(e.to_string()))?;
        tracing::debug!(%kind, "Receive-only transceiver added");
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| TransportError::CreateDescription(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::CreateDescription(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| TransportError::SetDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::SetDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::AddCandidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionHealth {
        map_peer_state(self.pc.connection_state()).unwrap_or(ConnectionHealth::New)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "Failed to close peer connection");
        }
    }
}
