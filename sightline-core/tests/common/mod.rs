//! Shared fakes for session integration tests
//!
//! `FakeTransport` models the offer/answer state machine of a real peer
//! connection closely enough for the session logic: descriptions must be
//! applied in a legal order, candidates need a remote description, and once
//! both sides are applied it "connects" and surfaces the remote peer's
//! sending tracks.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sightline_core::signaling::SIGNAL_EVENT;
use sightline_core::{
    room_name, CallHandle, CallId, CallService, CaptureEnvironment, CaptureError,
    ConnectionHealth, EventObserver, FacingMode, IceCandidate, IceServer, LocalMedia,
    MediaCapture, MediaConstraints, MediaTrack, MemoryRelay, OfferOptions, ParticipantId,
    PeerTransport, RelayEvent, RelaySubscription, SdpType, ServiceError, SessionConfig,
    SessionDescription, SessionEvent, SessionParams, SignalEnvelope, SignalMessage, SignalRelay,
    SignalingState, TrackKind, TransportError, TransportEvent, TransportEventSender,
    TransportFactory,
};
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

// ----- tracks and capture -----

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    facing_mode: Mutex<Option<FacingMode>>,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let facing_mode = (kind == TrackKind::Video).then_some(FacingMode::User);
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            facing_mode: Mutex::new(facing_mode),
        }
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
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
            return Err(CaptureError::Unsupported("not a camera".into()));
        }
        *self.facing_mode.lock() = Some(mode);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct FakeCapture {
    environment: CaptureEnvironment,
    error: Option<CaptureError>,
    requests: Mutex<Vec<MediaConstraints>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self {
            environment: CaptureEnvironment::capable(),
            error: None,
            requests: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_environment(environment: CaptureEnvironment) -> Self {
        Self {
            environment,
            ..Self::new()
        }
    }

    pub fn failing(error: CaptureError) -> Self {
        Self {
            error: Some(error),
            ..Self::new()
        }
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    pub fn track(&self, kind: TrackKind) -> Arc<FakeTrack> {
        self.tracks()
            .into_iter()
            .find(|t| t.kind == kind)
            .expect("no captured track of that kind")
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    fn environment(&self) -> CaptureEnvironment {
        self.environment
    }

    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError> {
        self.requests.lock().push(constraints);
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let mut media = LocalMedia::default();
        let mut tracks = self.tracks.lock();
        if constraints.audio {
            let track = Arc::new(FakeTrack::new(format!("mic-{}", tracks.len()), TrackKind::Audio));
            tracks.push(track.clone());
            media.audio = Some(track);
        }
        if constraints.video {
            let track = Arc::new(FakeTrack::new(format!("cam-{}", tracks.len()), TrackKind::Video));
            *track.facing_mode.lock() = Some(constraints.facing_mode);
            tracks.push(track.clone());
            media.video = Some(track);
        }
        Ok(media)
    }
}

// ----- transport -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTrack(TrackKind),
    AddReceiveOnly(TrackKind),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct FakeTransportConfig {
    /// Time `create_offer` takes
    pub offer_delay: Duration,
    /// Fail every `create_offer`
    pub fail_offer: bool,
    /// Report `connected` once both descriptions are applied
    pub auto_connect: bool,
}

impl Default for FakeTransportConfig {
    fn default() -> Self {
        Self {
            offer_delay: Duration::ZERO,
            fail_offer: false,
            auto_connect: true,
        }
    }
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    connection: ConnectionHealth,
    legs: Vec<(TrackKind, &'static str)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    generation: u64,
    remote_track_ids: HashSet<String>,
    ops: Vec<Op>,
    offers: Vec<(Instant, bool)>,
}

#[derive(Debug)]
pub struct FakeTransport {
    label: String,
    events: TransportEventSender,
    config: FakeTransportConfig,
    ice_servers: Vec<IceServer>,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn new(
        label: String,
        events: TransportEventSender,
        config: FakeTransportConfig,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            label,
            events,
            config,
            ice_servers,
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                connection: ConnectionHealth::New,
                legs: Vec::new(),
                local: None,
                remote: None,
                generation: 0,
                remote_track_ids: HashSet::new(),
                ops: Vec::new(),
                offers: Vec::new(),
            }),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().ops.clone()
    }

    pub fn count(&self, op: &Op) -> usize {
        self.state.lock().ops.iter().filter(|o| *o == op).count()
    }

    /// Offer creation times and their restart flag
    pub fn offers(&self) -> Vec<(Instant, bool)> {
        self.state.lock().offers.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    /// Simulate the connection failing
    pub fn fail(&self) {
        self.state.lock().connection = ConnectionHealth::Failed;
        self.emit(TransportEvent::ConnectionState(ConnectionHealth::Failed));
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn render(&self, state: &FakeState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\n",
            self.label, state.generation
        );
        for (kind, direction) in &state.legs {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na={direction}\r\n"));
        }
        sdp
    }

    fn gather_candidates(&self, generation: u64) {
        for n in 0..2u16 {
            let candidate = IceCandidate::new(format!(
                "candidate:{}-{generation}-{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.label,
                50_000 + n
            ));
            self.emit(TransportEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self, state: &mut FakeState) {
        if !self.config.auto_connect
            || state.signaling != SignalingState::Stable
            || state.local.is_none()
        {
            return;
        }
        let Some(remote) = state.remote.clone() else {
            return;
        };

        for kind in sending_kinds(&remote.sdp) {
            let id = format!("{}-remote-{kind}", self.label);
            if state.remote_track_ids.insert(id.clone()) {
                self.emit(TransportEvent::RemoteTrack(Arc::new(FakeTrack::new(id, kind))));
            }
        }
        state.connection = ConnectionHealth::Connected;
        self.emit(TransportEvent::ConnectionState(ConnectionHealth::Connected));
    }
}

fn sending_kinds(sdp: &str) -> Vec<TrackKind> {
    let mut kinds = Vec::new();
    let mut current = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            current = match rest.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if line == "a=sendrecv" {
            kinds.extend(current);
        }
    }
    kinds
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: sightline_core::TrackRef) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.ops.push(Op::AddTrack(track.kind()));
        state.legs.push((track.kind(), "sendrecv"));
        Ok(())
    }

    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.ops.push(Op::AddReceiveOnly(kind));
        state.legs.push((kind, "recvonly"));
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError> {
        {
            let mut state = self.state.lock();
            state.ops.push(Op::CreateOffer {
                ice_restart: options.ice_restart,
            });
            state.offers.push((Instant::now(), options.ice_restart));
        }
        if !self.config.offer_delay.is_zero() {
            tokio::time::sleep(self.config.offer_delay).await;
        }
        if self.config.fail_offer {
            return Err(TransportError::CreateDescription("offer refused".into()));
        }

        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        state.generation += 1;
        Ok(SessionDescription::offer(self.render(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        state.ops.push(Op::CreateAnswer);
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::CreateDescription(format!(
                "no remote offer in {:?}",
                state.signaling
            )));
        }
        state.generation += 1;
        Ok(SessionDescription::answer(self.render(&state)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let generation = {
            let mut state = self.state.lock();
            state.ops.push(Op::SetLocal(description.kind));
            state.signaling = match (state.signaling, description.kind) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (current, kind) => {
                    return Err(TransportError::SetDescription(format!(
                        "local {kind:?} in {current:?}"
                    )))
                }
            };
            state.local = Some(description);
            self.maybe_connect(&mut state);
            state.generation
        };
        self.gather_candidates(generation);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.ops.push(Op::SetRemote(description.kind));
        state.signaling = match (state.signaling, description.kind) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(TransportError::SetDescription(format!(
                    "remote {kind:?} in {current:?}"
                )))
            }
        };
        state.remote = Some(description);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(TransportError::AddCandidate(
                "remote description not set".into(),
            ));
        }
        state.ops.push(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionHealth {
        self.state.lock().connection
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.ops.push(Op::Close);
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionHealth::Closed;
        }
    }
}

#[derive(Debug)]
pub struct FakeFactory {
    label: String,
    config: FakeTransportConfig,
    error: Option<TransportError>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_config(label, FakeTransportConfig::default())
    }

    pub fn with_config(label: impl Into<String>, config: FakeTransportConfig) -> Self {
        Self {
            label: label.into(),
            config,
            error: None,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(label: impl Into<String>, error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(label)
        }
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let transport = Arc::new(FakeTransport::new(
            self.label.clone(),
            events,
            self.config.clone(),
            ice_servers.to_vec(),
        ));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

// ----- participants -----

/// One participant wired to a shared relay
pub struct Peer {
    pub id: ParticipantId,
    pub capture: Arc<FakeCapture>,
    pub transports: Arc<FakeFactory>,
    pub observer: Arc<EventObserver>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub service: CallService,
}

impl Peer {
    pub fn new(name: &str, relay: &MemoryRelay, config: SessionConfig) -> Self {
        Self::with_parts(
            name,
            relay,
            config,
            FakeCapture::new(),
            FakeFactory::new(name),
        )
    }

    pub fn with_parts(
        name: &str,
        relay: &MemoryRelay,
        config: SessionConfig,
        capture: FakeCapture,
        transports: FakeFactory,
    ) -> Self {
        init_tracing();
        let capture = Arc::new(capture);
        let transports = Arc::new(transports);
        let service = CallService::builder()
            .with_config(config)
            .with_relay(Arc::new(relay.clone()))
            .with_capture(capture.clone())
            .with_transports(transports.clone())
            .build()
            .expect("valid service");
        let observer = Arc::new(EventObserver::new(1024));
        let events = observer.subscribe();
        Self {
            id: ParticipantId::new(name),
            capture,
            transports,
            observer,
            events,
            service,
        }
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        self.transports.last()
    }

    pub async fn initiate(&self, remote: &Peer, call_id: &CallId) -> Result<CallHandle, ServiceError> {
        self.service
            .initiate_call(
                self.id.clone(),
                remote.id.clone(),
                call_id.clone(),
                self.observer.clone(),
            )
            .await
    }

    pub async fn accept(&self, remote: &Peer, call_id: &CallId) -> Result<CallHandle, ServiceError> {
        self.service
            .accept_call(
                self.id.clone(),
                remote.id.clone(),
                call_id.clone(),
                self.observer.clone(),
            )
            .await
    }

    /// Start a session against a remote that is only a name
    pub async fn start(&self, params: SessionParams) -> Result<CallHandle, ServiceError> {
        self.service.start_session(params, self.observer.clone()).await
    }
}

/// A remote participant driven by hand through the relay
pub struct Puppet {
    pub id: ParticipantId,
    peer: ParticipantId,
    relay: MemoryRelay,
    room: String,
    subscription: Option<RelaySubscription>,
}

impl Puppet {
    pub async fn join(relay: &MemoryRelay, name: &str, peer: &ParticipantId, call_id: &CallId) -> Self {
        let id = ParticipantId::new(name);
        let room = room_name(call_id);
        let subscription = relay.join(&room, &id).await.expect("join");
        Self {
            id,
            peer: peer.clone(),
            relay: relay.clone(),
            room,
            subscription: Some(subscription),
        }
    }

    /// Broadcast `message` as if it came from this participant
    pub async fn send(&self, message: SignalMessage) {
        let envelope = message.into_envelope(self.id.clone(), self.peer.clone());
        let payload = serde_json::to_value(&envelope).expect("encode");
        self.relay
            .broadcast(&self.room, SIGNAL_EVENT, payload)
            .await
            .expect("broadcast");
    }

    /// Signals addressed to this participant since the last call
    pub fn received(&mut self) -> Vec<SignalMessage> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        while let Ok(event) = subscription.events.try_recv() {
            let RelayEvent::Broadcast { payload, .. } = event else {
                continue;
            };
            let envelope: SignalEnvelope = serde_json::from_value(payload).expect("decode");
            if envelope.from == self.peer && envelope.to == self.id {
                messages.push(SignalMessage::from_envelope(envelope).expect("valid signal"));
            }
        }
        messages
    }

    pub async fn leave(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.relay.leave(subscription.id).await.expect("leave");
        }
    }
}

// ----- helpers -----

/// Route session logs to the test harness; `RUST_LOG=sightline_core=debug` shows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> SessionConfig {
    SessionConfig::default()
}

/// Let every runnable task make progress
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait (in virtual time) for the first event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("observer dropped"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

pub async fn wait_connected(events: &mut broadcast::Receiver<SessionEvent>) {
    wait_for(events, |e| {
        matches!(e, SessionEvent::ConnectionState(ConnectionHealth::Connected))
    })
    .await;
}

/// Events already emitted
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return out,
        }
    }
}

pub fn call_ended_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::CallEnded))
        .count()
}

pub fn errors(events: &[SessionEvent]) -> Vec<sightline_core::SessionError> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

/// Initiator and responder in one room, connected
pub struct ConnectedCall {
    pub relay: MemoryRelay,
    pub call_id: CallId,
    pub initiator: Peer,
    pub responder: Peer,
    pub initiator_call: CallHandle,
    pub responder_call: CallHandle,
}

impl ConnectedCall {
    pub async fn establish(config: SessionConfig) -> Self {
        let relay = MemoryRelay::new();
        let call_id = CallId::from("call-1");
        let mut initiator = Peer::new("requester", &relay, config.clone());
        let mut responder = Peer::new("volunteer", &relay, config);

        let (initiator_call, responder_call) = tokio::join!(
            initiator.initiate(&responder, &call_id),
            responder.accept(&initiator, &call_id),
        );
        let initiator_call = initiator_call.expect("initiator starts");
        let responder_call = responder_call.expect("responder starts");

        wait_connected(&mut initiator.events).await;
        wait_connected(&mut responder.events).await;
        settle().await;

        Self {
            relay,
            call_id,
            initiator,
            responder,
            initiator_call,
            responder_call,
        }
    }
}
