//! Call session state machine
//!
//! One [`CallSession`] owns one peer-to-peer media session between exactly
//! two participants. `initialize` acquires local media, builds the peer
//! transport, joins the signaling room and spawns a session task. The task
//! is the single dispatch point for caller commands, signaling messages,
//! transport events and timers; callers talk to it through a
//! [`CallHandle`].

use crate::config::{ConfigError, SessionConfig};
use crate::identity::ParticipantId;
use crate::media::{
    CaptureError, LocalMedia, MediaCapture, MediaConstraints, RemoteStream, TrackKind,
};
use crate::negotiation::{AnswerDecision, Negotiator, OfferDecision};
use crate::observer::SessionObserver;
use crate::signaling::{ChannelError, ChannelEvent, SignalChannel, SignalMessage, SignalRelay};
use crate::transport::{
    OfferOptions, PeerTransport, TransportError, TransportEvent, TransportFactory,
};
use crate::types::{
    CallId, CallRole, ConnectionHealth, IceCandidate, NegotiationState, SessionDescription,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Insecure context or no capture API
    #[error("Environment not supported: {0}")]
    Environment(String),

    /// Local media could not be captured
    #[error("Media capture failed: {0}")]
    Capture(#[from] CaptureError),

    /// Signaling failure
    #[error("Signaling failed: {0}")]
    Channel(#[from] ChannelError),

    /// Peer transport failure
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// More participants in the room than a call allows
    #[error("Call is full: {member_count} members in room")]
    CallFull {
        /// Members seen in the room
        member_count: usize,
    },

    /// Retry budget spent
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Invalid session configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Session already ended
    #[error("Session closed")]
    Closed,
}

/// Who is calling whom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// This participant
    pub local: ParticipantId,
    /// The other participant
    pub remote: ParticipantId,
    /// Call identifier, names the signaling room
    pub call_id: CallId,
    /// Initiator offers, responder answers
    pub role: CallRole,
    /// Capture and send a camera track
    pub wants_local_video: bool,
}

impl SessionParams {
    /// Initiator side; sends video
    pub fn initiator(local: ParticipantId, remote: ParticipantId, call_id: CallId) -> Self {
        Self {
            local,
            remote,
            call_id,
            role: CallRole::Initiator,
            wants_local_video: true,
        }
    }

    /// Responder side; receives video but sends audio only
    pub fn responder(local: ParticipantId, remote: ParticipantId, call_id: CallId) -> Self {
        Self {
            local,
            remote,
            call_id,
            role: CallRole::Responder,
            wants_local_video: false,
        }
    }

    /// Override whether a camera track is sent
    #[must_use]
    pub fn with_local_video(mut self, wants_local_video: bool) -> Self {
        self.wants_local_video = wants_local_video;
        self
    }
}

/// Collaborators a session is built from
#[derive(Clone)]
pub struct SessionContext {
    /// Timing and ICE configuration
    pub config: SessionConfig,
    /// Signaling relay
    pub relay: Arc<dyn SignalRelay>,
    /// Capture devices
    pub capture: Arc<dyn MediaCapture>,
    /// Peer transport factory
    pub transports: Arc<dyn TransportFactory>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Session role
    pub role: CallRole,
    /// Negotiation progress
    pub negotiation: NegotiationState,
    /// Last reported connection health
    pub connection: ConnectionHealth,
    /// Reconnection attempts made
    pub reconnect_attempts: u32,
    /// Remote tracks received
    pub remote_tracks: usize,
    /// Call-ended notification fired
    pub call_ended: bool,
    /// Session created
    pub created_at: DateTime<Utc>,
    /// First time the transport reported `connected`
    pub connected_at: Option<DateTime<Utc>>,
}

enum Command {
    ToggleMute(oneshot::Sender<bool>),
    ToggleVideo(oneshot::Sender<bool>),
    SwitchCamera(oneshot::Sender<()>),
    EndCall(oneshot::Sender<()>),
}

/// Handle to a running session
///
/// Cloning shares the session. Dropping every handle ends the call.
#[derive(Clone)]
pub struct CallHandle {
    call_id: CallId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl CallHandle {
    /// Call identifier
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Flip the microphone; returns whether audio is now enabled
    ///
    /// Returns `false` when there is no local audio or the session ended.
    pub async fn toggle_mute(&self) -> bool {
        self.request(Command::ToggleMute).await.unwrap_or(false)
    }

    /// Flip the camera; returns whether video is now enabled
    ///
    /// Returns `false` when there is no local video or the session ended.
    pub async fn toggle_video(&self) -> bool {
        self.request(Command::ToggleVideo).await.unwrap_or(false)
    }

    /// Switch between front and rear camera
    ///
    /// Failures are reported through the observer.
    pub async fn switch_camera(&self) {
        let _ = self.request(Command::SwitchCamera).await;
    }

    /// End the call; safe to call any number of times
    pub async fn end_call(&self) {
        let _ = self.request(Command::EndCall).await;
    }

    /// Current session state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the session task has finished
    pub async fn closed(&self) {
        let mut rx = self.snapshot.clone();
        while rx.changed().await.is_ok() {}
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Two-party call session
pub struct CallSession;

impl CallSession {
    /// Start a session
    ///
    /// Initiators return once their first offer has been sent (after the
    /// ready handshake or its timeout); responders return once they have
    /// joined the room and announced `ready`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Environment`], [`SessionError::Capture`],
    /// [`SessionError::Transport`] or [`SessionError::Channel`] if setup
    /// fails. The error is reported to `observer` as well.
    #[tracing::instrument(skip_all, fields(call_id = %params.call_id, role = %params.role))]
    pub async fn initialize(
        context: &SessionContext,
        params: SessionParams,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<CallHandle, SessionError> {
        let config = context.config.clone();
        if let Err(e) = config.validate() {
            return Err(fail_init(&*observer, e.into()));
        }

        let environment = context.capture.environment();
        if !environment.secure_context {
            let err = SessionError::Environment("media capture requires a secure context".into());
            return Err(fail_init(&*observer, err));
        }
        if !environment.capture_available {
            let err = SessionError::Environment("no media capture API available".into());
            return Err(fail_init(&*observer, err));
        }

        let local_media = match context
            .capture
            .capture(MediaConstraints::call(params.wants_local_video))
            .await
        {
            Ok(media) => media,
            Err(e) => return Err(fail_init(&*observer, e.into())),
        };
        tracing::debug!(tracks = local_media.tracks().len(), "Local media acquired");

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = match context
            .transports
            .create(&config.ice_servers, transport_tx)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                local_media.stop();
                return Err(fail_init(&*observer, e.into()));
            }
        };

        if let Err(e) = attach_media(&*transport, &local_media, params.wants_local_video).await {
            local_media.stop();
            transport.close().await;
            return Err(fail_init(&*observer, e.into()));
        }

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let channel = match SignalChannel::open(
            Arc::clone(&context.relay),
            &params.call_id,
            params.local.clone(),
            params.remote.clone(),
            channel_tx,
            config.channel.clone(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                local_media.stop();
                transport.close().await;
                return Err(fail_init(&*observer, e.into()));
            }
        };

        let created_at = Utc::now();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            call_id: params.call_id.clone(),
            role: params.role,
            negotiation: NegotiationState::Idle,
            connection: ConnectionHealth::New,
            reconnect_attempts: 0,
            remote_tracks: 0,
            call_ended: false,
            created_at,
            connected_at: None,
        });
        let (command_tx, command_rx) = mpsc::channel(32);
        let (offer_tx, offer_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();

        let mut actor = SessionActor {
            negotiator: Negotiator::new(params.role),
            params,
            config,
            observer,
            transport: Some(transport),
            channel: Some(channel),
            local_media,
            remote_stream: RemoteStream::new(),
            health: ConnectionHealth::New,
            reconnect_attempts: 0,
            room_members: 0,
            call_ended: false,
            torn_down: false,
            timers: Timers::default(),
            offer_task: None,
            offer_generation: 0,
            offer_tx,
            last_offer: None,
            local_candidates: Vec::new(),
            start_tx: None,
            snapshot_tx,
            created_at,
            connected_at: None,
        };

        let handle = CallHandle {
            call_id: actor.params.call_id.clone(),
            commands: command_tx,
            snapshot: snapshot_rx,
        };

        let role = actor.params.role;
        if role.is_initiator() {
            actor.start_tx = Some(start_tx);
            actor.timers.ready = Some(Instant::now() + actor.config.ready_timeout());
            tracing::debug!("Waiting for ready from responder");
        } else {
            actor.signal(SignalMessage::Ready).await;
        }
        tracing::info!("Session initialized");

        let span = tracing::info_span!(
            "call_session",
            call_id = %actor.params.call_id,
            role = %role
        );
        tokio::spawn(
            actor
                .run(command_rx, channel_rx, transport_rx, offer_rx)
                .instrument(span),
        );

        if role.is_initiator() {
            match start_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(SessionError::Closed),
            }
        }

        Ok(handle)
    }
}

fn fail_init(observer: &dyn SessionObserver, err: SessionError) -> SessionError {
    tracing::error!(error = %err, "Session initialization failed");
    observer.on_error(&err);
    err
}

async fn attach_media(
    transport: &dyn PeerTransport,
    media: &LocalMedia,
    sends_video: bool,
) -> Result<(), TransportError> {
    // The receive-only leg must exist before any track so the offer
    // carries a video media line
    if !sends_video {
        transport.add_receive_only(TrackKind::Video).await?;
    }
    for track in media.tracks() {
        transport.add_track(track).await?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Timers {
    ready: Option<Instant>,
    pending_answer: Option<Instant>,
    reconnect: Option<Instant>,
    capacity: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [self.ready, self.pending_answer, self.reconnect, self.capacity]
            .into_iter()
            .flatten()
            .min()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

fn take_expired(slot: &mut Option<Instant>, now: Instant) -> bool {
    match slot {
        Some(deadline) if *deadline <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}

struct OfferOutcome {
    generation: u64,
    restart: bool,
    result: Result<SessionDescription, TransportError>,
}

struct SessionActor {
    params: SessionParams,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    transport: Option<Arc<dyn PeerTransport>>,
    channel: Option<SignalChannel>,
    local_media: LocalMedia,
    remote_stream: RemoteStream,
    negotiator: Negotiator,
    health: ConnectionHealth,
    reconnect_attempts: u32,
    room_members: usize,
    call_ended: bool,
    torn_down: bool,
    timers: Timers,
    offer_task: Option<JoinHandle<()>>,
    offer_generation: u64,
    offer_tx: mpsc::UnboundedSender<OfferOutcome>,
    last_offer: Option<SignalMessage>,
    local_candidates: Vec<IceCandidate>,
    start_tx: Option<oneshot::Sender<Result<(), SessionError>>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut offers: mpsc::UnboundedReceiver<OfferOutcome>,
    ) {
        while !self.torn_down {
            let next_deadline = self.timers.next();
            let timer = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::info!("All call handles dropped, ending call");
                        self.teardown(true).await;
                    }
                },
                Some(event) = channel_events.recv() => self.handle_channel_event(event).await,
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                Some(outcome) = offers.recv() => self.handle_offer_outcome(outcome).await,
                () = timer, if next_deadline.is_some() => self.handle_timers().await,
            }

            self.publish_snapshot();
        }
        tracing::debug!("Session task finished");
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.params.call_id.clone(),
            role: self.params.role,
            negotiation: self.negotiator.state(),
            connection: self.health,
            reconnect_attempts: self.reconnect_attempts,
            remote_tracks: self.remote_stream.len(),
            call_ended: self.call_ended,
            created_at: self.created_at,
            connected_at: self.connected_at,
        }
    }

    fn publish_snapshot(&self) {
        let current = self.snapshot();
        self.snapshot_tx.send_if_modified(|s| {
            if *s == current {
                false
            } else {
                *s = current;
                true
            }
        });
    }

    fn report_error(&self, err: &SessionError) {
        tracing::error!(error = %err, "Session error");
        self.observer.on_error(err);
    }

    fn fire_call_ended(&mut self) {
        if self.call_ended {
            return;
        }
        self.call_ended = true;
        tracing::info!("Call ended");
        self.observer.on_call_ended();
    }

    async fn signal(&self, message: SignalMessage) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(e) = channel.send(message).await {
            self.report_error(&e.into());
        }
    }

    // ----- commands -----

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleMute(reply) => {
                let enabled = self.local_media.audio.as_ref().is_some_and(|track| {
                    let enabled = !track.enabled();
                    track.set_enabled(enabled);
                    enabled
                });
                tracing::debug!(audio_enabled = enabled, "Toggled mute");
                let _ = reply.send(enabled);
            }
            Command::ToggleVideo(reply) => {
                let enabled = self.local_media.video.as_ref().is_some_and(|track| {
                    let enabled = !track.enabled();
                    track.set_enabled(enabled);
                    enabled
                });
                tracing::debug!(video_enabled = enabled, "Toggled video");
                let _ = reply.send(enabled);
            }
            Command::SwitchCamera(reply) => {
                self.switch_camera().await;
                let _ = reply.send(());
            }
            Command::EndCall(reply) => {
                self.teardown(true).await;
                let _ = reply.send(());
            }
        }
    }

    async fn switch_camera(&self) {
        let Some(video) = &self.local_media.video else {
            self.report_error(&CaptureError::Unsupported("no local video track".into()).into());
            return;
        };
        let target = video.facing_mode().unwrap_or_default().toggled();
        match video.apply_facing_mode(target).await {
            Ok(()) => tracing::info!(facing_mode = ?target, "Switched camera"),
            Err(e) => self.report_error(&e.into()),
        }
    }

    // ----- signaling -----

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.handle_message(message).await,
            ChannelEvent::Subscribed { member_count } => {
                self.check_capacity(member_count).await;
            }
            ChannelEvent::MemberJoined {
                participant,
                member_count,
            } => {
                self.check_capacity(member_count).await;
                if self.torn_down {
                    return;
                }
                if participant == self.params.remote
                    && !self.params.role.is_initiator()
                    && self.negotiator.state() == NegotiationState::Idle
                {
                    tracing::debug!("Remote joined while idle, re-sending ready");
                    self.signal(SignalMessage::Ready).await;
                }
            }
            ChannelEvent::MemberLeft {
                participant,
                member_count,
            } => {
                self.check_capacity(member_count).await;
                if participant == self.params.remote {
                    self.handle_member_left().await;
                }
            }
            ChannelEvent::Error(e) => {
                let lost = matches!(
                    e,
                    ChannelError::SubscriptionLost(_) | ChannelError::JoinRejected { .. }
                );
                self.report_error(&e.into());
                if lost {
                    // No signaling path left to hang up on
                    self.teardown(false).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Offer {
                description,
                restart,
            } => self.handle_offer(description, restart).await,
            SignalMessage::Answer(description) => self.handle_answer(description).await,
            SignalMessage::IceCandidate(candidate) => self.handle_candidate(candidate).await,
            SignalMessage::Ready => self.handle_ready().await,
            SignalMessage::Hangup => {
                tracing::info!("Remote hung up");
                self.fire_call_ended();
                self.teardown(false).await;
            }
        }
    }

    async fn handle_ready(&mut self) {
        if !self.params.role.is_initiator() {
            return;
        }
        if self.timers.ready.take().is_some() {
            tracing::debug!("Responder ready, creating offer");
            self.start_offer(false);
            return;
        }
        // Responder showed up after an offer went into an empty room
        if self.negotiator.state() == NegotiationState::OfferSent
            && !self.negotiator.remote_description_set()
        {
            if let Some(offer) = self.last_offer.clone() {
                tracing::debug!(
                    candidates = self.local_candidates.len(),
                    "Responder ready after offer, re-sending it"
                );
                self.signal(offer).await;
                for candidate in self.local_candidates.clone() {
                    self.signal(SignalMessage::IceCandidate(candidate)).await;
                }
            }
        }
    }

    async fn handle_offer(&mut self, description: SessionDescription, restart: bool) {
        let Some(transport) = self.transport.clone() else {
            tracing::debug!("Offer after transport closed, ignoring");
            return;
        };

        let decision =
            self.negotiator
                .accept_offer(&description, restart, transport.signaling_state());
        if decision != OfferDecision::Accept {
            tracing::debug!(?decision, "Ignoring offer");
            return;
        }

        match self.answer_offer(&*transport, description).await {
            Ok(answer) => {
                self.negotiator.answer_sent();
                self.signal(SignalMessage::Answer(answer)).await;
                tracing::info!(restart, "Answer sent");
            }
            Err(e) => {
                self.negotiator.answer_failed();
                self.report_error(&e.into());
            }
        }
    }

    async fn answer_offer(
        &mut self,
        transport: &dyn PeerTransport,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        transport.set_remote_description(offer).await?;
        let queued = self.negotiator.remote_description_applied();
        apply_candidates(transport, queued).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        let Some(transport) = self.transport.clone() else {
            tracing::debug!("Answer after transport closed, ignoring");
            return;
        };

        match self.negotiator.accept_answer(
            &answer,
            transport.signaling_state(),
            transport.connection_state(),
        ) {
            AnswerDecision::Apply => self.apply_answer(&*transport, answer).await,
            AnswerDecision::Buffered => {
                tracing::debug!("Answer arrived before offer completed, holding it");
                self.timers.pending_answer =
                    Some(Instant::now() + self.config.pending_answer_timeout());
            }
            decision => tracing::debug!(?decision, "Ignoring answer"),
        }
    }

    async fn apply_answer(&mut self, transport: &dyn PeerTransport, answer: SessionDescription) {
        match transport.set_remote_description(answer).await {
            Ok(()) => {
                let queued = self.negotiator.remote_description_applied();
                apply_candidates(transport, queued).await;
                tracing::info!("Answer applied");
            }
            Err(e) => {
                self.negotiator.answer_rejected();
                self.report_error(&e.into());
            }
        }
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        match self.negotiator.admit_candidate(candidate) {
            Some(candidate) => apply_candidates(&*transport, vec![candidate]).await,
            None => tracing::trace!(
                queued = self.negotiator.queued_candidates(),
                "Queued ICE candidate"
            ),
        }
    }

    /// Kick off offer creation in the background so incoming messages keep
    /// flowing while the transport works
    fn start_offer(&mut self, restart: bool) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if !self.negotiator.begin_offer(restart) {
            tracing::debug!(restart, "Offer already created, not offering again");
            return;
        }

        self.local_candidates.clear();
        self.offer_generation += 1;
        let generation = self.offer_generation;
        let results = self.offer_tx.clone();
        self.offer_task = Some(tokio::spawn(async move {
            let result = async {
                let offer = transport
                    .create_offer(OfferOptions {
                        ice_restart: restart,
                    })
                    .await?;
                transport.set_local_description(offer.clone()).await?;
                Ok::<_, TransportError>(offer)
            }
            .await;
            let _ = results.send(OfferOutcome {
                generation,
                restart,
                result,
            });
        }));
    }

    async fn handle_offer_outcome(&mut self, outcome: OfferOutcome) {
        if outcome.generation != self.offer_generation || self.transport.is_none() {
            tracing::debug!("Discarding stale offer");
            return;
        }
        self.offer_task = None;

        match outcome.result {
            Ok(offer) => {
                let message = SignalMessage::Offer {
                    description: offer,
                    restart: outcome.restart,
                };
                self.last_offer = Some(message.clone());
                self.signal(message).await;
                tracing::info!(restart = outcome.restart, "Offer sent");

                if let Some(start) = self.start_tx.take() {
                    let _ = start.send(Ok(()));
                }

                if let Some(answer) = self.negotiator.offer_sent() {
                    self.timers.pending_answer = None;
                    if let Some(transport) = self.transport.clone() {
                        self.apply_answer(&*transport, answer).await;
                    }
                }
            }
            Err(e) => {
                self.negotiator.offer_failed();
                self.timers.pending_answer = None;
                let err = SessionError::from(e);
                self.report_error(&err);
                if let Some(start) = self.start_tx.take() {
                    let _ = start.send(Err(err));
                    self.teardown(true).await;
                }
            }
        }
    }

    async fn check_capacity(&mut self, member_count: usize) {
        self.room_members = member_count;
        let max = self.config.capacity.max_members;

        if member_count <= max {
            if self.timers.capacity.take().is_some() {
                tracing::debug!(member_count, "Room back within capacity");
            }
            return;
        }

        let grace = self.config.capacity.grace();
        if grace.is_zero() {
            self.call_full().await;
        } else if self.timers.capacity.is_none() {
            tracing::warn!(member_count, max, "Room over capacity, waiting for it to settle");
            self.timers.capacity = Some(Instant::now() + grace);
        }
    }

    async fn call_full(&mut self) {
        self.report_error(&SessionError::CallFull {
            member_count: self.room_members,
        });
        self.teardown(true).await;
    }

    async fn handle_member_left(&mut self) {
        tracing::info!(remote = %self.params.remote, "Remote participant left the room");
        self.fire_call_ended();

        if !self.remote_stream.is_empty() {
            self.remote_stream.stop_all();
            self.observer.on_remote_stream(None);
        }
        if let Some(task) = self.offer_task.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.timers.ready = None;
        self.timers.pending_answer = None;
        self.timers.reconnect = None;
        self.last_offer = None;
        self.local_candidates.clear();
        self.negotiator.reset();

        // No offer will follow; initialize must not keep waiting for one
        if let Some(start) = self.start_tx.take() {
            let _ = start.send(Ok(()));
        }
    }

    // ----- transport -----

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.transport.is_none() {
            tracing::trace!("Transport event after close, ignoring");
            return;
        }
        match event {
            TransportEvent::RemoteTrack(track) => {
                let kind = track.kind();
                if self.remote_stream.add_track(track) {
                    tracing::info!(%kind, "Remote track received");
                    self.observer.on_remote_stream(Some(&self.remote_stream));
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                self.signal(SignalMessage::IceCandidate(candidate)).await;
            }
            TransportEvent::ConnectionState(health) | TransportEvent::IceConnectionState(health) => {
                self.handle_health(health).await;
            }
        }
    }

    async fn handle_health(&mut self, health: ConnectionHealth) {
        self.health = health;
        self.observer.on_connection_state(health);

        match health {
            ConnectionHealth::Connected => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(Utc::now());
                    tracing::info!("Connected");
                }
                if self.timers.reconnect.take().is_some() {
                    tracing::info!("Recovered before reconnection attempt");
                }
                if self.config.reconnect.reset_on_connected {
                    self.reconnect_attempts = 0;
                }
            }
            ConnectionHealth::Failed => self.schedule_reconnect().await,
            ConnectionHealth::Disconnected | ConnectionHealth::Closed => self.fire_call_ended(),
            ConnectionHealth::New | ConnectionHealth::Connecting => {}
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.timers.reconnect.is_some() {
            tracing::debug!("Reconnection already scheduled");
            return;
        }

        let policy = &self.config.reconnect;
        if self.reconnect_attempts >= policy.max_attempts {
            let err = SessionError::ReconnectionExhausted {
                attempts: self.reconnect_attempts,
            };
            self.report_error(&err);
            self.teardown(true).await;
            return;
        }

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;
        let delay = policy.delay_for(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnection scheduled");
        self.observer.on_reconnecting(attempt);
        self.timers.reconnect = Some(Instant::now() + delay);
    }

    // ----- timers -----

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if take_expired(&mut self.timers.ready, now) {
            tracing::warn!("No ready from responder, offering anyway");
            self.start_offer(false);
        }

        if take_expired(&mut self.timers.pending_answer, now)
            && self.negotiator.expire_pending_answer()
        {
            tracing::warn!("Offer never completed, dropping held answer");
        }

        if take_expired(&mut self.timers.reconnect, now) {
            if self.params.role.is_initiator() {
                tracing::info!(attempt = self.reconnect_attempts, "Restarting ICE");
                self.start_offer(true);
            } else {
                tracing::debug!("Waiting for the initiator's restart offer");
            }
        }

        if take_expired(&mut self.timers.capacity, now)
            && self.room_members > self.config.capacity.max_members
        {
            self.call_full().await;
        }
    }

    // ----- teardown -----

    async fn teardown(&mut self, send_hangup: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if send_hangup {
            self.signal(SignalMessage::Hangup).await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(task) = self.offer_task.take() {
            task.abort();
        }

        self.local_media.stop();
        self.local_media = LocalMedia::default();
        self.remote_stream.stop_all();

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        self.timers.clear();
        self.negotiator.reset();
        self.last_offer = None;
        self.local_candidates.clear();
        self.reconnect_attempts = 0;
        self.health = ConnectionHealth::Closed;
        self.fire_call_ended();

        if let Some(start) = self.start_tx.take() {
            let _ = start.send(Ok(()));
        }
        tracing::info!("Session torn down");
    }
}

async fn apply_candidates(transport: &dyn PeerTransport, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply ICE candidate");
        }
    }
}
