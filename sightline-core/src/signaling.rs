//! Call signaling channel
//!
//! Offer/answer/ICE messages travel over an external publish/subscribe relay
//! before any direct connection exists. The relay only knows rooms and
//! broadcasts; [`SignalChannel`] narrows one room down to the two
//! participants of a call.

use crate::config::ChannelConfig;
use crate::identity::ParticipantId;
use crate::types::{CallId, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// Prefix of every call room name
pub const ROOM_PREFIX: &str = "webrtc";

/// Relay event name carrying signaling envelopes
pub const SIGNAL_EVENT: &str = "signal";

/// Room name for a call
pub fn room_name(call_id: &CallId) -> String {
    format!("{ROOM_PREFIX}:{call_id}")
}

/// Errors reported by a relay implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Join or broadcast refused
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Relay unreachable
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Subscription id not known to the relay
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),
}

/// Signal channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Relay refused the join
    #[error("Join rejected for room {room}: {reason}")]
    JoinRejected {
        /// Room name
        room: String,
        /// Relay-provided reason
        reason: String,
    },

    /// Relay never confirmed the subscription
    #[error("Subscription to room {0} was not confirmed in time")]
    SubscribeTimeout(String),

    /// Broadcast failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Relay dropped an established subscription
    #[error("Subscription to room {0} was lost")]
    SubscriptionLost(String),

    /// Envelope could not be encoded or decoded
    #[error("Malformed signaling message: {0}")]
    Malformed(String),
}

/// Relay subscription handle id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random subscription id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events a relay delivers to one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Join handshake completed
    Subscribed {
        /// Members in the room, including this one
        member_count: usize,
    },
    /// Broadcast from a room member
    Broadcast {
        /// Event name
        event: String,
        /// JSON payload
        payload: serde_json::Value,
    },
    /// Another member joined
    MemberJoined {
        /// Who joined
        member: ParticipantId,
        /// Members in the room now
        member_count: usize,
    },
    /// A member left or dropped
    MemberLeft {
        /// Who left
        member: ParticipantId,
        /// Members in the room now
        member_count: usize,
    },
    /// Relay refused or revoked the subscription
    Rejected {
        /// Relay-provided reason
        reason: String,
    },
    /// Relay closed the subscription
    Closed,
}

/// Live relay subscription
#[derive(Debug)]
pub struct RelaySubscription {
    /// Id used to leave the room
    pub id: SubscriptionId,
    /// Event stream for this member
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Publish/subscribe relay used for signaling
///
/// Implement this for the realtime backend in use (hosted channels,
/// websocket fan-out, ...). [`crate::relay::MemoryRelay`] is the
/// in-process implementation.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Join `room` as `member`
    ///
    /// The join handshake completes asynchronously: the relay delivers
    /// [`RelayEvent::Subscribed`] (or [`RelayEvent::Rejected`]) on the
    /// returned subscription.
    async fn join(
        &self,
        room: &str,
        member: &ParticipantId,
    ) -> Result<RelaySubscription, RelayError>;

    /// Broadcast a payload to every member of `room`
    async fn broadcast(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError>;

    /// Leave the room joined with `subscription`
    async fn leave(&self, subscription: SubscriptionId) -> Result<(), RelayError>;
}

/// Signaling message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// ICE candidate
    IceCandidate,
    /// Responder is listening
    Ready,
    /// Call ended by the sender
    Hangup,
}

/// Envelope payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalData {
    /// Offer or answer
    Description(SessionDescription),
    /// ICE candidate
    Candidate(IceCandidate),
}

/// Wire format of one signaling broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Message type
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Sender
    pub from: ParticipantId,
    /// Addressee
    pub to: ParticipantId,
    /// Description or candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SignalData>,
    /// Offer renegotiates an established session
    #[serde(default, skip_serializing_if = "is_false")]
    pub restart: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl SignalEnvelope {
    /// Check whether this envelope travels between `a` and `b`, either way
    pub fn connects(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        (self.from == *a && self.to == *b) || (self.from == *b && self.to == *a)
    }
}

/// Typed signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// SDP offer
    Offer {
        /// Offer description
        description: SessionDescription,
        /// Renegotiation of an established session
        restart: bool,
    },
    /// SDP answer
    Answer(SessionDescription),
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
    /// Responder is listening for an offer
    Ready,
    /// Sender ended the call
    Hangup,
}

impl SignalMessage {
    /// Message type tag
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::Ready => SignalKind::Ready,
            Self::Hangup => SignalKind::Hangup,
        }
    }

    /// Wrap into a wire envelope
    pub fn into_envelope(self, from: ParticipantId, to: ParticipantId) -> SignalEnvelope {
        let kind = self.kind();
        let (data, restart) = match self {
            Self::Offer {
                description,
                restart,
            } => (Some(SignalData::Description(description)), restart),
            Self::Answer(description) => (Some(SignalData::Description(description)), false),
            Self::IceCandidate(candidate) => (Some(SignalData::Candidate(candidate)), false),
            Self::Ready | Self::Hangup => (None, false),
        };
        SignalEnvelope {
            kind,
            from,
            to,
            data,
            restart,
        }
    }

    /// Unwrap a wire envelope
    ///
    /// # Errors
    ///
    /// Returns error if the payload does not fit the message type
    pub fn from_envelope(envelope: SignalEnvelope) -> Result<Self, ChannelError> {
        match (envelope.kind, envelope.data) {
            (SignalKind::Offer, Some(SignalData::Description(d))) if d.kind == SdpType::Offer => {
                Ok(Self::Offer {
                    description: d,
                    restart: envelope.restart,
                })
            }
            (SignalKind::Answer, Some(SignalData::Description(d)))
                if d.kind == SdpType::Answer =>
            {
                Ok(Self::Answer(d))
            }
            (SignalKind::IceCandidate, Some(SignalData::Candidate(c))) => Ok(Self::IceCandidate(c)),
            (SignalKind::Ready, _) => Ok(Self::Ready),
            (SignalKind::Hangup, _) => Ok(Self::Hangup),
            (kind, data) => Err(ChannelError::Malformed(format!(
                "{kind:?} message with payload {data:?}"
            ))),
        }
    }
}

/// Events a [`SignalChannel`] forwards to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Message from the remote participant
    Message(SignalMessage),
    /// Subscription confirmed
    Subscribed {
        /// Members in the room, including us
        member_count: usize,
    },
    /// Someone joined the room
    MemberJoined {
        /// Who joined
        participant: ParticipantId,
        /// Members in the room now
        member_count: usize,
    },
    /// Someone left the room
    MemberLeft {
        /// Who left
        participant: ParticipantId,
        /// Members in the room now
        member_count: usize,
    },
    /// Channel-level failure
    Error(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubscribeState {
    Pending,
    Subscribed,
    Rejected(String),
    Closed,
}

/// Signaling channel between the two participants of one call
pub struct SignalChannel {
    relay: Arc<dyn SignalRelay>,
    room: String,
    local: ParticipantId,
    remote: ParticipantId,
    config: ChannelConfig,
    state: Arc<watch::Sender<SubscribeState>>,
    subscription: Mutex<Option<SubscriptionId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalChannel {
    /// Join the call room and start forwarding events to `events`
    ///
    /// Resolves once the relay confirms the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::JoinRejected`] if the relay refuses the join
    /// and [`ChannelError::SubscribeTimeout`] if it never confirms. The same
    /// error is also delivered on `events`.
    #[tracing::instrument(skip(relay, events, config), fields(call_id = %call_id, local = %local))]
    pub async fn open(
        relay: Arc<dyn SignalRelay>,
        call_id: &CallId,
        local: ParticipantId,
        remote: ParticipantId,
        events: mpsc::UnboundedSender<ChannelEvent>,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let room = room_name(call_id);

        let subscription = match relay.join(&room, &local).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = ChannelError::JoinRejected {
                    room,
                    reason: e.to_string(),
                };
                tracing::error!(error = %err, "Failed to join signaling room");
                let _ = events.send(ChannelEvent::Error(err.clone()));
                return Err(err);
            }
        };

        let (state_tx, _) = watch::channel(SubscribeState::Pending);
        let state = Arc::new(state_tx);
        let pump = tokio::spawn(pump_relay_events(
            subscription.events,
            Arc::clone(&state),
            room.clone(),
            local.clone(),
            remote.clone(),
            events.clone(),
        ));

        let channel = Self {
            relay,
            room,
            local,
            remote,
            config,
            state,
            subscription: Mutex::new(Some(subscription.id)),
            pump: Mutex::new(Some(pump)),
        };

        let mut rx = channel.state.subscribe();
        let outcome = timeout(channel.config.subscribe_timeout(), async {
            rx.wait_for(|s| *s != SubscribeState::Pending)
                .await
                .map(|s| s.clone())
        })
        .await;

        let failure = match outcome {
            Ok(Ok(SubscribeState::Subscribed)) => None,
            Ok(Ok(SubscribeState::Rejected(reason))) => Some(ChannelError::JoinRejected {
                room: channel.room.clone(),
                reason,
            }),
            Ok(_) => Some(ChannelError::JoinRejected {
                room: channel.room.clone(),
                reason: "relay closed the subscription".to_string(),
            }),
            Err(_) => Some(ChannelError::SubscribeTimeout(channel.room.clone())),
        };

        if let Some(err) = failure {
            tracing::error!(error = %err, "Signaling room subscription failed");
            let _ = events.send(ChannelEvent::Error(err.clone()));
            channel.close().await;
            return Err(err);
        }

        tracing::info!(room = %channel.room, "Joined signaling room");
        Ok(channel)
    }

    /// Send a message to the remote participant
    ///
    /// Waits (bounded by `send_wait_ms`) for a pending subscription. Gives
    /// up silently if the subscription is never confirmed; a send on a
    /// closed channel is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the relay broadcast fails
    #[tracing::instrument(skip(self, message), fields(room = %self.room, kind = ?message.kind()))]
    pub async fn send(&self, message: SignalMessage) -> Result<(), ChannelError> {
        let mut rx = self.state.subscribe();
        let current = rx.borrow().clone();
        match current {
            SubscribeState::Subscribed => {}
            SubscribeState::Closed | SubscribeState::Rejected(_) => {
                tracing::debug!("Channel closed, dropping message");
                return Ok(());
            }
            SubscribeState::Pending => {
                let waited = timeout(self.config.send_wait(), async {
                    rx.wait_for(|s| *s != SubscribeState::Pending)
                        .await
                        .map(|s| s.clone())
                })
                .await;
                match waited {
                    Ok(Ok(SubscribeState::Subscribed)) => {}
                    Ok(_) => {
                        tracing::debug!("Channel closed while waiting, dropping message");
                        return Ok(());
                    }
                    Err(_) => {
                        tracing::warn!("Subscription not confirmed in time, dropping message");
                        return Ok(());
                    }
                }
            }
        }

        let envelope = message.into_envelope(self.local.clone(), self.remote.clone());
        let payload =
            serde_json::to_value(&envelope).map_err(|e| ChannelError::Malformed(e.to_string()))?;

        self.relay
            .broadcast(&self.room, SIGNAL_EVENT, payload)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        tracing::trace!("Signal sent");
        Ok(())
    }

    /// Leave the room; later sends become no-ops
    pub async fn close(&self) {
        let previous = self.state.send_replace(SubscribeState::Closed);

        let subscription = self.subscription.lock().take();
        if let Some(id) = subscription {
            if let Err(e) = self.relay.leave(id).await {
                tracing::warn!(room = %self.room, error = %e, "Failed to leave signaling room");
            }
        }

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        if previous != SubscribeState::Closed {
            tracing::info!(room = %self.room, "Left signaling room");
        }
    }

    /// Room name
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Check if the subscription is confirmed and not closed
    pub fn is_open(&self) -> bool {
        *self.state.borrow() == SubscribeState::Subscribed
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump_relay_events(
    mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    state: Arc<watch::Sender<SubscribeState>>,
    room: String,
    local: ParticipantId,
    remote: ParticipantId,
    sink: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(event) = relay_events.recv().await {
        let forward = match event {
            RelayEvent::Subscribed { member_count } => {
                state.send_if_modified(|s| {
                    if *s == SubscribeState::Pending {
                        *s = SubscribeState::Subscribed;
                        true
                    } else {
                        false
                    }
                });
                Some(ChannelEvent::Subscribed { member_count })
            }
            RelayEvent::Broadcast { event, payload } => {
                if event != SIGNAL_EVENT {
                    tracing::trace!(event = %event, "Ignoring non-signal broadcast");
                    continue;
                }
                match decode_signal(payload, &local, &remote) {
                    Ok(Some(message)) => Some(ChannelEvent::Message(message)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed signal");
                        None
                    }
                }
            }
            RelayEvent::MemberJoined {
                member,
                member_count,
            } => Some(ChannelEvent::MemberJoined {
                participant: member,
                member_count,
            }),
            RelayEvent::MemberLeft {
                member,
                member_count,
            } => Some(ChannelEvent::MemberLeft {
                participant: member,
                member_count,
            }),
            RelayEvent::Rejected { reason } => {
                let was_pending = *state.borrow() == SubscribeState::Pending;
                if was_pending {
                    // open() reports the rejection itself
                    state.send_replace(SubscribeState::Rejected(reason));
                    None
                } else {
                    state.send_replace(SubscribeState::Closed);
                    Some(ChannelEvent::Error(ChannelError::JoinRejected {
                        room: room.clone(),
                        reason,
                    }))
                }
            }
            RelayEvent::Closed => break,
        };

        if let Some(event) = forward {
            if sink.send(event).is_err() {
                return;
            }
        }
    }

    // Relay closed or dropped the subscription. A local close() has already
    // moved the state on, and open() reports a pending one itself.
    let previous = state.send_replace(SubscribeState::Closed);
    if previous == SubscribeState::Subscribed {
        tracing::error!(room = %room, "Relay dropped the signaling subscription");
        let _ = sink.send(ChannelEvent::Error(ChannelError::SubscriptionLost(room)));
    }
}

fn decode_signal(
    payload: serde_json::Value,
    local: &ParticipantId,
    remote: &ParticipantId,
) -> Result<Option<SignalMessage>, ChannelError> {
    let envelope: SignalEnvelope =
        serde_json::from_value(payload).map_err(|e| ChannelError::Malformed(e.to_string()))?;

    if !envelope.connects(local, remote) {
        return Ok(None);
    }
    // The relay echoes our own broadcasts back to us
    if envelope.from == *local {
        return Ok(None);
    }

    SignalMessage::from_envelope(envelope).map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    #[tokio::test]
    async fn test_revoked_subscription_names_the_room() {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (sink, mut events) = mpsc::unbounded_channel();
        let state = Arc::new(watch::channel(SubscribeState::Pending).0);
        let pump = tokio::spawn(pump_relay_events(
            relay_rx,
            Arc::clone(&state),
            "webrtc:c-9".to_string(),
            alice(),
            bob(),
            sink,
        ));

        relay_tx
            .send(RelayEvent::Subscribed { member_count: 2 })
            .unwrap();
        relay_tx
            .send(RelayEvent::Rejected {
                reason: "kicked".to_string(),
            })
            .unwrap();
        drop(relay_tx);
        pump.await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Subscribed { member_count: 2 })
        );
        let err = ChannelError::JoinRejected {
            room: "webrtc:c-9".to_string(),
            reason: "kicked".to_string(),
        };
        assert_eq!(err.to_string(), "Join rejected for room webrtc:c-9: kicked");
        assert_eq!(events.recv().await, Some(ChannelEvent::Error(err)));
        // Already closed by the rejection, so no second error
        assert_eq!(events.recv().await, None);
        assert_eq!(*state.borrow(), SubscribeState::Closed);
    }

    #[test]
    fn test_room_name_is_deterministic() {
        let call = CallId::from("c-1");
        assert_eq!(room_name(&call), "webrtc:c-1");
        assert_eq!(room_name(&call), room_name(&CallId::from("c-1")));
    }

    #[test]
    fn test_offer_envelope_wire_shape() {
        let message = SignalMessage::Offer {
            description: SessionDescription::offer("v=0"),
            restart: false,
        };
        let json = serde_json::to_value(message.into_envelope(alice(), bob())).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "offer",
                "from": "alice",
                "to": "bob",
                "data": {"type": "offer", "sdp": "v=0"}
            })
        );
    }

    #[test]
    fn test_restart_flag_only_serialized_when_set() {
        let message = SignalMessage::Offer {
            description: SessionDescription::offer("v=0"),
            restart: true,
        };
        let json = serde_json::to_value(message.into_envelope(alice(), bob())).unwrap();
        assert_eq!(json["restart"], true);

        let ready = serde_json::to_value(SignalMessage::Ready.into_envelope(alice(), bob())).unwrap();
        assert_eq!(ready, json!({"type": "ready", "from": "alice", "to": "bob"}));
    }

    #[test]
    fn test_candidate_envelope_decodes() {
        let payload = json!({
            "type": "ice-candidate",
            "from": "bob",
            "to": "alice",
            "data": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        });
        let message = decode_signal(payload, &alice(), &bob()).unwrap().unwrap();
        match message {
            SignalMessage::IceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_filters_other_pairs_and_self_echo() {
        let stranger = json!({"type": "ready", "from": "carol", "to": "alice"});
        assert_eq!(decode_signal(stranger, &alice(), &bob()).unwrap(), None);

        let echo = json!({"type": "ready", "from": "alice", "to": "bob"});
        assert_eq!(decode_signal(echo, &alice(), &bob()).unwrap(), None);

        let addressed = json!({"type": "hangup", "from": "bob", "to": "alice"});
        assert_eq!(
            decode_signal(addressed, &alice(), &bob()).unwrap(),
            Some(SignalMessage::Hangup)
        );
    }

    #[test]
    fn test_mismatched_payload_is_malformed() {
        let envelope = SignalEnvelope {
            kind: SignalKind::Answer,
            from: bob(),
            to: alice(),
            data: Some(SignalData::Description(SessionDescription::offer("v=0"))),
            restart: false,
        };
        assert!(matches!(
            SignalMessage::from_envelope(envelope),
            Err(ChannelError::Malformed(_))
        ));

        let missing = SignalEnvelope {
            kind: SignalKind::IceCandidate,
            from: bob(),
            to: alice(),
            data: None,
            restart: false,
        };
        assert!(SignalMessage::from_envelope(missing).is_err());
    }

    #[test]
    fn test_envelope_connects_both_directions() {
        let envelope = SignalMessage::Ready.into_envelope(alice(), bob());
        assert!(envelope.connects(&alice(), &bob()));
        assert!(envelope.connects(&bob(), &alice()));
        assert!(!envelope.connects(&alice(), &ParticipantId::new("carol")));
    }
}
