//! In-process signaling relay
//!
//! [`MemoryRelay`] implements [`SignalRelay`] with plain channels, so two
//! sessions in the same process can call each other. The CLI loopback demo
//! and the integration tests run on it.

use crate::identity::ParticipantId;
use crate::signaling::{RelayError, RelayEvent, RelaySubscription, SignalRelay, SubscriptionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Member {
    room: String,
    participant: ParticipantId,
    events: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Debug, Default)]
struct RelayState {
    members: HashMap<SubscriptionId, Member>,
    denied: HashSet<String>,
    broadcasts: usize,
}

impl RelayState {
    fn room_members(&self, room: &str) -> impl Iterator<Item = (&SubscriptionId, &Member)> {
        let room = room.to_string();
        self.members.iter().filter(move |(_, m)| m.room == room)
    }

    fn member_count(&self, room: &str) -> usize {
        self.room_members(room).count()
    }
}

/// In-memory [`SignalRelay`]
///
/// Cloning shares the same rooms. Membership counts every subscription, so
/// a participant joining twice is counted twice, as hosted presence does.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse future joins to `room`
    pub fn deny(&self, room: impl Into<String>) {
        self.state.lock().denied.insert(room.into());
    }

    /// Drop every subscription of `participant` without a graceful leave
    ///
    /// Remaining members see [`RelayEvent::MemberLeft`]; the dropped
    /// subscriptions see [`RelayEvent::Closed`].
    pub fn disconnect(&self, participant: &ParticipantId) {
        let mut state = self.state.lock();
        let ids: Vec<SubscriptionId> = state
            .members
            .iter()
            .filter(|(_, m)| m.participant == *participant)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(member) = state.members.remove(&id) {
                let _ = member.events.send(RelayEvent::Closed);
                notify_left(&state, &member);
                tracing::debug!(room = %member.room, participant = %participant, "Relay member disconnected");
            }
        }
    }

    /// Current members of `room`
    pub fn member_count(&self, room: &str) -> usize {
        self.state.lock().member_count(room)
    }

    /// Broadcasts accepted so far, across all rooms
    pub fn broadcast_count(&self) -> usize {
        self.state.lock().broadcasts
    }
}

fn notify_left(state: &RelayState, departed: &Member) {
    let member_count = state.member_count(&departed.room);
    for (_, member) in state.room_members(&departed.room) {
        let _ = member.events.send(RelayEvent::MemberLeft {
            member: departed.participant.clone(),
            member_count,
        });
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn join(
        &self,
        room: &str,
        member: &ParticipantId,
    ) -> Result<RelaySubscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId::new();

        let mut state = self.state.lock();
        if state.denied.contains(room) {
            let _ = tx.send(RelayEvent::Rejected {
                reason: format!("joining {room} is not allowed"),
            });
            return Ok(RelaySubscription { id, events: rx });
        }

        state.members.insert(
            id,
            Member {
                room: room.to_string(),
                participant: member.clone(),
                events: tx.clone(),
            },
        );
        let member_count = state.member_count(room);

        for (existing_id, existing) in state.room_members(room) {
            if *existing_id != id {
                let _ = existing.events.send(RelayEvent::MemberJoined {
                    member: member.clone(),
                    member_count,
                });
            }
        }
        let _ = tx.send(RelayEvent::Subscribed { member_count });
        tracing::debug!(room = %room, member = %member, member_count, "Relay member joined");

        Ok(RelaySubscription { id, events: rx })
    }

    async fn broadcast(
        &self,
        room: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.member_count(room) == 0 {
            return Err(RelayError::Unavailable(format!("room {room} has no members")));
        }
        state.broadcasts += 1;
        for (_, member) in state.room_members(room) {
            let _ = member.events.send(RelayEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn leave(&self, subscription: SubscriptionId) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        let member = state
            .members
            .remove(&subscription)
            .ok_or_else(|| RelayError::UnknownSubscription(subscription.to_string()))?;
        notify_left(&state, &member);
        tracing::debug!(room = %member.room, member = %member.participant, "Relay member left");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_join_reports_member_count() {
        let relay = MemoryRelay::new();
        let mut a = relay.join("webrtc:1", &ParticipantId::new("a")).await.unwrap();
        assert_eq!(
            a.events.recv().await,
            Some(RelayEvent::Subscribed { member_count: 1 })
        );

        let mut b = relay.join("webrtc:1", &ParticipantId::new("b")).await.unwrap();
        assert_eq!(
            b.events.recv().await,
            Some(RelayEvent::Subscribed { member_count: 2 })
        );
        assert!(matches!(
            a.events.recv().await,
            Some(RelayEvent::MemberJoined { member, .. }) if member.as_str() == "b"
        ));
        assert_eq!(relay.member_count("webrtc:1"), 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_sender_too() {
        let relay = MemoryRelay::new();
        let mut a = relay.join("r", &ParticipantId::new("a")).await.unwrap();
        let _ = a.events.recv().await;

        relay
            .broadcast("r", "signal", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(RelayEvent::Broadcast { event, .. }) if event == "signal"
        ));
        assert_eq!(relay.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_room_rejects_join() {
        let relay = MemoryRelay::new();
        relay.deny("locked");
        let mut a = relay.join("locked", &ParticipantId::new("a")).await.unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(RelayEvent::Rejected { .. })
        ));
        assert_eq!(relay.member_count("locked"), 0);
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_notify_remaining_members() {
        let relay = MemoryRelay::new();
        let mut a = relay.join("r", &ParticipantId::new("a")).await.unwrap();
        let b = relay.join("r", &ParticipantId::new("b")).await.unwrap();
        let mut c = relay.join("r", &ParticipantId::new("c")).await.unwrap();
        while let Ok(event) = a.events.try_recv() {
            drop(event);
        }

        relay.leave(b.id).await.unwrap();
        assert_eq!(
            a.events.recv().await,
            Some(RelayEvent::MemberLeft {
                member: ParticipantId::new("b"),
                member_count: 2
            })
        );
        assert!(relay.leave(b.id).await.is_err());

        relay.disconnect(&ParticipantId::new("a"));
        assert_eq!(a.events.recv().await, Some(RelayEvent::Closed));
        let mut saw_left = false;
        while let Ok(event) = c.events.try_recv() {
            if let RelayEvent::MemberLeft { member, member_count } = event {
                if member.as_str() == "a" {
                    assert_eq!(member_count, 1);
                    saw_left = true;
                }
            }
        }
        assert!(saw_left);
    }
}
