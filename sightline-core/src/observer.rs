//! Session notifications
//!
//! Callers learn about a session through a [`SessionObserver`]. All methods
//! are fire-and-forget and default to no-ops. [`EventObserver`] turns them
//! into a broadcast stream of [`SessionEvent`]s.

use crate::call::SessionError;
use crate::media::{RemoteStream, TrackKind};
use crate::types::ConnectionHealth;
use tokio::sync::broadcast;

/// Session callbacks
///
/// Invoked from the session task; implementations must not block.
pub trait SessionObserver: Send + Sync {
    /// Connection or ICE state changed
    fn on_connection_state(&self, _state: ConnectionHealth) {}

    /// Remote stream changed; `None` once it has been discarded
    fn on_remote_stream(&self, _stream: Option<&RemoteStream>) {}

    /// Error reported by the session
    fn on_error(&self, _error: &SessionError) {}

    /// Reconnection attempt `attempt` scheduled
    fn on_reconnecting(&self, _attempt: u32) {}

    /// Call ended; fires at most once per session
    fn on_call_ended(&self) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Owned form of one observer callback
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection or ICE state changed
    ConnectionState(ConnectionHealth),
    /// Remote stream changed
    RemoteStream {
        /// Track kinds present, in arrival order; empty once discarded
        kinds: Vec<TrackKind>,
        /// The stream, `None` once discarded
        stream: Option<RemoteStream>,
    },
    /// Error reported
    Error(SessionError),
    /// Reconnection attempt scheduled
    Reconnecting(u32),
    /// Call ended
    CallEnded,
}

/// Broadcasts every callback as a [`SessionEvent`]
#[derive(Debug, Clone)]
pub struct EventObserver {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventObserver {
    /// Create an observer buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventObserver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionObserver for EventObserver {
    fn on_connection_state(&self, state: ConnectionHealth) {
        self.emit(SessionEvent::ConnectionState(state));
    }

    fn on_remote_stream(&self, stream: Option<&RemoteStream>) {
        let kinds = stream
            .map(|s| s.tracks().iter().map(|t| t.kind()).collect())
            .unwrap_or_default();
        self.emit(SessionEvent::RemoteStream {
            kinds,
            stream: stream.cloned(),
        });
    }

    fn on_error(&self, error: &SessionError) {
        self.emit(SessionEvent::Error(error.clone()));
    }

    fn on_reconnecting(&self, attempt: u32) {
        self.emit(SessionEvent::Reconnecting(attempt));
    }

    fn on_call_ended(&self) {
        self.emit(SessionEvent::CallEnded);
    }
}
