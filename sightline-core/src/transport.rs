//! Peer transport abstraction
//!
//! The call state machine drives offer/answer/ICE through [`PeerTransport`]
//! and learns about remote tracks, local candidates and connectivity from
//! [`TransportEvent`]s. `rtc::RtcTransportFactory` is the webrtc-rs
//! implementation.

use crate::config::IceServer;
use crate::media::{TrackKind, TrackRef};
use crate::types::{ConnectionHealth, IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport could not be created
    #[error("Transport setup failed: {0}")]
    Setup(String),

    /// Local track could not be attached
    #[error("Failed to add track: {0}")]
    AddTrack(String),

    /// Offer or answer creation failed
    #[error("Failed to create description: {0}")]
    CreateDescription(String),

    /// Description rejected by the transport
    #[error("Failed to set description: {0}")]
    SetDescription(String),

    /// Candidate rejected by the transport
    #[error("Failed to add ICE candidate: {0}")]
    AddCandidate(String),

    /// Transport already closed
    #[error("Transport closed")]
    Closed,
}

/// Offer/answer state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Local provisional answer applied
    HaveLocalPranswer,
    /// Remote provisional answer applied
    HaveRemotePranswer,
    /// Transport closed
    Closed,
}

impl SignalingState {
    /// Check for the stable state
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Stable)
    }
}

/// Offer options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    /// Gather fresh ICE credentials
    pub ice_restart: bool,
}

/// Events raised by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Remote peer contributed a track
    RemoteTrack(TrackRef),
    /// Local candidate gathered, to be trickled to the remote peer
    LocalCandidate(IceCandidate),
    /// Aggregate connection state changed
    ConnectionState(ConnectionHealth),
    /// ICE connection state changed
    IceConnectionState(ConnectionHealth),
}

/// Sender half handed to transports at creation
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Peer-to-peer media transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for sending
    ///
    /// # Errors
    ///
    /// Returns error if the track type is not supported by this transport
    async fn add_track(&self, track: TrackRef) -> Result<(), TransportError>;

    /// Request a receive-only leg of `kind`
    ///
    /// # Errors
    ///
    /// Returns error if the transceiver cannot be added
    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), TransportError>;

    /// Create an offer
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be generated
    async fn create_offer(&self, options: OfferOptions)
        -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is applied
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description is invalid in the current state
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is invalid in the current state
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Current aggregate connection state
    fn connection_state(&self) -> ConnectionHealth;

    /// Close the transport; idempotent
    async fn close(&self);
}

/// Creates one transport per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport using the fixed ICE server list
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be built
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
