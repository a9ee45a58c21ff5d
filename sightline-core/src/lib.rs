//! Sightline - two-party WebRTC calls over a pluggable signaling relay
//!
//! This library negotiates and maintains one peer-to-peer audio/video
//! session between exactly two participants: an initiator who asks for help
//! and sends video, and a responder who receives it. It features:
//!
//! - **Relay-agnostic Signaling**: offer/answer/ICE over any publish/subscribe relay
//! - **Glare Avoidance**: ready handshake before the offer, with a bounded fallback
//! - **Race-safe Negotiation**: offer/answer dedup and ordered ICE candidate queueing
//! - **Reconnection**: ICE restarts on failure with a bounded backoff schedule
//! - **Idempotent Teardown**: call-ended fires at most once, whatever ends the call
//!
//! # Examples
//!
//! ```rust,no_run
//! use sightline_core::{CallId, CallService, EventObserver, MemoryRelay, ParticipantId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = CallService::builder()
//!     .with_relay(Arc::new(MemoryRelay::new()))
//!     .with_webrtc_defaults()
//!     .build()?;
//!
//! let observer = Arc::new(EventObserver::default());
//! let mut events = observer.subscribe();
//!
//! let call = service
//!     .initiate_call(
//!         ParticipantId::new("requester-1"),
//!         ParticipantId::new("volunteer-7"),
//!         CallId::from("c-42"),
//!         observer,
//!     )
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! call.end_call().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Session configuration
pub mod config;

/// Signaling relay boundary and per-call signal channel
pub mod signaling;

/// In-process signaling relay
pub mod relay;

/// Local and remote media
pub mod media;

/// Peer transport abstraction
pub mod transport;

/// Offer/answer bookkeeping
pub mod negotiation;

/// Session notifications
pub mod observer;

/// Call session state machine
pub mod call;

/// Call service orchestration
pub mod service;

/// webrtc-rs peer transport and sample-fed capture (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use call::{
    CallHandle, CallSession, SessionContext, SessionError, SessionParams, SessionSnapshot,
};
pub use config::{
    ChannelConfig, ConfigError, IceServer, ReconnectPolicy, RoomCapacity, SessionConfig,
};
pub use identity::ParticipantId;
pub use media::{
    CaptureEnvironment, CaptureError, FacingMode, LocalMedia, MediaCapture, MediaConstraints,
    MediaTrack, RemoteStream, TrackKind, TrackRef,
};
pub use negotiation::{AnswerDecision, Negotiator, OfferDecision};
pub use observer::{EventObserver, NoopObserver, SessionEvent, SessionObserver};
pub use relay::MemoryRelay;
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcPeerTransport, RtcRemoteTrack, RtcTransportFactory, SampleCapture, SampleTrack};
pub use service::{CallService, CallServiceBuilder, ServiceError};
pub use signaling::{
    room_name, ChannelError, ChannelEvent, RelayError, RelayEvent, RelaySubscription,
    SignalChannel, SignalEnvelope, SignalKind, SignalMessage, SignalRelay, SubscriptionId,
};
pub use transport::{
    OfferOptions, PeerTransport, SignalingState, TransportError, TransportEvent,
    TransportEventSender, TransportFactory,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallHandle, SessionError, SessionParams, SessionSnapshot};
    pub use crate::config::SessionConfig;
    pub use crate::identity::ParticipantId;
    pub use crate::media::{MediaCapture, MediaTrack, RemoteStream, TrackKind};
    pub use crate::observer::{EventObserver, SessionEvent, SessionObserver};
    pub use crate::relay::MemoryRelay;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::signaling::{SignalMessage, SignalRelay};
    pub use crate::transport::{PeerTransport, TransportFactory};
    pub use crate::types::{CallId, CallRole, ConnectionHealth, NegotiationState};
}
