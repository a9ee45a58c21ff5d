//! Local and remote media for a call
//!
//! # Architecture
//!
//! Capture devices sit behind the [`MediaCapture`] trait and hand out
//! [`MediaTrack`] trait objects:
//! - `rtc::SampleCapture` - sample-fed tracks for the webrtc-rs backend
//! - test fakes - scripted tracks for the state machine tests
//!
//! A session owns exactly one [`LocalMedia`] bundle and one
//! [`RemoteStream`]; neither is shared across sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// User or platform refused device access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No usable device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device cannot satisfy the requested constraints
    #[error("Constraint failed: {0}")]
    ConstraintFailed(String),

    /// Operation not supported by this track or device
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl TrackKind {
    /// SDP media name (`m=` line)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    #[default]
    User,
    /// Rear camera
    Environment,
}

impl FacingMode {
    /// The other camera
    pub fn toggled(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// Capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
    /// Preferred camera when `video` is set
    pub facing_mode: FacingMode,
}

impl MediaConstraints {
    /// Audio, plus video from the front camera when `with_video`
    pub fn call(with_video: bool) -> Self {
        Self {
            audio: true,
            video: with_video,
            facing_mode: FacingMode::User,
        }
    }
}

/// A captured or received media track
#[async_trait]
pub trait MediaTrack: Send + Sync + std::fmt::Debug {
    /// Track id
    fn id(&self) -> &str;

    /// Track kind
    fn kind(&self) -> TrackKind;

    /// Whether the track currently produces media
    fn enabled(&self) -> bool;

    /// Enable or disable the track without stopping it
    fn set_enabled(&self, enabled: bool);

    /// Stop the track permanently
    fn stop(&self);

    /// Whether the track has not been stopped
    fn is_live(&self) -> bool;

    /// Current facing mode, for camera tracks
    fn facing_mode(&self) -> Option<FacingMode> {
        None
    }

    /// Re-point the track at another camera
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot switch cameras
    async fn apply_facing_mode(&self, mode: FacingMode) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported(format!(
            "track {} cannot switch to {mode:?}",
            self.id()
        )))
    }

    /// Downcast hook for transport backends
    fn as_any(&self) -> &dyn Any;
}

/// Shared track handle
pub type TrackRef = Arc<dyn MediaTrack>;

/// Local participant's captured tracks
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    /// Microphone track
    pub audio: Option<TrackRef>,
    /// Camera track, only when the role sends video
    pub video: Option<TrackRef>,
}

impl LocalMedia {
    /// All present tracks, audio first
    pub fn tracks(&self) -> Vec<TrackRef> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    /// Check whether any track is still live
    pub fn is_live(&self) -> bool {
        self.tracks().iter().any(|t| t.is_live())
    }
}

/// Remote participant's tracks, built up as they arrive
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<TrackRef>,
}

impl RemoteStream {
    /// Empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track; returns `false` if a track with the same id is present
    pub fn add_track(&mut self, track: TrackRef) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Tracks in arrival order
    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    /// Check for a track of `kind`
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Number of tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Check if no track has arrived
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop and discard every track
    pub fn stop_all(&mut self) {
        for track in self.tracks.drain(..) {
            track.stop();
        }
    }
}

/// Platform capabilities checked before capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEnvironment {
    /// Running in a secure transport context
    pub secure_context: bool,
    /// A capture API is present
    pub capture_available: bool,
}

impl CaptureEnvironment {
    /// Fully capable environment
    pub fn capable() -> Self {
        Self {
            secure_context: true,
            capture_available: true,
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Platform capabilities
    fn environment(&self) -> CaptureEnvironment;

    /// Open tracks matching `constraints`
    ///
    /// # Errors
    ///
    /// Returns error if access is denied or no device fits
    async fn capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, CaptureError>;
}
