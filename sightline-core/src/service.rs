//! Call service orchestration
//!
//! [`CallService`] is where the relay, capture devices, transport factory
//! and configuration are wired together once; every call is then started
//! from it.

use crate::call::{CallHandle, CallSession, SessionContext, SessionError, SessionParams};
use crate::config::SessionConfig;
use crate::identity::ParticipantId;
use crate::media::MediaCapture;
use crate::observer::SessionObserver;
use crate::signaling::SignalRelay;
use crate::transport::TransportFactory;
use crate::types::CallId;
use std::sync::Arc;
use thiserror::Error;

/// Service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Builder is missing a collaborator or has a bad config
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call could not be started
    #[error("Call error: {0}")]
    CallError(#[from] SessionError),
}

/// Entry point for starting calls
#[derive(Clone)]
pub struct CallService {
    context: SessionContext,
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::new()
    }

    /// Effective configuration
    pub fn config(&self) -> &SessionConfig {
        &self.context.config
    }

    /// Start a session with explicit parameters
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be initialized
    pub async fn start_session(
        &self,
        params: SessionParams,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<CallHandle, ServiceError> {
        Ok(CallSession::initialize(&self.context, params, observer).await?)
    }

    /// Place a call as the initiator (sends video)
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be initialized
    #[tracing::instrument(skip(self, observer), fields(call_id = %call_id, remote = %remote))]
    pub async fn initiate_call(
        &self,
        local: ParticipantId,
        remote: ParticipantId,
        call_id: CallId,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<CallHandle, ServiceError> {
        tracing::info!("Initiating call");
        let handle = self
            .start_session(SessionParams::initiator(local, remote, call_id), observer)
            .await?;
        tracing::info!("Call initiated");
        Ok(handle)
    }

    /// Accept a call as the responder (receives video, sends audio)
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be initialized
    #[tracing::instrument(skip(self, observer), fields(call_id = %call_id, remote = %remote))]
    pub async fn accept_call(
        &self,
        local: ParticipantId,
        remote: ParticipantId,
        call_id: CallId,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<CallHandle, ServiceError> {
        tracing::info!("Accepting call");
        let handle = self
            .start_session(SessionParams::responder(local, remote, call_id), observer)
            .await?;
        tracing::info!("Call accepted");
        Ok(handle)
    }
}

/// Call service builder
#[derive(Default)]
pub struct CallServiceBuilder {
    config: SessionConfig,
    relay: Option<Arc<dyn SignalRelay>>,
    capture: Option<Arc<dyn MediaCapture>>,
    transports: Option<Arc<dyn TransportFactory>>,
}

impl CallServiceBuilder {
    /// Create new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signaling relay
    #[must_use]
    pub fn with_relay(mut self, relay: Arc<dyn SignalRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Set the capture devices
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Set the transport factory
    #[must_use]
    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Fill unset capture and transport slots with the webrtc-rs backend
    #[cfg(feature = "webrtc-backend")]
    #[must_use]
    pub fn with_webrtc_defaults(mut self) -> Self {
        if self.capture.is_none() {
            self.capture = Some(Arc::new(crate::rtc::SampleCapture::new()));
        }
        if self.transports.is_none() {
            self.transports = Some(Arc::new(crate::rtc::RtcTransportFactory::new()));
        }
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the config is invalid
    pub fn build(self) -> Result<CallService, ServiceError> {
        self.config
            .validate()
            .map_err(|e| ServiceError::InitError(e.to_string()))?;

        let relay = self
            .relay
            .ok_or_else(|| ServiceError::InitError("no signaling relay configured".into()))?;
        let capture = self
            .capture
            .ok_or_else(|| ServiceError::InitError("no capture device configured".into()))?;
        let transports = self
            .transports
            .ok_or_else(|| ServiceError::InitError("no transport factory configured".into()))?;

        Ok(CallService {
            context: SessionContext {
                config: self.config,
                relay,
                capture,
                transports,
            },
        })
    }
}
