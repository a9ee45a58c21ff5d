//! Offer/answer bookkeeping
//!
//! [`Negotiator`] holds every guard the call state machine needs to decide
//! whether an incoming offer, answer or candidate may touch the transport.
//! It performs no I/O: the session asks it for a decision, drives the
//! transport, then reports the outcome back.

use crate::transport::SignalingState;
use crate::types::{CallRole, ConnectionHealth, IceCandidate, NegotiationState, SessionDescription};
use std::collections::{HashSet, VecDeque};

/// What to do with an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Apply it and answer
    Accept,
    /// Same offer already processed
    Duplicate,
    /// Another offer is mid-processing
    Busy,
    /// An answer was already produced for this session
    AlreadyAnswered,
    /// Transport is not in the stable state
    NotStable,
    /// Initiators never answer
    WrongRole,
}

/// What to do with an incoming answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDecision {
    /// Apply it now
    Apply,
    /// Offer still being created; held until it completes
    Buffered,
    /// Same answer already seen
    Duplicate,
    /// Transport already connected
    AlreadyConnected,
    /// No offer outstanding
    Unexpected,
    /// Responders never receive answers
    WrongRole,
}

/// Negotiation guards for one session
#[derive(Debug)]
pub struct Negotiator {
    role: CallRole,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    seen_offers: HashSet<String>,
    seen_answers: HashSet<String>,
    processing_offer: bool,
    answer_created: bool,
    offer_in_progress: bool,
    pending_answer: Option<SessionDescription>,
}

impl Negotiator {
    /// Fresh negotiator for `role`
    pub fn new(role: CallRole) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            seen_offers: HashSet::new(),
            seen_answers: HashSet::new(),
            processing_offer: false,
            answer_created: false,
            offer_in_progress: false,
            pending_answer: None,
        }
    }

    /// Session role
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether the remote description has been applied
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates waiting for the remote description
    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Whether an answer is held for the in-flight offer
    pub fn has_pending_answer(&self) -> bool {
        self.pending_answer.is_some()
    }

    /// Whether an offer is currently being created
    pub fn offer_in_progress(&self) -> bool {
        self.offer_in_progress
    }

    /// Start creating an offer
    ///
    /// Returns `false` when this session must not offer now: responders,
    /// an offer already in flight, or a second non-restart offer.
    pub fn begin_offer(&mut self, restart: bool) -> bool {
        if !self.role.is_initiator() || self.offer_in_progress {
            return false;
        }
        if !restart && !matches!(self.state, NegotiationState::Idle) {
            return false;
        }
        if restart {
            self.remote_description_set = false;
            self.pending_answer = None;
        }
        self.offer_in_progress = true;
        true
    }

    /// The local offer was applied and sent
    ///
    /// Returns an answer that arrived while the offer was being created.
    pub fn offer_sent(&mut self) -> Option<SessionDescription> {
        self.offer_in_progress = false;
        self.state = NegotiationState::OfferSent;
        self.pending_answer.take()
    }

    /// Offer creation failed
    pub fn offer_failed(&mut self) {
        self.offer_in_progress = false;
        self.pending_answer = None;
        self.state = NegotiationState::Failed;
    }

    /// Decide on an incoming offer
    ///
    /// `Accept` marks the offer as processing; finish with
    /// [`Self::answer_sent`] or [`Self::answer_failed`].
    pub fn accept_offer(
        &mut self,
        offer: &SessionDescription,
        restart: bool,
        signaling: SignalingState,
    ) -> OfferDecision {
        if self.role.is_initiator() {
            return OfferDecision::WrongRole;
        }
        if self.seen_offers.contains(&offer.sdp) {
            return OfferDecision::Duplicate;
        }
        if self.processing_offer {
            return OfferDecision::Busy;
        }
        if self.answer_created && !restart {
            return OfferDecision::AlreadyAnswered;
        }
        if !signaling.is_stable() {
            return OfferDecision::NotStable;
        }

        if self.answer_created {
            // Restart: the new generation's candidates wait for the new offer
            self.answer_created = false;
            self.remote_description_set = false;
        }
        self.seen_offers.insert(offer.sdp.clone());
        self.processing_offer = true;
        OfferDecision::Accept
    }

    /// The remote description was applied
    ///
    /// Returns the candidates queued before it, in arrival order.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.state = if self.role.is_initiator() {
            NegotiationState::Negotiated
        } else {
            NegotiationState::OfferReceived
        };
        self.pending_candidates.drain(..).collect()
    }

    /// The local answer was applied and sent
    pub fn answer_sent(&mut self) {
        self.processing_offer = false;
        self.answer_created = true;
        self.state = NegotiationState::AnswerSent;
    }

    /// Answering the current offer failed
    pub fn answer_failed(&mut self) {
        self.processing_offer = false;
        self.state = NegotiationState::Failed;
    }

    /// Decide on an incoming answer
    pub fn accept_answer(
        &mut self,
        answer: &SessionDescription,
        signaling: SignalingState,
        connection: ConnectionHealth,
    ) -> AnswerDecision {
        if !self.role.is_initiator() {
            return AnswerDecision::WrongRole;
        }
        if self.seen_answers.contains(&answer.sdp) {
            return AnswerDecision::Duplicate;
        }
        if connection == ConnectionHealth::Connected {
            return AnswerDecision::AlreadyConnected;
        }

        match signaling {
            SignalingState::HaveLocalOffer if self.state == NegotiationState::OfferSent => {
                self.seen_answers.insert(answer.sdp.clone());
                AnswerDecision::Apply
            }
            SignalingState::Stable | SignalingState::HaveLocalOffer if self.offer_in_progress => {
                self.seen_answers.insert(answer.sdp.clone());
                self.pending_answer = Some(answer.clone());
                AnswerDecision::Buffered
            }
            _ => AnswerDecision::Unexpected,
        }
    }

    /// Applying the answer failed
    pub fn answer_rejected(&mut self) {
        self.state = NegotiationState::Failed;
    }

    /// Drop a buffered answer whose offer never completed
    ///
    /// Returns `true` if an answer was dropped.
    pub fn expire_pending_answer(&mut self) -> bool {
        self.pending_answer.take().is_some()
    }

    /// Route a remote candidate
    ///
    /// Returns the candidate when it can be applied now; otherwise it is
    /// queued until [`Self::remote_description_applied`].
    pub fn admit_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_candidates.push_back(candidate);
            None
        }
    }

    /// Forget all negotiation progress, keeping the role
    pub fn reset(&mut self) {
        *self = Self::new(self.role);
    }
}
