//! Peer session: one media transport connection and its negotiation state
//!
//! # Architecture
//!
//! - [`PeerTransport`] abstracts the underlying connection (the `webrtc`
//!   backend, or [`crate::sim`] in tests)
//! - [`PeerSession`] owns the negotiation state machine, the description
//!   pair and the remote candidate queue
//! - [`spawn_session`] runs a session on its own task, executing
//!   [`SessionCommand`]s in order and reporting [`SessionEvent`]s on a
//!   channel. [`SessionHandle::close`] aborts any pending gathering wait.
//!
//! Negotiation state machine:
//!
//! ```text
//! Caller: New -> HaveLocalOffer  -> HaveRemoteAnswer -> Connected
//! Callee: New -> HaveRemoteOffer -> HaveLocalAnswer  -> Connected
//! Any state -> Closed
//! ```

use crate::config::IceServerConfig;
use crate::media::{LocalMediaHandle, MediaTrack};
use crate::types::{
    CallId, CallRole, IceCandidate, RemoteStream, RemoteTrack, SessionDescription,
    TransportState,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Peer session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Operation not valid in the current negotiation state
    #[error("Invalid state for {operation}: {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: NegotiationState,
    },

    /// Description rejected
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Candidate gathering did not finish in time
    #[error("ICE gathering timed out after {0:?}")]
    GatheringTimeout(Duration),

    /// Session or transport already closed
    #[error("Peer session closed")]
    Closed,

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// Nothing exchanged yet
    New,
    /// Caller advertised its offer
    HaveLocalOffer,
    /// Caller applied the callee's answer
    HaveRemoteAnswer,
    /// Callee applied the caller's offer
    HaveRemoteOffer,
    /// Callee produced its answer
    HaveLocalAnswer,
    /// Media connected
    Connected,
    /// Closed
    Closed,
}

/// Event produced by a transport implementation
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection state changed
    StateChanged(TransportState),
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack {
        /// Stream the track belongs to
        stream_id: String,
        /// The track
        track: RemoteTrack,
    },
}

/// Underlying media transport connection
///
/// Implementations report asynchronous happenings on the event channel
/// returned by their [`PeerTransportFactory`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Add a local track to the outgoing media path
    async fn add_local_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;

    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the local description and start gathering
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Resolve once gathering for the current local description completed
    async fn gathering_complete(&self) -> Result<(), PeerError>;

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates transports for new sessions
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport and its event stream
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), PeerError>;
}

/// Session-level event for the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Offer with the finalized candidate set
    LocalOffer(SessionDescription),
    /// Answer with the finalized candidate set
    LocalAnswer(SessionDescription),
    /// Individually gathered local candidate
    LocalCandidate(IceCandidate),
    /// Transport state changed
    ConnectionState(TransportState),
    /// Negotiation completed and the transport connected
    Connected,
    /// Remote stream arrived or was replaced
    RemoteStream(RemoteStream),
    /// Negotiation failed, session unusable
    NegotiationFailed(String),
    /// Session closed
    Closed,
}

/// Event tagged with the call it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotice {
    /// Owning call
    pub call_id: CallId,
    /// What happened
    pub event: SessionEvent,
}

/// Negotiation state for one call
pub struct PeerSession {
    call_id: CallId,
    role: CallRole,
    transport: Arc<dyn PeerTransport>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    seen_candidates: HashSet<String>,
    remote_stream: Option<RemoteStream>,
    tracks_attached: bool,
    transport_connected: bool,
    gathering_timeout: Duration,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl PeerSession {
    /// Create a session over a fresh transport
    pub fn new(
        call_id: CallId,
        role: CallRole,
        transport: Arc<dyn PeerTransport>,
        gathering_timeout: Duration,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            call_id,
            role,
            transport,
            state: NegotiationState::New,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            seen_candidates: HashSet::new(),
            remote_stream: None,
            tracks_attached: false,
            transport_connected: false,
            gathering_timeout,
            notices,
        }
    }

    /// Call this session belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Local description, once advertised
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Remote description, once applied
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Current remote stream
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Check if the session is closed
    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Add the handle's tracks to the outgoing media path
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless this is the first call in `New`
    #[tracing::instrument(skip(self, handle), fields(call_id = %self.call_id))]
    pub async fn attach_local_tracks(
        &mut self,
        handle: &LocalMediaHandle,
    ) -> Result<(), PeerError> {
        if self.state != NegotiationState::New || self.tracks_attached {
            return Err(self.invalid("attach_local_tracks"));
        }
        for track in handle.tracks() {
            self.transport.add_local_track(track.clone()).await?;
        }
        self.tracks_attached = true;
        tracing::debug!(tracks = handle.tracks().len(), "Local tracks attached");
        Ok(())
    }

    /// Create the offer and wait for gathering to finish
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside `New` or for the callee, and
    /// `GatheringTimeout` if gathering does not complete in time
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        if self.state != NegotiationState::New || self.role != CallRole::Caller {
            return Err(self.invalid("create_offer"));
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.wait_for_gathering().await?;
        let offer = self.transport.local_description().await.unwrap_or(offer);

        self.local_description = Some(offer.clone());
        self.transition(NegotiationState::HaveLocalOffer);
        Ok(offer)
    }

    /// Apply the caller's offer and produce the finalized answer
    ///
    /// Candidates queued before the offer are applied right after the
    /// remote description, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside `New` or for the caller,
    /// `InvalidDescription` for a non-offer, or any transport failure
    #[tracing::instrument(skip(self, offer), fields(call_id = %self.call_id))]
    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if self.state != NegotiationState::New || self.role != CallRole::Callee {
            return Err(self.invalid("apply_remote_offer"));
        }
        if !offer.is_offer() {
            return Err(PeerError::InvalidDescription(
                "expected an offer".to_string(),
            ));
        }

        self.transport.set_remote_description(offer.clone()).await?;
        self.remote_description = Some(offer);
        self.transition(NegotiationState::HaveRemoteOffer);
        self.drain_pending_candidates().await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.wait_for_gathering().await?;
        let answer = self.transport.local_description().await.unwrap_or(answer);

        self.local_description = Some(answer.clone());
        self.transition(NegotiationState::HaveLocalAnswer);
        self.check_connected();
        Ok(answer)
    }

    /// Apply the callee's answer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside `HaveLocalOffer`, `InvalidDescription`
    /// for a non-answer, or any transport failure
    #[tracing::instrument(skip(self, answer), fields(call_id = %self.call_id))]
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), PeerError> {
        if self.state != NegotiationState::HaveLocalOffer {
            return Err(self.invalid("apply_remote_answer"));
        }
        if !answer.is_answer() {
            return Err(PeerError::InvalidDescription(
                "expected an answer".to_string(),
            ));
        }

        self.transport.set_remote_description(answer.clone()).await?;
        self.remote_description = Some(answer);
        self.transition(NegotiationState::HaveRemoteAnswer);
        self.drain_pending_candidates().await?;
        self.check_connected();
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description exists
    ///
    /// No-op after close. Duplicate candidate lines are applied once.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if applying fails
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.is_closed() {
            tracing::debug!(call_id = %self.call_id, "Ignoring candidate for closed session");
            return Ok(());
        }
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            tracing::debug!(call_id = %self.call_id, "Ignoring duplicate candidate");
            return Ok(());
        }

        if self.remote_description.is_none() {
            self.pending_candidates.push_back(candidate);
            tracing::debug!(
                call_id = %self.call_id,
                queued = self.pending_candidates.len(),
                "Queued remote candidate"
            );
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate).await
    }

    /// React to a transport event
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            TransportEvent::StateChanged(state) => {
                tracing::debug!(call_id = %self.call_id, ?state, "Transport state changed");
                self.emit(SessionEvent::ConnectionState(state));
                match state {
                    TransportState::Connected => {
                        self.transport_connected = true;
                        self.check_connected();
                    }
                    TransportState::Failed => {
                        self.emit(SessionEvent::NegotiationFailed(
                            "peer connection failed".to_string(),
                        ));
                    }
                    _ => {}
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.emit(SessionEvent::LocalCandidate(candidate));
            }
            TransportEvent::RemoteTrack { stream_id, track } => {
                let mut stream = match self.remote_stream.take() {
                    Some(stream) if stream.id == stream_id => stream,
                    _ => RemoteStream::new(stream_id),
                };
                stream.upsert_track(track);
                self.remote_stream = Some(stream.clone());
                self.emit(SessionEvent::RemoteStream(stream));
            }
        }
    }

    /// Close the transport and clear negotiation state
    ///
    /// Idempotent.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.transition(NegotiationState::Closed);
        self.local_description = None;
        self.remote_description = None;
        self.pending_candidates.clear();
        self.seen_candidates.clear();
        self.remote_stream = None;

        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "Transport close failed");
        }
        self.emit(SessionEvent::Closed);
    }

    async fn drain_pending_candidates(&mut self) -> Result<(), PeerError> {
        if !self.pending_candidates.is_empty() {
            tracing::debug!(
                call_id = %self.call_id,
                count = self.pending_candidates.len(),
                "Applying queued candidates"
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn wait_for_gathering(&self) -> Result<(), PeerError> {
        match tokio::time::timeout(self.gathering_timeout, self.transport.gathering_complete())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PeerError::GatheringTimeout(self.gathering_timeout)),
        }
    }

    fn check_connected(&mut self) {
        let ready = matches!(
            self.state,
            NegotiationState::HaveRemoteAnswer | NegotiationState::HaveLocalAnswer
        );
        if ready && self.transport_connected {
            self.transition(NegotiationState::Connected);
            self.emit(SessionEvent::Connected);
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        tracing::debug!(
            call_id = %self.call_id,
            from = ?self.state,
            to = ?next,
            "Negotiation state transition"
        );
        self.state = next;
    }

    fn invalid(&self, operation: &'static str) -> PeerError {
        tracing::error!(
            call_id = %self.call_id,
            operation,
            state = ?self.state,
            role = ?self.role,
            "Negotiation operation in invalid state"
        );
        PeerError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Receiver gone means the coordinator shut down
        let _ = self.notices.send(SessionNotice {
            call_id: self.call_id,
            event,
        });
    }
}

/// Command executed by a session's driver task
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Attach local tracks
    AttachLocalTracks(LocalMediaHandle),
    /// Create the offer, reported as `LocalOffer`
    CreateOffer,
    /// Apply the remote offer, answer reported as `LocalAnswer`
    ApplyRemoteOffer(SessionDescription),
    /// Apply the remote answer
    ApplyRemoteAnswer(SessionDescription),
    /// Apply or queue a remote candidate
    AddRemoteCandidate(IceCandidate),
}

/// Handle to a running session driver
///
/// Dropping the handle closes the session.
#[derive(Debug)]
pub struct SessionHandle {
    call_id: CallId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    /// Call this session belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Queue a command, `false` if the session is closed
    pub fn send(&self, command: SessionCommand) -> bool {
        !self.is_closed() && self.commands.send(command).is_ok()
    }

    /// Close the session
    ///
    /// Takes effect immediately, aborting an in-flight command.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Check if close was requested
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run a session on its own task
pub fn spawn_session(
    session: PeerSession,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let call_id = session.call_id();

    tokio::spawn(drive_session(session, command_rx, transport_events, shutdown_rx));

    SessionHandle {
        call_id,
        commands: command_tx,
        shutdown: shutdown_tx,
    }
}

async fn drive_session(
    mut session: PeerSession,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events_open = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                let aborted = tokio::select! {
                    biased;
                    _ = shutdown.changed() => true,
                    _ = execute(&mut session, command) => false,
                };
                if aborted {
                    tracing::debug!(call_id = %session.call_id(), "Session closed during command");
                    break;
                }
            }
            event = transport_events.recv(), if events_open => match event {
                Some(event) => session.on_transport_event(event),
                None => events_open = false,
            },
        }
    }

    session.close().await;
}

async fn execute(session: &mut PeerSession, command: SessionCommand) {
    let result = match command {
        SessionCommand::AttachLocalTracks(handle) => session.attach_local_tracks(&handle).await,
        SessionCommand::CreateOffer => match session.create_offer().await {
            Ok(offer) => {
                session.emit(SessionEvent::LocalOffer(offer));
                Ok(())
            }
            Err(e) => Err(e),
        },
        SessionCommand::ApplyRemoteOffer(offer) => match session.apply_remote_offer(offer).await {
            Ok(answer) => {
                session.emit(SessionEvent::LocalAnswer(answer));
                Ok(())
            }
            Err(e) => Err(e),
        },
        SessionCommand::ApplyRemoteAnswer(answer) => session.apply_remote_answer(answer).await,
        SessionCommand::AddRemoteCandidate(candidate) => {
            session.add_remote_candidate(candidate).await
        }
    };

    if let Err(e) = result {
        tracing::warn!(call_id = %session.call_id(), error = %e, "Negotiation failed");
        session.emit(SessionEvent::NegotiationFailed(e.to_string()));
    }
}
