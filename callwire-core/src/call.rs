//! Call coordination
//!
//! [`CallCoordinator`] is the single authority for which call the user is
//! in. It is a single-writer actor: every transition runs inside a
//! synchronous `&mut self` handler, and asynchronous work (device
//! acquisition, transport creation, signaling sends, the ring timer) runs
//! in spawned tasks whose completions come back through the inbox tagged
//! with the [`CallId`] they were started for. Completions for a call that
//! is no longer current are discarded, and any transport they carry is
//! closed.
//!
//! Drive the coordinator with [`CallCoordinator::run`] and talk to it
//! through a [`CallHandle`], or call the intent methods directly and pump
//! it with [`CallCoordinator::step`] / [`CallCoordinator::settle`].

use crate::config::{ConfigError, CoordinatorConfig};
use crate::identity::{ConversationId, UserId};
use crate::media::{LocalMediaHandle, MediaError, MediaManager, MediaSink, MediaSource};
use crate::peer::{
    spawn_session, PeerError, PeerSession, PeerTransportFactory, SessionCommand, SessionEvent,
    SessionHandle, SessionNotice,
};
use crate::signaling::{
    InboundSignal, OutboundSignal, SignalingChannel, SignalingError, SignalingHandler,
};
use crate::types::{
    CallEvent, CallId, CallRole, CallSession, EndReason, IceCandidate, MediaKind,
    SessionDescription, TrackKind,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Upper bound on delivering queued signals when the coordinator stops
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Call coordination errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Another call is in progress
    #[error("Another call is in progress")]
    Busy,

    /// No incoming call is waiting for an answer
    #[error("No incoming call is pending")]
    NoPendingCall,

    /// Intent refers to a call that is not the current one
    #[error("Call does not match the current session")]
    SessionMismatch,

    /// No call in progress
    #[error("Not in a call")]
    NotInCall,

    /// Intent not valid in the current phase
    #[error("Operation not valid while {0}")]
    InvalidPhase(CallPhase),

    /// Local media failure
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Signaling failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Negotiation failure
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] PeerError),

    /// Coordinator is no longer running
    #[error("Call coordinator closed")]
    CoordinatorClosed,
}

/// User-facing call lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call
    Idle,
    /// Outgoing call placed, not yet connected
    PlacingOutgoing,
    /// Incoming call ringing
    ReceivingIncoming,
    /// Call accepted or connected
    Active,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PlacingOutgoing => write!(f, "placing outgoing call"),
            Self::ReceivingIncoming => write!(f, "receiving incoming call"),
            Self::Active => write!(f, "in active call"),
        }
    }
}

/// Observable coordinator state
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Current phase
    pub phase: CallPhase,
    /// Current session, absent when idle
    pub session: Option<CallSession>,
}

/// Negotiation plumbing for the current call
struct SessionLink {
    peer: Option<SessionHandle>,
    alive: Arc<AtomicBool>,
    media_requested: bool,
    pending_offer: Option<SessionDescription>,
    early_candidates: Vec<IceCandidate>,
    offer_seen: bool,
    offer_requested: bool,
    answer_seen: bool,
    remote_stream_attached: bool,
    audio_enabled: bool,
    video_enabled: bool,
    ring_timer: Option<JoinHandle<()>>,
}

impl SessionLink {
    fn new(media_kind: MediaKind) -> Self {
        Self {
            peer: None,
            alive: Arc::new(AtomicBool::new(true)),
            media_requested: false,
            pending_offer: None,
            early_candidates: Vec::new(),
            offer_seen: false,
            offer_requested: false,
            answer_seen: false,
            remote_stream_attached: false,
            audio_enabled: true,
            video_enabled: media_kind.wants_video(),
            ring_timer: None,
        }
    }

    fn attach_peer(&mut self, peer: SessionHandle) {
        for candidate in self.early_candidates.drain(..) {
            peer.send(SessionCommand::AddRemoteCandidate(candidate));
        }
        self.peer = Some(peer);
    }

    fn stop_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stop_ring_timer();
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
    }
}

struct OutgoingCall {
    session: CallSession,
    link: SessionLink,
    accepted: bool,
}

struct PendingCall {
    session: CallSession,
    link: SessionLink,
}

struct ActiveCall {
    session: CallSession,
    link: SessionLink,
    connected: bool,
}

enum CallState {
    Idle,
    PlacingOutgoing(OutgoingCall),
    ReceivingIncoming(PendingCall),
    Active(ActiveCall),
}

impl CallState {
    fn phase(&self) -> CallPhase {
        match self {
            Self::Idle => CallPhase::Idle,
            Self::PlacingOutgoing(_) => CallPhase::PlacingOutgoing,
            Self::ReceivingIncoming(_) => CallPhase::ReceivingIncoming,
            Self::Active(_) => CallPhase::Active,
        }
    }

    fn session(&self) -> Option<&CallSession> {
        match self {
            Self::Idle => None,
            Self::PlacingOutgoing(call) => Some(&call.session),
            Self::ReceivingIncoming(call) => Some(&call.session),
            Self::Active(call) => Some(&call.session),
        }
    }

    fn parts_mut(&mut self) -> Option<(&mut CallSession, &mut SessionLink)> {
        match self {
            Self::Idle => None,
            Self::PlacingOutgoing(call) => Some((&mut call.session, &mut call.link)),
            Self::ReceivingIncoming(call) => Some((&mut call.session, &mut call.link)),
            Self::Active(call) => Some((&mut call.session, &mut call.link)),
        }
    }

    fn into_parts(self) -> Option<(CallSession, SessionLink)> {
        match self {
            Self::Idle => None,
            Self::PlacingOutgoing(call) => Some((call.session, call.link)),
            Self::ReceivingIncoming(call) => Some((call.session, call.link)),
            Self::Active(call) => Some((call.session, call.link)),
        }
    }
}

enum Intent {
    StartCall {
        conversation_id: ConversationId,
        peer_user_id: UserId,
        media_kind: MediaKind,
    },
    AcceptCall(CallId),
    RejectCall,
    CancelCall,
    EndCall,
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
}

enum Command {
    Intent(Intent, oneshot::Sender<Result<CallId, CallError>>),
    Shutdown(oneshot::Sender<()>),
}

struct PeerReady {
    peer: SessionHandle,
    media: LocalMediaHandle,
}

enum Input {
    Signal(InboundSignal),
    SignalingClosed,
    SendFailed {
        call_id: CallId,
        event: &'static str,
        error: SignalingError,
    },
    SetupComplete {
        call_id: CallId,
        result: Result<PeerReady, CallError>,
    },
    RingTimeout {
        call_id: CallId,
    },
}

struct Outbound {
    call_id: CallId,
    signal: OutboundSignal,
}

/// Call coordinator
pub struct CallCoordinator {
    local_user: UserId,
    config: CoordinatorConfig,
    state: CallState,
    media: MediaManager,
    factory: Arc<dyn PeerTransportFactory>,
    sink: Option<Arc<dyn MediaSink>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: mpsc::UnboundedReceiver<SessionNotice>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<CallEvent>,
    pending_events: Vec<CallEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    io_tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl CallCoordinator {
    /// Start building a coordinator
    pub fn builder<C: SignalingChannel>(
        local_user: UserId,
        signaling: Arc<SignalingHandler<C>>,
        media_source: Arc<dyn MediaSource>,
        transport_factory: Arc<dyn PeerTransportFactory>,
    ) -> CallCoordinatorBuilder<C> {
        CallCoordinatorBuilder::new(local_user, signaling, media_source, transport_factory)
    }

    /// Local user identity
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    /// Current session, absent when idle
    pub fn session(&self) -> Option<&CallSession> {
        self.state.session()
    }

    /// Local media manager
    pub fn media(&self) -> &MediaManager {
        &self.media
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Handle for driving this coordinator from other tasks
    pub fn handle(&self) -> CallHandle {
        CallHandle {
            commands: self.commands_tx.clone(),
            snapshot: self.snapshot.subscribe(),
            events: self.events.clone(),
        }
    }

    /// Place an outgoing call
    ///
    /// # Errors
    ///
    /// Returns `Busy` without touching the current call if one exists
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub fn start_call(
        &mut self,
        conversation_id: ConversationId,
        peer_user_id: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let result = self.place_call(conversation_id, peer_user_id, media_kind);
        self.publish();
        result
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `NoPendingCall` when nothing is ringing, `SessionMismatch` if
    /// `call_id` is not the ringing call
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub fn accept_call(&mut self, call_id: CallId) -> Result<CallId, CallError> {
        let result = self.accept_pending(call_id);
        self.publish();
        result
    }

    /// Decline the pending incoming call
    ///
    /// # Errors
    ///
    /// Returns `NoPendingCall` when nothing is ringing
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub fn reject_call(&mut self) -> Result<CallId, CallError> {
        let result = self.reject_pending();
        self.publish();
        result
    }

    /// Cancel the outgoing call
    ///
    /// # Errors
    ///
    /// Returns `InvalidPhase` unless an outgoing call is being placed
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub fn cancel_call(&mut self) -> Result<CallId, CallError> {
        let result = self.cancel_outgoing();
        self.publish();
        result
    }

    /// End whatever call is in progress
    ///
    /// Declines a ringing call and cancels an outgoing one.
    ///
    /// # Errors
    ///
    /// Returns `NotInCall` when idle
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub fn end_call(&mut self) -> Result<CallId, CallError> {
        let result = match self.phase() {
            CallPhase::Idle => Err(CallError::NotInCall),
            CallPhase::ReceivingIncoming => self.reject_pending(),
            CallPhase::PlacingOutgoing => self.cancel_outgoing(),
            CallPhase::Active => Ok(self.hang_up(EndReason::LocalHangup)),
        };
        self.publish();
        result
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns `NotInCall` when idle, `InvalidPhase` while ringing
    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<CallId, CallError> {
        let result = self.toggle(TrackKind::Audio, enabled);
        self.publish();
        result
    }

    /// Enable or disable the camera
    ///
    /// # Errors
    ///
    /// Returns `NotInCall` when idle, `InvalidPhase` while ringing
    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<CallId, CallError> {
        let result = self.toggle(TrackKind::Video, enabled);
        self.publish();
        result
    }

    /// Process one input, `false` once the coordinator stopped
    pub async fn step(&mut self) -> bool {
        if !self.running {
            return false;
        }
        tokio::select! {
            Some(notice) = self.notices_rx.recv() => self.on_notice(notice),
            Some(input) = self.inputs_rx.recv() => self.on_input(input),
            Some(command) = self.commands_rx.recv() => self.on_command(command),
            else => self.running = false,
        }
        self.publish();
        self.running
    }

    /// Process inputs until none arrives for `quiet`
    pub async fn settle(&mut self, quiet: Duration) {
        while let Ok(true) = tokio::time::timeout(quiet, self.step()).await {}
    }

    /// Run until [`CallHandle::shutdown`]
    pub async fn run(mut self) {
        tracing::info!(local = %self.local_user, "Call coordinator running");
        while self.step().await {}
        self.flush_outbound().await;
        tracing::info!(local = %self.local_user, "Call coordinator stopped");
    }

    /// Let the writer deliver what is already queued, then stop it
    async fn flush_outbound(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outbound, closed));
        if self.io_tasks.is_empty() {
            return;
        }
        let writer = self.io_tasks.remove(0);
        if tokio::time::timeout(SHUTDOWN_FLUSH, writer).await.is_err() {
            tracing::warn!(local = %self.local_user, "Outbound signals not flushed before shutdown");
        }
    }

    fn place_call(
        &mut self,
        conversation_id: ConversationId,
        peer_user_id: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        if !matches!(self.state, CallState::Idle) {
            tracing::warn!(phase = %self.phase(), "Call already in progress, ignoring start_call");
            return Err(CallError::Busy);
        }

        let session = CallSession::new(
            CallId::new(),
            conversation_id,
            peer_user_id,
            CallRole::Caller,
            media_kind,
        );
        let call_id = session.id;
        let mut link = SessionLink::new(media_kind);
        self.spawn_setup(&session, &mut link);
        link.ring_timer = self.spawn_ring_timer(call_id);

        self.send_signal(
            call_id,
            OutboundSignal::StartCall {
                conversation_id: session.conversation_id.clone(),
                target_user_id: session.peer_user_id.clone(),
                media_kind,
                call_id,
            },
        );
        tracing::info!(
            call_id = %call_id,
            peer = %session.peer_user_id,
            conversation = %session.conversation_id,
            %media_kind,
            "Placing call"
        );
        self.emit(CallEvent::CallPlaced {
            session: session.clone(),
        });
        self.state = CallState::PlacingOutgoing(OutgoingCall {
            session,
            link,
            accepted: false,
        });
        Ok(call_id)
    }

    fn accept_pending(&mut self, call_id: CallId) -> Result<CallId, CallError> {
        match &self.state {
            CallState::ReceivingIncoming(call) if call.session.id != call_id => {
                return Err(CallError::SessionMismatch)
            }
            CallState::ReceivingIncoming(_) => {}
            _ => return Err(CallError::NoPendingCall),
        }
        let CallState::ReceivingIncoming(PendingCall { session, mut link }) =
            std::mem::replace(&mut self.state, CallState::Idle)
        else {
            return Err(CallError::NoPendingCall);
        };

        self.send_signal(
            call_id,
            OutboundSignal::AcceptCall {
                conversation_id: session.conversation_id.clone(),
                caller_id: session.peer_user_id.clone(),
                call_id,
            },
        );
        self.spawn_setup(&session, &mut link);
        tracing::info!(call_id = %call_id, peer = %session.peer_user_id, "Call accepted");
        self.emit(CallEvent::CallAccepted { call_id });
        self.state = CallState::Active(ActiveCall {
            session,
            link,
            connected: false,
        });
        Ok(call_id)
    }

    fn reject_pending(&mut self) -> Result<CallId, CallError> {
        let CallState::ReceivingIncoming(call) = &self.state else {
            return Err(CallError::NoPendingCall);
        };
        let call_id = call.session.id;
        let signal = OutboundSignal::RejectCall {
            conversation_id: call.session.conversation_id.clone(),
            caller_id: call.session.peer_user_id.clone(),
            reason: Some(EndReason::Declined.wire_reason().to_string()),
            call_id: Some(call_id),
        };
        self.send_signal(call_id, signal);
        self.finish(EndReason::Declined);
        Ok(call_id)
    }

    fn cancel_outgoing(&mut self) -> Result<CallId, CallError> {
        if !matches!(self.state, CallState::PlacingOutgoing(_)) {
            return Err(CallError::InvalidPhase(self.phase()));
        }
        Ok(self.hang_up(EndReason::Cancelled))
    }

    fn toggle(&mut self, kind: TrackKind, enabled: bool) -> Result<CallId, CallError> {
        let phase = self.phase();
        let (call_id, conversation_id, audio_enabled, video_enabled) =
            match self.state.parts_mut() {
                None => return Err(CallError::NotInCall),
                Some(_) if phase == CallPhase::ReceivingIncoming => {
                    return Err(CallError::InvalidPhase(phase))
                }
                Some((session, link)) => {
                    match kind {
                        TrackKind::Audio => link.audio_enabled = enabled,
                        TrackKind::Video => link.video_enabled = enabled,
                    }
                    (
                        session.id,
                        session.conversation_id.clone(),
                        link.audio_enabled,
                        link.video_enabled,
                    )
                }
            };

        let signal = match kind {
            TrackKind::Audio => {
                self.media.set_audio_enabled(enabled);
                OutboundSignal::ToggleAudio {
                    conversation_id,
                    muted: !enabled,
                }
            }
            TrackKind::Video => {
                self.media.set_video_enabled(enabled);
                OutboundSignal::ToggleVideo {
                    conversation_id,
                    enabled,
                }
            }
        };
        self.send_signal(call_id, signal);
        self.emit(CallEvent::LocalMediaChanged {
            call_id,
            audio_enabled,
            video_enabled,
        });
        Ok(call_id)
    }

    /// Tell the peer the call is over, then tear down
    fn hang_up(&mut self, reason: EndReason) -> CallId {
        let Some(session) = self.state.session() else {
            return CallId::default();
        };
        let call_id = session.id;
        let signal = OutboundSignal::EndCall {
            conversation_id: session.conversation_id.clone(),
            reason: reason.wire_reason().to_string(),
            call_id,
        };
        self.send_signal(call_id, signal);
        self.finish(reason);
        call_id
    }

    /// Return to idle, releasing everything the call held
    fn finish(&mut self, reason: EndReason) {
        let Some((mut session, mut link)) =
            std::mem::replace(&mut self.state, CallState::Idle).into_parts()
        else {
            return;
        };

        link.shutdown();
        if link.media_requested {
            self.media.release();
        }
        if link.remote_stream_attached {
            if let Some(sink) = &self.sink {
                sink.detach(session.id);
            }
        }
        session.ended_at = Some(Utc::now());

        if reason.is_failure() {
            tracing::warn!(call_id = %session.id, ?reason, "Call failed");
        } else {
            tracing::info!(
                call_id = %session.id,
                ?reason,
                duration_secs = session.duration().map(|d| d.num_seconds()),
                "Call ended"
            );
        }
        self.emit(CallEvent::CallEnded { session, reason });
    }

    fn spawn_setup(&self, session: &CallSession, link: &mut SessionLink) {
        link.media_requested = true;

        let call_id = session.id;
        let role = session.role;
        let media_kind = session.media_kind;
        let alive = link.alive.clone();
        let media = self.media.clone();
        let epoch = self.media.epoch();
        let factory = self.factory.clone();
        let ice_servers = self.config.ice_servers.clone();
        let gathering_timeout = self.config.gathering_timeout();
        let notices = self.notices_tx.clone();
        let inputs = self.inputs_tx.clone();

        let setup = async move {
            let handle = media.acquire_at(epoch, media_kind).await?;
            if !alive.load(Ordering::SeqCst) {
                return Err(CallError::Media(MediaError::Cancelled));
            }

            let (transport, events) = factory.create(&ice_servers).await?;
            let session = PeerSession::new(call_id, role, transport, gathering_timeout, notices);
            let peer = spawn_session(session, events);
            peer.send(SessionCommand::AttachLocalTracks(handle.clone()));
            Ok(PeerReady { peer, media: handle })
        };

        tokio::spawn(
            async move {
                let result = setup.await;
                let _ = inputs.send(Input::SetupComplete { call_id, result });
            }
            .instrument(tracing::debug_span!("call_setup", call_id = %call_id)),
        );
    }

    fn spawn_ring_timer(&self, call_id: CallId) -> Option<JoinHandle<()>> {
        let timeout = self.config.ring_timeout()?;
        let inputs = self.inputs_tx.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inputs.send(Input::RingTimeout { call_id });
        }))
    }

    fn send_signal(&self, call_id: CallId, signal: OutboundSignal) {
        if self.outbound.send(Outbound { call_id, signal }).is_err() {
            tracing::warn!(call_id = %call_id, "Signaling writer stopped, dropping signal");
        }
    }

    fn emit(&mut self, event: CallEvent) {
        self.pending_events.push(event);
    }

    /// Publish the snapshot, then the events that led to it
    fn publish(&mut self) {
        let snapshot = CallSnapshot {
            phase: self.phase(),
            session: self.state.session().cloned(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        for event in self.pending_events.drain(..) {
            let _ = self.events.send(event);
        }
    }

    fn current_call_id(&self) -> Option<CallId> {
        self.state.session().map(|s| s.id)
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Intent(intent, reply) => {
                let result = match intent {
                    Intent::StartCall {
                        conversation_id,
                        peer_user_id,
                        media_kind,
                    } => self.start_call(conversation_id, peer_user_id, media_kind),
                    Intent::AcceptCall(call_id) => self.accept_call(call_id),
                    Intent::RejectCall => self.reject_call(),
                    Intent::CancelCall => self.cancel_call(),
                    Intent::EndCall => self.end_call(),
                    Intent::SetAudioEnabled(enabled) => self.set_audio_enabled(enabled),
                    Intent::SetVideoEnabled(enabled) => self.set_video_enabled(enabled),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown(done) => {
                if self.phase() != CallPhase::Idle {
                    self.hang_up(EndReason::Shutdown);
                }
                self.running = false;
                let _ = done.send(());
            }
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Signal(signal) => self.on_signal(signal),
            Input::SignalingClosed => {
                tracing::warn!(local = %self.local_user, "Signaling channel closed");
                self.finish(EndReason::SignalingFailed(
                    "signaling channel closed".to_string(),
                ));
            }
            Input::SendFailed {
                call_id,
                event,
                error,
            } => {
                if self.current_call_id() == Some(call_id) {
                    self.finish(EndReason::SignalingFailed(format!(
                        "{} failed: {}",
                        event, error
                    )));
                } else {
                    tracing::debug!(call_id = %call_id, event, "Send failure for a finished call");
                }
            }
            Input::SetupComplete { call_id, result } => self.on_setup_complete(call_id, result),
            Input::RingTimeout { call_id } => {
                let unanswered = matches!(
                    &self.state,
                    CallState::PlacingOutgoing(call) if call.session.id == call_id && !call.accepted
                );
                if unanswered {
                    tracing::info!(call_id = %call_id, "Call not answered in time");
                    self.hang_up(EndReason::NoAnswer);
                }
            }
        }
    }

    fn on_setup_complete(&mut self, call_id: CallId, result: Result<PeerReady, CallError>) {
        let current = self.current_call_id() == Some(call_id)
            && matches!(self.phase(), CallPhase::PlacingOutgoing | CallPhase::Active);
        if !current {
            match result {
                Ok(ready) => {
                    tracing::debug!(call_id = %call_id, "Discarding peer setup for a finished call");
                    ready.peer.close();
                }
                Err(e) => {
                    tracing::debug!(call_id = %call_id, error = %e, "Setup for a finished call failed");
                }
            }
            return;
        }

        let PeerReady { peer, media } = match result {
            Ok(ready) => ready,
            Err(e) => {
                let reason = match e {
                    CallError::Media(e) => EndReason::DeviceFailed(e.to_string()),
                    other => EndReason::NegotiationFailed(other.to_string()),
                };
                self.hang_up(reason);
                return;
            }
        };
        tracing::debug!(call_id = %call_id, media = media.id(), "Peer session ready");

        let (audio_enabled, video_enabled) = match &mut self.state {
            CallState::PlacingOutgoing(call) => {
                if call.accepted {
                    peer.send(SessionCommand::CreateOffer);
                    call.link.offer_requested = true;
                }
                call.link.attach_peer(peer);
                (call.link.audio_enabled, call.link.video_enabled)
            }
            CallState::Active(call) => {
                if let Some(offer) = call.link.pending_offer.take() {
                    peer.send(SessionCommand::ApplyRemoteOffer(offer));
                }
                call.link.attach_peer(peer);
                (call.link.audio_enabled, call.link.video_enabled)
            }
            _ => return,
        };

        self.media.set_audio_enabled(audio_enabled);
        self.media.set_video_enabled(video_enabled);
        self.emit(CallEvent::LocalMediaChanged {
            call_id,
            audio_enabled,
            video_enabled,
        });
    }

    /// Whether a signal belongs to the current session
    fn is_current(&self, signal: &InboundSignal) -> bool {
        let Some(session) = self.state.session() else {
            return false;
        };
        signal.call_id().map_or(true, |id| id == session.id)
            && signal
                .conversation_id()
                .map_or(true, |c| *c == session.conversation_id)
            && signal
                .from_user_id()
                .map_or(true, |u| *u == session.peer_user_id)
    }

    fn on_signal(&mut self, signal: InboundSignal) {
        if let InboundSignal::IncomingCall { .. } = signal {
            self.on_incoming_call(signal);
            return;
        }
        if !self.is_current(&signal) {
            tracing::warn!(
                event = signal.event_name(),
                phase = %self.phase(),
                "Dropping signal for another session"
            );
            return;
        }

        match &signal {
            InboundSignal::CallAccepted { .. } => self.on_call_accepted(),
            InboundSignal::CallRejected { reason, .. } => {
                let reason = reason.clone();
                self.finish(EndReason::PeerRejected { reason });
            }
            InboundSignal::CallEnded { reason, .. } => {
                let reason = reason.clone();
                self.finish(EndReason::PeerEnded { reason });
            }
            InboundSignal::ReceiveOffer { data, .. } => self.on_remote_offer(data.clone()),
            InboundSignal::ReceiveAnswer { data, .. } => self.on_remote_answer(data.clone()),
            InboundSignal::ReceiveIceCandidate { .. } => {
                if let Some(candidate) = signal.ice_candidate() {
                    self.on_remote_candidate(candidate);
                }
            }
            InboundSignal::PeerAudioToggled { muted, .. } => {
                if let Some(call_id) = self.current_call_id() {
                    self.emit(CallEvent::RemoteMediaChanged {
                        call_id,
                        audio_muted: Some(*muted),
                        video_enabled: None,
                    });
                }
            }
            InboundSignal::PeerVideoToggled { enabled, .. } => {
                if let Some(call_id) = self.current_call_id() {
                    self.emit(CallEvent::RemoteMediaChanged {
                        call_id,
                        audio_muted: None,
                        video_enabled: Some(*enabled),
                    });
                }
            }
            InboundSignal::IncomingCall { .. } => {}
        }
    }

    /// Whether an `IncomingCall` re-announces the session we already hold
    ///
    /// Without a `callId` the caller and conversation identify the ring, but
    /// only for a call we are the callee of, so crossing calls still collide.
    fn is_repeat_ring(
        current: &CallSession,
        call_id: Option<CallId>,
        conversation_id: &ConversationId,
        caller_id: &UserId,
    ) -> bool {
        match call_id {
            Some(id) => id == current.id,
            None => {
                current.role == CallRole::Callee
                    && current.conversation_id == *conversation_id
                    && current.peer_user_id == *caller_id
            }
        }
    }

    fn on_incoming_call(&mut self, signal: InboundSignal) {
        let InboundSignal::IncomingCall {
            conversation_id,
            caller_id,
            caller_display_name,
            media_kind,
            call_id,
        } = signal
        else {
            return;
        };

        if let Some(current) = self.state.session() {
            if Self::is_repeat_ring(current, call_id, &conversation_id, &caller_id) {
                tracing::debug!(call_id = %current.id, "Duplicate incoming call notification");
                return;
            }
            // Local tag for send failures only, never put on the wire
            let reject_id = call_id.unwrap_or_default();
            tracing::warn!(
                caller = %caller_id,
                conversation = %conversation_id,
                phase = %self.phase(),
                "Busy, rejecting incoming call"
            );
            self.send_signal(
                reject_id,
                OutboundSignal::RejectCall {
                    conversation_id: conversation_id.clone(),
                    caller_id: caller_id.clone(),
                    reason: Some("busy".to_string()),
                    call_id,
                },
            );
            self.emit(CallEvent::BusyRejected {
                conversation_id,
                caller_id,
            });
            return;
        }

        let mut session = CallSession::new(
            call_id.unwrap_or_default(),
            conversation_id,
            caller_id,
            CallRole::Callee,
            media_kind,
        );
        session.peer_display_name = caller_display_name;
        tracing::info!(
            call_id = %session.id,
            caller = %session.peer_user_id,
            %media_kind,
            "Incoming call"
        );
        self.emit(CallEvent::IncomingCall {
            session: session.clone(),
        });
        self.state = CallState::ReceivingIncoming(PendingCall {
            session,
            link: SessionLink::new(media_kind),
        });
    }

    fn on_call_accepted(&mut self) {
        let CallState::PlacingOutgoing(call) = &mut self.state else {
            tracing::warn!(phase = %self.phase(), "CallAccepted outside an outgoing call");
            return;
        };
        if call.accepted {
            return;
        }
        call.accepted = true;
        call.link.stop_ring_timer();
        if let Some(peer) = &call.link.peer {
            peer.send(SessionCommand::CreateOffer);
            call.link.offer_requested = true;
        }
        let call_id = call.session.id;
        tracing::info!(call_id = %call_id, "Remote accepted the call");
        self.emit(CallEvent::CallAccepted { call_id });
    }

    fn on_remote_offer(&mut self, offer: SessionDescription) {
        let Some((session, link)) = self.state.parts_mut() else {
            return;
        };
        if session.role != CallRole::Callee || link.offer_seen {
            tracing::warn!(call_id = %session.id, "Dropping unexpected offer");
            return;
        }
        link.offer_seen = true;
        match &link.peer {
            Some(peer) => {
                peer.send(SessionCommand::ApplyRemoteOffer(offer));
            }
            None => link.pending_offer = Some(offer),
        }
    }

    fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some((session, link)) = self.state.parts_mut() else {
            return;
        };
        if session.role != CallRole::Caller || !link.offer_requested || link.answer_seen {
            tracing::warn!(call_id = %session.id, "Dropping unexpected answer");
            return;
        }
        link.answer_seen = true;
        if let Some(peer) = &link.peer {
            peer.send(SessionCommand::ApplyRemoteAnswer(answer));
        }
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some((_, link)) = self.state.parts_mut() else {
            return;
        };
        match &link.peer {
            Some(peer) => {
                peer.send(SessionCommand::AddRemoteCandidate(candidate));
            }
            None => link.early_candidates.push(candidate),
        }
    }

    fn on_notice(&mut self, notice: SessionNotice) {
        let call_id = notice.call_id;
        let Some(session) = self.state.session().filter(|s| s.id == call_id) else {
            tracing::debug!(call_id = %call_id, "Ignoring event from a finished session");
            return;
        };
        let conversation_id = session.conversation_id.clone();
        let target_user_id = session.peer_user_id.clone();

        match notice.event {
            SessionEvent::LocalOffer(description) => self.send_signal(
                call_id,
                OutboundSignal::SendOffer {
                    conversation_id,
                    target_user_id,
                    description,
                    call_id,
                },
            ),
            SessionEvent::LocalAnswer(description) => self.send_signal(
                call_id,
                OutboundSignal::SendAnswer {
                    conversation_id,
                    target_user_id,
                    description,
                    call_id,
                },
            ),
            SessionEvent::LocalCandidate(candidate) => {
                if self.config.trickle_ice {
                    self.send_signal(
                        call_id,
                        OutboundSignal::SendIceCandidate {
                            conversation_id,
                            target_user_id,
                            candidate,
                            call_id,
                        },
                    );
                }
            }
            SessionEvent::ConnectionState(state) => {
                self.emit(CallEvent::ConnectionStateChanged { call_id, state });
            }
            SessionEvent::Connected => self.on_connected(call_id),
            SessionEvent::RemoteStream(stream) => {
                if let Some((_, link)) = self.state.parts_mut() {
                    link.remote_stream_attached = true;
                }
                if let Some(sink) = &self.sink {
                    sink.attach(call_id, &stream);
                }
                self.emit(CallEvent::RemoteStream { call_id, stream });
            }
            SessionEvent::NegotiationFailed(reason) => {
                self.hang_up(EndReason::NegotiationFailed(reason));
            }
            SessionEvent::Closed => {}
        }
    }

    fn on_connected(&mut self, call_id: CallId) {
        self.state = match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::PlacingOutgoing(OutgoingCall {
                mut session, link, ..
            }) => {
                session.connected_at = Some(Utc::now());
                CallState::Active(ActiveCall {
                    session,
                    link,
                    connected: true,
                })
            }
            CallState::Active(mut call) => {
                if !call.connected {
                    call.connected = true;
                    call.session.connected_at = Some(Utc::now());
                }
                CallState::Active(call)
            }
            other => other,
        };
        tracing::info!(call_id = %call_id, "Call connected");
        self.emit(CallEvent::Connected { call_id });
    }
}

impl Drop for CallCoordinator {
    fn drop(&mut self) {
        self.finish(EndReason::Shutdown);
        self.publish();
        for task in &self.io_tasks {
            task.abort();
        }
    }
}

/// Builder for [`CallCoordinator`]
pub struct CallCoordinatorBuilder<C: SignalingChannel> {
    local_user: UserId,
    signaling: Arc<SignalingHandler<C>>,
    media_source: Arc<dyn MediaSource>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    sink: Option<Arc<dyn MediaSink>>,
    config: CoordinatorConfig,
}

impl<C: SignalingChannel> CallCoordinatorBuilder<C> {
    /// Create new builder
    #[must_use]
    pub fn new(
        local_user: UserId,
        signaling: Arc<SignalingHandler<C>>,
        media_source: Arc<dyn MediaSource>,
        transport_factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        Self {
            local_user,
            signaling,
            media_source,
            transport_factory,
            sink: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Render remote streams through `sink`
    #[must_use]
    pub fn with_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the coordinator and start its signaling reader and writer
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn build(self) -> Result<CallCoordinator, ConfigError> {
        self.config.validate()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_buffer);
        let (snapshot, _) = watch::channel(CallSnapshot {
            phase: CallPhase::Idle,
            session: None,
        });

        let span = tracing::debug_span!("signaling", local = %self.local_user);
        let writer = tokio::spawn(
            write_signals(
                self.signaling.clone(),
                outbound_rx,
                inputs_tx.clone(),
                self.config.clone(),
            )
            .instrument(span.clone()),
        );
        let reader =
            tokio::spawn(read_signals(self.signaling, inputs_tx.clone()).instrument(span));

        Ok(CallCoordinator {
            local_user: self.local_user,
            config: self.config,
            state: CallState::Idle,
            media: MediaManager::new(self.media_source),
            factory: self.transport_factory,
            sink: self.sink,
            outbound: outbound_tx,
            inputs_tx,
            inputs_rx,
            notices_tx,
            notices_rx,
            commands_tx,
            commands_rx,
            events,
            pending_events: Vec::new(),
            snapshot,
            io_tasks: vec![writer, reader],
            running: true,
        })
    }
}

async fn write_signals<C: SignalingChannel>(
    signaling: Arc<SignalingHandler<C>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inputs: mpsc::UnboundedSender<Input>,
    config: CoordinatorConfig,
) {
    while let Some(Outbound { call_id, signal }) = outbound.recv().await {
        // Only the initiating StartCall is retried
        let attempts = match signal {
            OutboundSignal::StartCall { .. } => config.start_call_attempts.max(1),
            _ => 1,
        };
        let mut attempt = 1;
        loop {
            match signaling.send(&signal).await {
                Ok(()) => break,
                Err(error) if attempt < attempts => {
                    tracing::warn!(
                        call_id = %call_id,
                        event = signal.event_name(),
                        attempt,
                        error = %error,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(
                        call_id = %call_id,
                        event = signal.event_name(),
                        error = %error,
                        "Send failed"
                    );
                    let _ = inputs.send(Input::SendFailed {
                        call_id,
                        event: signal.event_name(),
                        error,
                    });
                    break;
                }
            }
        }
    }
}

async fn read_signals<C: SignalingChannel>(
    signaling: Arc<SignalingHandler<C>>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    loop {
        match signaling.receive().await {
            Ok(Some(signal)) => {
                if inputs.send(Input::Signal(signal)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = inputs.send(Input::SignalingClosed);
                break;
            }
            // Backoff already applied by the handler
            Err(SignalingError::Channel(_)) => {}
            Err(e) => tracing::warn!(error = %e, "Dropping invalid signal"),
        }
    }
}

/// Cloneable handle to a running [`CallCoordinator`]
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn request(&self, intent: Intent) -> Result<CallId, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Intent(intent, reply))
            .map_err(|_| CallError::CoordinatorClosed)?;
        response.await.map_err(|_| CallError::CoordinatorClosed)?
    }

    /// Place an outgoing call
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::start_call`]
    pub async fn start_call(
        &self,
        conversation_id: ConversationId,
        peer_user_id: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        self.request(Intent::StartCall {
            conversation_id,
            peer_user_id,
            media_kind,
        })
        .await
    }

    /// Accept the pending incoming call
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::accept_call`]
    pub async fn accept_call(&self, call_id: CallId) -> Result<CallId, CallError> {
        self.request(Intent::AcceptCall(call_id)).await
    }

    /// Decline the pending incoming call
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::reject_call`]
    pub async fn reject_call(&self) -> Result<CallId, CallError> {
        self.request(Intent::RejectCall).await
    }

    /// Cancel the outgoing call
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::cancel_call`]
    pub async fn cancel_call(&self) -> Result<CallId, CallError> {
        self.request(Intent::CancelCall).await
    }

    /// End whatever call is in progress
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::end_call`]
    pub async fn end_call(&self) -> Result<CallId, CallError> {
        self.request(Intent::EndCall).await
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::set_audio_enabled`]
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<CallId, CallError> {
        self.request(Intent::SetAudioEnabled(enabled)).await
    }

    /// Enable or disable the camera
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::set_video_enabled`]
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<CallId, CallError> {
        self.request(Intent::SetVideoEnabled(enabled)).await
    }

    /// Stop the coordinator, hanging up any call in progress
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        self.snapshot.borrow().phase
    }

    /// Current session, absent when idle
    pub fn session(&self) -> Option<CallSession> {
        self.snapshot.borrow().session.clone()
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wait until the coordinator reaches `phase`
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorClosed` if the coordinator stops first
    pub async fn wait_for_phase(&self, phase: CallPhase) -> Result<(), CallError> {
        let mut snapshot = self.snapshot.clone();
        loop {
            if snapshot.borrow_and_update().phase == phase {
                return Ok(());
            }
            snapshot
                .changed()
                .await
                .map_err(|_| CallError::CoordinatorClosed)?;
        }
    }
}
