//! Call signaling protocol
//!
//! Typed signals exchanged with the signaling server over a named-event
//! channel, plus the codec that turns them into `(event, payload)` pairs and
//! validates inbound payload shape before anything else sees it.

use crate::identity::{ConversationId, UserId};
use crate::types::{CallId, IceCandidate, MediaKind, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Maximum signaling payload size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum identifier length (user, conversation)
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum SDP string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate string length
pub const MAX_CANDIDATE_LENGTH: usize = 4 * 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Channel is not connected
    #[error("Signaling channel not connected")]
    NotConnected,

    /// The channel failed to send or receive
    #[error("Channel error: {0}")]
    Channel(String),

    /// Event name is not part of the protocol
    #[error("Unknown signaling event: {0}")]
    UnknownEvent(String),

    /// Payload does not have the expected shape
    #[error("Malformed {event} payload: {reason}")]
    Malformed {
        /// Event name
        event: String,
        /// What was wrong
        reason: String,
    },

    /// Outbound signal could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),
}

/// One named event as it travels on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSignal {
    /// Event name
    pub event: String,
    /// JSON payload
    pub payload: serde_json::Value,
}

impl RawSignal {
    /// Create a raw signal
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Connection state of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Initial connect in progress
    Connecting,
    /// Connected
    Connected,
    /// Lost connection, reconnecting
    Reconnecting,
    /// Not connected
    Disconnected,
}

impl ChannelState {
    /// Whether sends are expected to succeed
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Persistent bidirectional named-event connection to the signaling server
///
/// Implement this for your realtime transport (websocket hub, message bus,
/// etc.). Implementations must preserve per-conversation delivery order;
/// the call engine does not reorder.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Channel error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one event
    async fn send(&self, signal: RawSignal) -> Result<(), Self::Error>;

    /// Receive the next event, `None` once the channel is closed for good
    async fn receive(&self) -> Result<Option<RawSignal>, Self::Error>;

    /// Current connection state
    fn connection_state(&self) -> ChannelState;
}

/// Signals sent by the call engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum OutboundSignal {
    /// Ring the target
    StartCall {
        /// Conversation
        conversation_id: ConversationId,
        /// Who to call
        target_user_id: UserId,
        /// Audio or video
        #[serde(rename = "callType")]
        media_kind: MediaKind,
        /// Call identifier
        call_id: CallId,
    },
    /// Local offer, candidates included
    SendOffer {
        /// Conversation
        conversation_id: ConversationId,
        /// Recipient
        target_user_id: UserId,
        /// The offer
        description: SessionDescription,
        /// Call identifier
        call_id: CallId,
    },
    /// Local answer, candidates included
    SendAnswer {
        /// Conversation
        conversation_id: ConversationId,
        /// Recipient
        target_user_id: UserId,
        /// The answer
        description: SessionDescription,
        /// Call identifier
        call_id: CallId,
    },
    /// Trickled local candidate
    SendIceCandidate {
        /// Conversation
        conversation_id: ConversationId,
        /// Recipient
        target_user_id: UserId,
        /// The candidate
        candidate: IceCandidate,
        /// Call identifier
        call_id: CallId,
    },
    /// Accept an incoming call
    AcceptCall {
        /// Conversation
        conversation_id: ConversationId,
        /// Who called
        caller_id: UserId,
        /// Call identifier
        call_id: CallId,
    },
    /// Reject an incoming call
    RejectCall {
        /// Conversation
        conversation_id: ConversationId,
        /// Who called
        caller_id: UserId,
        /// Optional reason
        reason: Option<String>,
        /// Call identifier, absent when the server never told us one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// End or cancel a call
    EndCall {
        /// Conversation
        conversation_id: ConversationId,
        /// Reason
        reason: String,
        /// Call identifier
        call_id: CallId,
    },
    /// Local microphone muted or unmuted
    ToggleAudio {
        /// Conversation
        conversation_id: ConversationId,
        /// Muted
        muted: bool,
    },
    /// Local camera enabled or disabled
    ToggleVideo {
        /// Conversation
        conversation_id: ConversationId,
        /// Enabled
        enabled: bool,
    },
}

impl OutboundSignal {
    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StartCall { .. } => "StartCall",
            Self::SendOffer { .. } => "SendOffer",
            Self::SendAnswer { .. } => "SendAnswer",
            Self::SendIceCandidate { .. } => "SendIceCandidate",
            Self::AcceptCall { .. } => "AcceptCall",
            Self::RejectCall { .. } => "RejectCall",
            Self::EndCall { .. } => "EndCall",
            Self::ToggleAudio { .. } => "ToggleAudio",
            Self::ToggleVideo { .. } => "ToggleVideo",
        }
    }

    /// Conversation the signal belongs to
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::StartCall {
                conversation_id, ..
            }
            | Self::SendOffer {
                conversation_id, ..
            }
            | Self::SendAnswer {
                conversation_id, ..
            }
            | Self::SendIceCandidate {
                conversation_id, ..
            }
            | Self::AcceptCall {
                conversation_id, ..
            }
            | Self::RejectCall {
                conversation_id, ..
            }
            | Self::EndCall {
                conversation_id, ..
            }
            | Self::ToggleAudio {
                conversation_id, ..
            }
            | Self::ToggleVideo {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Encode into a named event
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Encode` if serialization fails
    pub fn encode(&self) -> Result<RawSignal, SignalingError> {
        split_tagged(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    /// Decode a named event produced by [`OutboundSignal::encode`]
    ///
    /// Used by relays that sit where the signaling server would.
    ///
    /// # Errors
    ///
    /// Returns error if the event is unknown or the payload is malformed
    pub fn decode(raw: RawSignal) -> Result<Self, SignalingError> {
        join_tagged(raw, Self::EVENT_NAMES)
    }

    /// All outbound event names
    pub const EVENT_NAMES: &'static [&'static str] = &[
        "StartCall",
        "SendOffer",
        "SendAnswer",
        "SendIceCandidate",
        "AcceptCall",
        "RejectCall",
        "EndCall",
        "ToggleAudio",
        "ToggleVideo",
    ];
}

/// Signals received from the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum InboundSignal {
    /// Someone is calling us
    IncomingCall {
        /// Conversation
        conversation_id: ConversationId,
        /// Who is calling
        caller_id: UserId,
        /// Caller display name
        #[serde(default)]
        caller_display_name: Option<String>,
        /// Audio or video
        #[serde(rename = "callType")]
        media_kind: MediaKind,
        /// Call identifier assigned by the caller
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Remote offer
    ReceiveOffer {
        /// Sender
        from_user_id: UserId,
        /// The offer
        data: SessionDescription,
        /// Conversation, when relayed
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Remote answer
    ReceiveAnswer {
        /// Sender
        from_user_id: UserId,
        /// The answer
        data: SessionDescription,
        /// Conversation, when relayed
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Remote candidate
    ReceiveIceCandidate {
        /// Candidate string
        candidate: String,
        /// SDP media ID
        #[serde(default)]
        sdp_mid: Option<String>,
        /// SDP media line index
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        /// Sender, when relayed
        #[serde(default)]
        from_user_id: Option<UserId>,
        /// Conversation, when relayed
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Callee accepted our call
    CallAccepted {
        /// Conversation
        conversation_id: ConversationId,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Callee rejected our call
    CallRejected {
        /// Conversation
        conversation_id: ConversationId,
        /// Reason
        #[serde(default)]
        reason: Option<String>,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Remote side ended the call
    CallEnded {
        /// Conversation
        conversation_id: ConversationId,
        /// Reason
        #[serde(default)]
        reason: Option<String>,
        /// Call identifier, when relayed
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Remote microphone toggled
    PeerAudioToggled {
        /// Conversation
        conversation_id: ConversationId,
        /// Muted
        muted: bool,
    },
    /// Remote camera toggled
    PeerVideoToggled {
        /// Conversation
        conversation_id: ConversationId,
        /// Enabled
        enabled: bool,
    },
}

impl InboundSignal {
    /// All inbound event names
    pub const EVENT_NAMES: &'static [&'static str] = &[
        "IncomingCall",
        "ReceiveOffer",
        "ReceiveAnswer",
        "ReceiveIceCandidate",
        "CallAccepted",
        "CallRejected",
        "CallEnded",
        "PeerAudioToggled",
        "PeerVideoToggled",
    ];

    /// Wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "IncomingCall",
            Self::ReceiveOffer { .. } => "ReceiveOffer",
            Self::ReceiveAnswer { .. } => "ReceiveAnswer",
            Self::ReceiveIceCandidate { .. } => "ReceiveIceCandidate",
            Self::CallAccepted { .. } => "CallAccepted",
            Self::CallRejected { .. } => "CallRejected",
            Self::CallEnded { .. } => "CallEnded",
            Self::PeerAudioToggled { .. } => "PeerAudioToggled",
            Self::PeerVideoToggled { .. } => "PeerVideoToggled",
        }
    }

    /// Conversation the signal refers to, if carried
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::IncomingCall {
                conversation_id, ..
            }
            | Self::CallAccepted {
                conversation_id, ..
            }
            | Self::CallRejected {
                conversation_id, ..
            }
            | Self::CallEnded {
                conversation_id, ..
            }
            | Self::PeerAudioToggled {
                conversation_id, ..
            }
            | Self::PeerVideoToggled {
                conversation_id, ..
            } => Some(conversation_id),
            Self::ReceiveOffer {
                conversation_id, ..
            }
            | Self::ReceiveAnswer {
                conversation_id, ..
            }
            | Self::ReceiveIceCandidate {
                conversation_id, ..
            } => conversation_id.as_ref(),
        }
    }

    /// Call identifier the signal refers to, if carried
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::ReceiveOffer { call_id, .. }
            | Self::ReceiveAnswer { call_id, .. }
            | Self::ReceiveIceCandidate { call_id, .. }
            | Self::CallAccepted { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnded { call_id, .. } => *call_id,
            Self::PeerAudioToggled { .. } | Self::PeerVideoToggled { .. } => None,
        }
    }

    /// Sending user, if carried
    pub fn from_user_id(&self) -> Option<&UserId> {
        match self {
            Self::IncomingCall { caller_id, .. } => Some(caller_id),
            Self::ReceiveOffer { from_user_id, .. } | Self::ReceiveAnswer { from_user_id, .. } => {
                Some(from_user_id)
            }
            Self::ReceiveIceCandidate { from_user_id, .. } => from_user_id.as_ref(),
            _ => None,
        }
    }

    /// Encode into a named event
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Encode` if serialization fails
    pub fn encode(&self) -> Result<RawSignal, SignalingError> {
        split_tagged(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    /// Decode and validate a received event
    ///
    /// # Errors
    ///
    /// Returns error if the event is unknown, the payload does not
    /// deserialize, or a field violates the shape rules
    pub fn decode(raw: RawSignal) -> Result<Self, SignalingError> {
        let event = raw.event.clone();
        let size = serde_json::to_vec(&raw.payload)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::Malformed {
                event,
                reason: format!("payload of {} bytes exceeds limit", size),
            });
        }

        let signal: Self = join_tagged(raw, Self::EVENT_NAMES)?;
        signal
            .validate()
            .map_err(|reason| SignalingError::Malformed { event, reason })?;
        Ok(signal)
    }

    /// Check field contents beyond what deserialization enforces
    fn validate(&self) -> Result<(), String> {
        if let Some(conversation_id) = self.conversation_id() {
            check_id("conversationId", conversation_id.as_str())?;
        }
        if let Some(from) = self.from_user_id() {
            check_id("fromUserId", from.as_str())?;
        }

        match self {
            Self::ReceiveOffer { data, .. } => check_description(data, SdpType::Offer),
            Self::ReceiveAnswer { data, .. } => check_description(data, SdpType::Answer),
            Self::ReceiveIceCandidate { candidate, .. } => {
                if candidate.trim().is_empty() {
                    return Err("candidate cannot be empty".to_string());
                }
                if candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(format!("candidate exceeds {} bytes", MAX_CANDIDATE_LENGTH));
                }
                Ok(())
            }
            Self::IncomingCall {
                caller_display_name: Some(name),
                ..
            } if name.len() > MAX_ID_LENGTH => Err("callerDisplayName too long".to_string()),
            _ => Ok(()),
        }
    }

    /// Remote candidate carried by a `ReceiveIceCandidate` signal
    pub fn ice_candidate(&self) -> Option<IceCandidate> {
        match self {
            Self::ReceiveIceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => Some(IceCandidate {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            }),
            _ => None,
        }
    }
}

fn check_id(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} cannot be empty", field));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(format!("{} exceeds {} bytes", field, MAX_ID_LENGTH));
    }
    Ok(())
}

fn check_description(desc: &SessionDescription, expected: SdpType) -> Result<(), String> {
    if desc.sdp_type != expected {
        return Err(format!(
            "expected {:?} description, got {:?}",
            expected, desc.sdp_type
        ));
    }
    if desc.sdp.trim().is_empty() {
        return Err("sdp cannot be empty".to_string());
    }
    if desc.sdp.len() > MAX_SDP_LENGTH {
        return Err(format!("sdp exceeds {} bytes", MAX_SDP_LENGTH));
    }
    Ok(())
}

/// Turn an adjacently tagged value into `(event, payload)`
fn split_tagged<T: Serialize>(value: &T) -> Result<RawSignal, serde_json::Error> {
    let mut tagged = serde_json::to_value(value)?;
    let event = tagged
        .get("event")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let payload = tagged
        .get_mut("payload")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null);
    Ok(RawSignal { event, payload })
}

fn join_tagged<T: for<'de> Deserialize<'de>>(
    raw: RawSignal,
    known: &[&str],
) -> Result<T, SignalingError> {
    if !known.contains(&raw.event.as_str()) {
        return Err(SignalingError::UnknownEvent(raw.event));
    }
    let event = raw.event.clone();
    let tagged = serde_json::json!({ "event": raw.event, "payload": raw.payload });
    serde_json::from_value(tagged).map_err(|e| SignalingError::Malformed {
        event,
        reason: e.to_string(),
    })
}

/// Signaling handler with typed encode/decode and receive backoff
pub struct SignalingHandler<C: SignalingChannel> {
    channel: Arc<C>,
    error_count: Mutex<u32>,
}

impl<C: SignalingChannel> SignalingHandler<C> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            error_count: Mutex::new(0),
        }
    }

    /// Send a typed signal
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the channel is down, or `Channel` if the
    /// underlying send fails
    #[tracing::instrument(skip(self, signal), fields(event = signal.event_name(), conversation = %signal.conversation_id()))]
    pub async fn send(&self, signal: &OutboundSignal) -> Result<(), SignalingError> {
        if !self.channel.connection_state().can_send() {
            tracing::debug!(state = ?self.channel.connection_state(), "Channel not connected");
            return Err(SignalingError::NotConnected);
        }
        let raw = signal.encode()?;
        tracing::debug!("Sending signal");
        self.channel
            .send(raw)
            .await
            .map_err(|e| SignalingError::Channel(e.to_string()))
    }

    /// Receive and decode the next signal, `Ok(None)` once the channel closed
    ///
    /// Channel errors are followed by a linear backoff before returning.
    ///
    /// # Errors
    ///
    /// Returns `Channel` on transport failure, or a decode error for an
    /// unknown or malformed event
    #[tracing::instrument(skip(self))]
    pub async fn receive(&self) -> Result<Option<InboundSignal>, SignalingError> {
        match self.channel.receive().await {
            Ok(Some(raw)) => {
                *self.error_count.lock() = 0;
                let signal = InboundSignal::decode(raw)?;
                tracing::debug!(event = signal.event_name(), "Received signal");
                Ok(Some(signal))
            }
            Ok(None) => {
                tracing::info!("Signaling channel closed");
                Ok(None)
            }
            Err(e) => {
                let count = {
                    let mut error_count = self.error_count.lock();
                    *error_count += 1;
                    *error_count
                };
                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving signal, backing off"
                );
                sleep(backoff_duration).await;
                Err(SignalingError::Channel(e.to_string()))
            }
        }
    }

    /// Current channel state
    #[must_use]
    pub fn connection_state(&self) -> ChannelState {
        self.channel.connection_state()
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    struct MockChannel {
        outbox: Mutex<Vec<RawSignal>>,
        inbox: Mutex<VecDeque<Result<RawSignal, MockError>>>,
        state: Mutex<ChannelState>,
    }

    #[derive(Debug)]
    struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    impl MockChannel {
        fn new() -> Self {
            Self {
                outbox: Mutex::new(Vec::new()),
                inbox: Mutex::new(VecDeque::new()),
                state: Mutex::new(ChannelState::Connected),
            }
        }
    }

    #[async_trait]
    impl SignalingChannel for MockChannel {
        type Error = MockError;

        async fn send(&self, signal: RawSignal) -> Result<(), MockError> {
            self.outbox.lock().push(signal);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<RawSignal>, MockError> {
            match self.inbox.lock().pop_front() {
                Some(Ok(raw)) => Ok(Some(raw)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }

        fn connection_state(&self) -> ChannelState {
            *self.state.lock()
        }
    }

    fn start_call() -> OutboundSignal {
        OutboundSignal::StartCall {
            conversation_id: ConversationId::new("c1"),
            target_user_id: UserId::new("bob"),
            media_kind: MediaKind::Audio,
            call_id: CallId::new(),
        }
    }

    #[test]
    fn test_outbound_wire_shape() {
        let raw = start_call().encode().unwrap();
        assert_eq!(raw.event, "StartCall");
        assert_eq!(raw.payload["conversationId"], "c1");
        assert_eq!(raw.payload["targetUserId"], "bob");
        assert_eq!(raw.payload["callType"], "audio");
        assert!(raw.payload["callId"].is_string());

        let reject = OutboundSignal::RejectCall {
            conversation_id: ConversationId::new("c1"),
            caller_id: UserId::new("alice"),
            reason: Some("Declined by user".into()),
            call_id: Some(CallId::new()),
        }
        .encode()
        .unwrap();
        assert_eq!(reject.payload["callerId"], "alice");
        assert_eq!(reject.payload["reason"], "Declined by user");
    }

    #[test]
    fn test_inbound_decode_without_optional_fields() {
        let raw = RawSignal::new(
            "IncomingCall",
            serde_json::json!({
                "conversationId": "c1",
                "callerId": "alice",
                "callerDisplayName": "Alice",
                "callType": "video"
            }),
        );
        let signal = InboundSignal::decode(raw).unwrap();
        assert_eq!(
            signal,
            InboundSignal::IncomingCall {
                conversation_id: ConversationId::new("c1"),
                caller_id: UserId::new("alice"),
                caller_display_name: Some("Alice".into()),
                media_kind: MediaKind::Video,
                call_id: None,
            }
        );
        assert_eq!(signal.from_user_id(), Some(&UserId::new("alice")));
    }

    #[test]
    fn test_candidate_decode() {
        let raw = RawSignal::new(
            "ReceiveIceCandidate",
            serde_json::json!({
                "candidate": "candidate:1 1 UDP 1 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }),
        );
        let signal = InboundSignal::decode(raw).unwrap();
        let candidate = signal.ice_candidate().unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(signal.conversation_id(), None);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let res = InboundSignal::decode(RawSignal::new("Bogus", serde_json::json!({})));
        assert_eq!(res, Err(SignalingError::UnknownEvent("Bogus".into())));
    }

    #[test]
    fn test_outbound_roundtrip_through_relay_decode() {
        let signal = start_call();
        let decoded = OutboundSignal::decode(signal.encode().unwrap()).unwrap();
        assert_eq!(decoded, signal);
    }

    #[tokio::test]
    async fn test_handler_send_requires_connection() {
        let channel = Arc::new(MockChannel::new());
        let handler = SignalingHandler::new(channel.clone());

        handler.send(&start_call()).await.unwrap();
        assert_eq!(channel.outbox.lock().len(), 1);

        *channel.state.lock() = ChannelState::Reconnecting;
        let res = handler.send(&start_call()).await;
        assert_eq!(res, Err(SignalingError::NotConnected));
        assert_eq!(channel.outbox.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_receive_decodes_and_reports_errors() {
        let channel = Arc::new(MockChannel::new());
        channel.inbox.lock().push_back(Ok(RawSignal::new(
            "CallAccepted",
            serde_json::json!({ "conversationId": "c1" }),
        )));
        channel.inbox.lock().push_back(Err(MockError));
        let handler = SignalingHandler::new(channel);

        let first = handler.receive().await.unwrap();
        assert!(matches!(first, Some(InboundSignal::CallAccepted { .. })));

        let second = handler.receive().await;
        assert!(matches!(second, Err(SignalingError::Channel(_))));

        let closed = handler.receive().await.unwrap();
        assert!(closed.is_none());
    }
}
