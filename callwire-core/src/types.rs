//! Call engine types and data structures

use crate::identity::{ConversationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media requested for a call, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl MediaKind {
    /// Whether a camera track is requested
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Kind of a single media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone / audio track
    Audio,
    /// Camera / video track
    Video,
}

/// Side of the call this process plays, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Placed the call and creates the offer
    Caller,
    /// Received the call and answers the offer
    Callee,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Opaque negotiation blob plus its role in the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Check if this is an offer
    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    /// Check if this is an answer
    pub fn is_answer(&self) -> bool {
        self.sdp_type == SdpType::Answer
    }
}

/// ICE candidate describing one possible network path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Connection state reported by the underlying peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Not started
    New,
    /// Establishing connectivity
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed permanently
    Failed,
    /// Closed locally
    Closed,
}

impl Default for TransportState {
    fn default() -> Self {
        Self::New
    }
}

/// One track of a remote stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

/// Remote media stream produced by a completed negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Tracks currently carried by the stream
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Insert a track, replacing any previous track with the same id
    pub fn upsert_track(&mut self, track: RemoteTrack) {
        if let Some(existing) = self.tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
        } else {
            self.tracks.push(track);
        }
    }

    /// Check if the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

/// Record of one call attempt, from intent to teardown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier, shared with the remote side when the wire carries it
    pub id: CallId,
    /// Chat context of the call
    pub conversation_id: ConversationId,
    /// The other participant
    pub peer_user_id: UserId,
    /// Display name of the other participant, when known
    pub peer_display_name: Option<String>,
    /// Caller or callee
    pub role: CallRole,
    /// Audio or video
    pub media_kind: MediaKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When media started flowing
    pub connected_at: Option<DateTime<Utc>>,
    /// When the session was torn down
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a new call session
    pub fn new(
        id: CallId,
        conversation_id: ConversationId,
        peer_user_id: UserId,
        role: CallRole,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            id,
            conversation_id,
            peer_user_id,
            peer_display_name: None,
            role,
            media_kind,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    /// Get connected duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }
}

/// Why a call returned to idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Local user cancelled an outgoing call
    Cancelled,
    /// Local user declined an incoming call
    Declined,
    /// Outgoing call was not accepted in time
    NoAnswer,
    /// Remote side rejected the call
    PeerRejected {
        /// Reason given by the remote side
        reason: Option<String>,
    },
    /// Remote side ended the call
    PeerEnded {
        /// Reason given by the remote side
        reason: Option<String>,
    },
    /// Local capture devices could not be acquired
    DeviceFailed(String),
    /// Signaling channel failed
    SignalingFailed(String),
    /// Offer/answer/candidate negotiation failed
    NegotiationFailed(String),
    /// Coordinator shut down
    Shutdown,
}

impl EndReason {
    /// Reason string carried by `EndCall` / `RejectCall`
    pub fn wire_reason(&self) -> &str {
        match self {
            Self::LocalHangup => "hangup",
            Self::Cancelled => "cancelled",
            Self::Declined => "Declined by user",
            Self::NoAnswer => "no-answer",
            Self::PeerRejected { reason } => reason.as_deref().unwrap_or("rejected"),
            Self::PeerEnded { reason } => reason.as_deref().unwrap_or("ended"),
            Self::DeviceFailed(_) => "device-error",
            Self::SignalingFailed(_) => "signaling-error",
            Self::NegotiationFailed(_) => "negotiation-failed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the call ended because something went wrong
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceFailed(_) | Self::SignalingFailed(_) | Self::NegotiationFailed(_)
        )
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceFailed(detail)
            | Self::SignalingFailed(detail)
            | Self::NegotiationFailed(detail) => {
                write!(f, "{}: {}", self.wire_reason(), detail)
            }
            other => f.write_str(other.wire_reason()),
        }
    }
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Outgoing call placed
    CallPlaced {
        /// The new session
        session: CallSession,
    },
    /// Incoming call received
    IncomingCall {
        /// The pending session
        session: CallSession,
    },
    /// Remote side accepted our call
    CallAccepted {
        /// Call identifier
        call_id: CallId,
    },
    /// Media connection established
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Underlying transport changed state
    ConnectionStateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: TransportState,
    },
    /// Remote stream arrived or was replaced
    RemoteStream {
        /// Call identifier
        call_id: CallId,
        /// The stream to render
        stream: RemoteStream,
    },
    /// Local track enablement changed
    LocalMediaChanged {
        /// Call identifier
        call_id: CallId,
        /// Microphone enabled
        audio_enabled: bool,
        /// Camera enabled
        video_enabled: bool,
    },
    /// Remote side toggled its media
    RemoteMediaChanged {
        /// Call identifier
        call_id: CallId,
        /// Remote microphone muted, if reported
        audio_muted: Option<bool>,
        /// Remote camera enabled, if reported
        video_enabled: Option<bool>,
    },
    /// Incoming call auto-rejected because another call is in progress
    BusyRejected {
        /// Conversation of the rejected call
        conversation_id: ConversationId,
        /// Who called
        caller_id: UserId,
    },
    /// Call returned to idle
    CallEnded {
        /// Final session record
        session: CallSession,
        /// Why it ended
        reason: EndReason,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_display() {
        assert_eq!(EndReason::NoAnswer.to_string(), "no-answer");
        assert_eq!(
            EndReason::PeerRejected {
                reason: Some("busy".into())
            }
            .to_string(),
            "busy"
        );
        assert_eq!(
            EndReason::DeviceFailed("permission denied".into()).to_string(),
            "device-error: permission denied"
        );
    }

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_media_kind() {
        assert!(!MediaKind::Audio.wants_video());
        assert!(MediaKind::Video.wants_video());
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
    }

    #[test]
    fn test_session_description_wire_shape() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
        assert!(offer.is_offer());
        assert!(!offer.is_answer());
    }

    #[test]
    fn test_ice_candidate_wire_shape() {
        let json = serde_json::json!({
            "candidate": "candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let candidate: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let bare: IceCandidate =
            serde_json::from_value(serde_json::json!({ "candidate": "candidate:2" })).unwrap();
        assert_eq!(bare, IceCandidate::new("candidate:2"));
    }

    #[test]
    fn test_remote_stream_upsert_replaces() {
        let mut stream = RemoteStream::new("s1");
        stream.upsert_track(RemoteTrack {
            id: "a".into(),
            kind: TrackKind::Audio,
        });
        stream.upsert_track(RemoteTrack {
            id: "a".into(),
            kind: TrackKind::Audio,
        });
        stream.upsert_track(RemoteTrack {
            id: "v".into(),
            kind: TrackKind::Video,
        });
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.has_video());
    }

    #[test]
    fn test_call_session_duration() {
        let mut session = CallSession::new(
            CallId::new(),
            ConversationId::new("c1"),
            UserId::new("bob"),
            CallRole::Caller,
            MediaKind::Audio,
        );
        assert!(session.duration().is_none());

        let start = Utc::now();
        session.connected_at = Some(start);
        session.ended_at = Some(start + chrono::Duration::seconds(30));
        assert_eq!(session.duration(), Some(chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_end_reason_wire_strings() {
        assert_eq!(EndReason::Declined.wire_reason(), "Declined by user");
        assert_eq!(EndReason::Cancelled.wire_reason(), "cancelled");
        assert_eq!(
            EndReason::PeerEnded {
                reason: Some("remote-hangup".into())
            }
            .wire_reason(),
            "remote-hangup"
        );
        assert!(EndReason::NegotiationFailed("x".into()).is_failure());
        assert!(!EndReason::LocalHangup.is_failure());
    }
}
