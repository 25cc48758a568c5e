//! In-process signaling relay
//!
//! [`LoopbackHub`] stands where the signaling server would: it accepts the
//! outbound events of every connected [`LoopbackChannel`] and delivers the
//! corresponding inbound event to the addressed user, or to the other
//! members of the conversation for events that carry no target.

use crate::identity::{ConversationId, UserId};
use crate::signaling::{ChannelState, InboundSignal, OutboundSignal, RawSignal, SignalingChannel};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Loopback channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    /// Channel marked disconnected
    #[error("Loopback channel disconnected")]
    Disconnected,

    /// Outbound event could not be routed
    #[error("Cannot route event: {0}")]
    Route(String),
}

struct Member {
    display_name: Option<String>,
    inbox: mpsc::UnboundedSender<RawSignal>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<UserId, Member>,
    conversations: HashMap<ConversationId, HashSet<UserId>>,
    sent: Vec<(UserId, RawSignal)>,
}

/// Shared relay between loopback channels
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a user, replacing any earlier connection for the same id
    pub fn connect(&self, user: UserId, display_name: Option<String>) -> Arc<LoopbackChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().members.insert(
            user.clone(),
            Member {
                display_name,
                inbox: tx,
            },
        );
        tracing::debug!(user = %user, "Loopback member connected");
        Arc::new(LoopbackChannel {
            user,
            hub: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        })
    }

    /// Remove a user; their channel then reports closed
    pub fn disconnect(&self, user: &UserId) {
        self.state.lock().members.remove(user);
    }

    /// Add a user to a conversation
    pub fn join(&self, conversation_id: ConversationId, user: UserId) {
        self.state
            .lock()
            .conversations
            .entry(conversation_id)
            .or_default()
            .insert(user);
    }

    /// Deliver an arbitrary inbound event to a user, `false` if not connected
    pub fn deliver_raw(&self, to: &UserId, signal: RawSignal) -> bool {
        match self.state.lock().members.get(to) {
            Some(member) => member.inbox.send(signal).is_ok(),
            None => false,
        }
    }

    /// Deliver a typed inbound event to a user
    pub fn deliver(&self, to: &UserId, signal: &InboundSignal) -> bool {
        match signal.encode() {
            Ok(raw) => self.deliver_raw(to, raw),
            Err(_) => false,
        }
    }

    /// Everything sent through the hub, with the sender
    pub fn sent(&self) -> Vec<(UserId, RawSignal)> {
        self.state.lock().sent.clone()
    }

    /// Event names sent by one user, in order
    pub fn sent_by(&self, user: &UserId) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, raw)| raw.event.clone())
            .collect()
    }

    fn route(&self, from: &UserId, raw: RawSignal) -> Result<(), LoopbackError> {
        let signal =
            OutboundSignal::decode(raw.clone()).map_err(|e| LoopbackError::Route(e.to_string()))?;

        let mut state = self.state.lock();
        state.sent.push((from.clone(), raw));

        let conversation = signal.conversation_id().clone();
        let mut membership = vec![from.clone()];
        if let OutboundSignal::StartCall { target_user_id, .. } = &signal {
            membership.push(target_user_id.clone());
        }
        let members = state.conversations.entry(conversation.clone()).or_default();
        members.extend(membership);

        let caller_display_name = state.members.get(from).and_then(|m| m.display_name.clone());
        let (recipients, inbound) = match signal {
            OutboundSignal::StartCall {
                conversation_id,
                target_user_id,
                media_kind,
                call_id,
            } => (
                vec![target_user_id],
                InboundSignal::IncomingCall {
                    conversation_id,
                    caller_id: from.clone(),
                    caller_display_name,
                    media_kind,
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::SendOffer {
                conversation_id,
                target_user_id,
                description,
                call_id,
            } => (
                vec![target_user_id],
                InboundSignal::ReceiveOffer {
                    from_user_id: from.clone(),
                    data: description,
                    conversation_id: Some(conversation_id),
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::SendAnswer {
                conversation_id,
                target_user_id,
                description,
                call_id,
            } => (
                vec![target_user_id],
                InboundSignal::ReceiveAnswer {
                    from_user_id: from.clone(),
                    data: description,
                    conversation_id: Some(conversation_id),
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::SendIceCandidate {
                conversation_id,
                target_user_id,
                candidate,
                call_id,
            } => (
                vec![target_user_id],
                InboundSignal::ReceiveIceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    from_user_id: Some(from.clone()),
                    conversation_id: Some(conversation_id),
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::AcceptCall {
                conversation_id,
                caller_id,
                call_id,
            } => (
                vec![caller_id],
                InboundSignal::CallAccepted {
                    conversation_id,
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::RejectCall {
                conversation_id,
                caller_id,
                reason,
                call_id,
            } => (
                vec![caller_id],
                InboundSignal::CallRejected {
                    conversation_id,
                    reason,
                    call_id,
                },
            ),
            OutboundSignal::EndCall {
                conversation_id,
                reason,
                call_id,
            } => (
                others(&state, &conversation, from),
                InboundSignal::CallEnded {
                    conversation_id,
                    reason: Some(reason),
                    call_id: Some(call_id),
                },
            ),
            OutboundSignal::ToggleAudio {
                conversation_id,
                muted,
            } => (
                others(&state, &conversation, from),
                InboundSignal::PeerAudioToggled {
                    conversation_id,
                    muted,
                },
            ),
            OutboundSignal::ToggleVideo {
                conversation_id,
                enabled,
            } => (
                others(&state, &conversation, from),
                InboundSignal::PeerVideoToggled {
                    conversation_id,
                    enabled,
                },
            ),
        };

        let raw = inbound
            .encode()
            .map_err(|e| LoopbackError::Route(e.to_string()))?;
        for recipient in recipients {
            match state.members.get(&recipient) {
                Some(member) => {
                    let _ = member.inbox.send(raw.clone());
                }
                None => {
                    tracing::warn!(to = %recipient, event = %raw.event, "Recipient not connected, dropping");
                }
            }
        }
        Ok(())
    }
}

fn others(state: &HubState, conversation: &ConversationId, from: &UserId) -> Vec<UserId> {
    state
        .conversations
        .get(conversation)
        .map(|members| members.iter().filter(|m| *m != from).cloned().collect())
        .unwrap_or_default()
}

/// One user's connection to a [`LoopbackHub`]
pub struct LoopbackChannel {
    user: UserId,
    hub: LoopbackHub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawSignal>>,
    connected: AtomicBool,
}

impl LoopbackChannel {
    /// User this channel belongs to
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    type Error = LoopbackError;

    async fn send(&self, signal: RawSignal) -> Result<(), LoopbackError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LoopbackError::Disconnected);
        }
        self.hub.route(&self.user, signal)
    }

    async fn receive(&self) -> Result<Option<RawSignal>, LoopbackError> {
        Ok(self.inbox.lock().await.recv().await)
    }

    fn connection_state(&self) -> ChannelState {
        if self.connected.load(Ordering::SeqCst) {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallId, MediaKind};

    #[tokio::test]
    async fn test_start_call_becomes_incoming_call() {
        let hub = LoopbackHub::new();
        let alice = hub.connect(UserId::new("alice"), Some("Alice".into()));
        let bob = hub.connect(UserId::new("bob"), None);
        let call_id = CallId::new();

        let raw = OutboundSignal::StartCall {
            conversation_id: ConversationId::new("c1"),
            target_user_id: UserId::new("bob"),
            media_kind: MediaKind::Video,
            call_id,
        }
        .encode()
        .unwrap();
        alice.send(raw).await.unwrap();

        let received = InboundSignal::decode(bob.receive().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            received,
            InboundSignal::IncomingCall {
                conversation_id: ConversationId::new("c1"),
                caller_id: UserId::new("alice"),
                caller_display_name: Some("Alice".into()),
                media_kind: MediaKind::Video,
                call_id: Some(call_id),
            }
        );
    }

    #[tokio::test]
    async fn test_end_call_reaches_other_members_only() {
        let hub = LoopbackHub::new();
        let alice = hub.connect(UserId::new("alice"), None);
        let bob = hub.connect(UserId::new("bob"), None);
        hub.join(ConversationId::new("c1"), UserId::new("bob"));

        let raw = OutboundSignal::EndCall {
            conversation_id: ConversationId::new("c1"),
            reason: "hangup".into(),
            call_id: CallId::new(),
        }
        .encode()
        .unwrap();
        alice.send(raw).await.unwrap();

        let received = bob.receive().await.unwrap().unwrap();
        assert_eq!(received.event, "CallEnded");
        assert_eq!(received.payload["reason"], "hangup");
        assert_eq!(hub.sent_by(&UserId::new("alice")), vec!["EndCall"]);
    }

    #[tokio::test]
    async fn test_disconnected_channel_refuses_send() {
        let hub = LoopbackHub::new();
        let alice = hub.connect(UserId::new("alice"), None);
        alice.set_connected(false);

        let raw = OutboundSignal::ToggleAudio {
            conversation_id: ConversationId::new("c1"),
            muted: true,
        }
        .encode()
        .unwrap();
        assert_eq!(alice.send(raw).await, Err(LoopbackError::Disconnected));
        assert_eq!(alice.connection_state(), ChannelState::Disconnected);
    }
}
