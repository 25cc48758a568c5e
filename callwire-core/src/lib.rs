//! Callwire - one-to-one audio/video call engine
//!
//! This library coordinates the lifecycle of a single call between two users
//! of a chat application. It features:
//!
//! - **Single call authority**: [`CallCoordinator`] owns the call state and
//!   enforces that at most one call exists at a time
//! - **Pluggable signaling**: any [`SignalingChannel`] carrying the
//!   event-named JSON messages of the relay server
//! - **Peer negotiation**: [`PeerSession`] drives offer/answer and candidate
//!   exchange over a [`PeerTransport`] (`webrtc` crate backend behind the
//!   `webrtc-backend` feature)
//! - **Device accounting**: [`MediaManager`] guarantees every acquisition is
//!   paired with exactly one release
//!
//! # Examples
//!
//! ```rust,no_run
//! use callwire_core::prelude::*;
//! use callwire_core::loopback::LoopbackHub;
//! use callwire_core::sim::{SimulatedTransportFactory, SyntheticMediaSource};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = LoopbackHub::new();
//! let channel = hub.connect(UserId::new("alice"), Some("Alice".into()));
//!
//! let coordinator = CallCoordinator::builder(
//!     UserId::new("alice"),
//!     Arc::new(SignalingHandler::new(channel)),
//!     Arc::new(SyntheticMediaSource::new()),
//!     Arc::new(SimulatedTransportFactory::new()),
//! )
//! .with_config(CoordinatorConfig::default())
//! .build()?;
//!
//! let calls = coordinator.handle();
//! tokio::spawn(coordinator.run());
//!
//! let call_id = calls
//!     .start_call(ConversationId::new("c1"), UserId::new("bob"), MediaKind::Video)
//!     .await?;
//! println!("placed call {}", call_id);
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
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::new_without_default)]

/// Core call types and data structures
pub mod types;

/// User and conversation identifiers
pub mod identity;

/// Coordinator configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// Local media acquisition and release
pub mod media;

/// Peer negotiation sessions
pub mod peer;

/// Call coordination
pub mod call;

/// In-process signaling relay
pub mod loopback;

/// Simulated transports and synthetic capture devices
pub mod sim;

/// `webrtc` crate peer transport (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

// Re-export main types at crate root
pub use call::{
    CallCoordinator, CallCoordinatorBuilder, CallError, CallHandle, CallPhase, CallSnapshot,
};
pub use config::{ConfigError, CoordinatorConfig, IceServerConfig};
pub use identity::{ConversationId, UserId};
pub use media::{
    LocalMediaHandle, MediaError, MediaManager, MediaSink, MediaSource, MediaStats, MediaTrack,
};
pub use peer::{
    NegotiationState, PeerError, PeerSession, PeerTransport, PeerTransportFactory, SessionEvent,
    SessionHandle, TransportEvent,
};
pub use signaling::{
    ChannelState, InboundSignal, OutboundSignal, RawSignal, SignalingChannel, SignalingError,
    SignalingHandler,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallCoordinator, CallError, CallHandle, CallPhase};
    pub use crate::config::CoordinatorConfig;
    pub use crate::identity::{ConversationId, UserId};
    pub use crate::media::{MediaSink, MediaSource};
    pub use crate::peer::PeerTransportFactory;
    pub use crate::signaling::{SignalingChannel, SignalingHandler};
    pub use crate::types::{CallEvent, CallId, CallSession, EndReason, MediaKind};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_transport::WebRtcTransportFactory;
}
