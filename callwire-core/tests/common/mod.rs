//! Shared fixtures: two coordinators running over a loopback relay

#![allow(dead_code)]

use callwire_core::loopback::{LoopbackChannel, LoopbackHub};
use callwire_core::sim::{SimulatedTransportFactory, SyntheticMediaSource};
use callwire_core::{
    CallCoordinator, CallEvent, CallHandle, ConversationId, CoordinatorConfig, MediaManager,
    SignalingHandler, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One running coordinator and everything needed to observe it
pub struct Side {
    pub user: UserId,
    pub calls: CallHandle,
    pub events: broadcast::Receiver<CallEvent>,
    pub channel: Arc<LoopbackChannel>,
    pub source: Arc<SyntheticMediaSource>,
    pub factory: Arc<SimulatedTransportFactory>,
    pub media: MediaManager,
}

impl Side {
    /// Wait for the first event matching `pred`, skipping others
    pub async fn expect_event<F>(&mut self, mut pred: F) -> CallEvent
    where
        F: FnMut(&CallEvent) -> bool,
    {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        };
        tokio::time::timeout(EVENT_TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for event", self.user))
    }

    /// Collect events emitted within `window`
    pub async fn drain_for(&mut self, window: Duration) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(Ok(event)) = tokio::time::timeout(window, self.events.recv()).await {
            events.push(event);
        }
        events
    }
}

pub fn conversation() -> ConversationId {
    ConversationId::new("c1")
}

/// Build and start a coordinator on `hub`
pub fn spawn_side(hub: &LoopbackHub, name: &str, config: CoordinatorConfig) -> Side {
    spawn_side_with(hub, name, config, Arc::new(SimulatedTransportFactory::new()))
}

pub fn spawn_side_with(
    hub: &LoopbackHub,
    name: &str,
    config: CoordinatorConfig,
    factory: Arc<SimulatedTransportFactory>,
) -> Side {
    spawn_side_from(
        hub,
        name,
        config,
        Arc::new(SyntheticMediaSource::new()),
        factory,
    )
}

/// Test log output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn spawn_side_from(
    hub: &LoopbackHub,
    name: &str,
    config: CoordinatorConfig,
    source: Arc<SyntheticMediaSource>,
    factory: Arc<SimulatedTransportFactory>,
) -> Side {
    init_tracing();
    let user = UserId::new(name);
    let channel = hub.connect(user.clone(), Some(name.to_uppercase()));
    let coordinator = CallCoordinator::builder(
        user.clone(),
        Arc::new(SignalingHandler::new(channel.clone())),
        source.clone(),
        factory.clone(),
    )
    .with_config(config)
    .build()
    .unwrap();

    let calls = coordinator.handle();
    let events = coordinator.subscribe_events();
    let media = coordinator.media().clone();
    tokio::spawn(coordinator.run());

    Side {
        user,
        calls,
        events,
        channel,
        source,
        factory,
        media,
    }
}

/// alice and bob sharing a hub
pub fn pair(config: CoordinatorConfig) -> (LoopbackHub, Side, Side) {
    let hub = LoopbackHub::new();
    let alice = spawn_side(&hub, "alice", config.clone());
    let bob = spawn_side(&hub, "bob", config);
    (hub, alice, bob)
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        gathering_timeout_ms: 1_000,
        retry_backoff_ms: 10,
        ..Default::default()
    }
}

/// alice calls bob and bob answers; returns once both sides are connected
pub async fn connect_call(
    alice: &mut Side,
    bob: &mut Side,
    kind: callwire_core::MediaKind,
) -> callwire_core::CallId {
    let call_id = alice
        .calls
        .start_call(conversation(), bob.user.clone(), kind)
        .await
        .unwrap();
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.calls.accept_call(call_id).await.unwrap();
    alice
        .expect_event(|e| matches!(e, CallEvent::Connected { .. }))
        .await;
    bob.expect_event(|e| matches!(e, CallEvent::Connected { .. }))
        .await;
    call_id
}

/// Reason carried by the next `CallEnded`
pub async fn ended_reason(side: &mut Side) -> callwire_core::EndReason {
    match side
        .expect_event(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await
    {
        CallEvent::CallEnded { reason, .. } => reason,
        _ => unreachable!(),
    }
}
