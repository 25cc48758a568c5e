//! Integration tests for end-to-end call flows over the loopback relay

mod common;

use callwire_core::loopback::LoopbackHub;
use callwire_core::sim::{SimulatedTransportFactory, SyntheticMediaSource};
use callwire_core::{
    CallCoordinator, CallEvent, CallId, CallPhase, CoordinatorConfig, EndReason, MediaKind,
    MediaSink, RemoteStream, SignalingHandler, UserId,
};
use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    log: Mutex<Vec<String>>,
}

impl MediaSink for RecordingSink {
    fn attach(&self, _call_id: CallId, stream: &RemoteStream) {
        self.log
            .lock()
            .push(format!("attach {} ({} tracks)", stream.id, stream.tracks.len()));
    }

    fn detach(&self, _call_id: CallId) {
        self.log.lock().push("detach".to_string());
    }
}

#[tokio::test]
async fn media_toggles_reach_the_peer() {
    let (_hub, mut alice, mut bob) = pair(test_config());
    connect_call(&mut alice, &mut bob, MediaKind::Video).await;

    alice.calls.set_audio_enabled(false).await.unwrap();
    alice.calls.set_video_enabled(false).await.unwrap();

    let local = alice
        .expect_event(|e| {
            matches!(
                e,
                CallEvent::LocalMediaChanged {
                    video_enabled: false,
                    ..
                }
            )
        })
        .await;
    assert!(matches!(
        local,
        CallEvent::LocalMediaChanged {
            audio_enabled: false,
            video_enabled: false,
            ..
        }
    ));
    let handle = alice.media.handle().unwrap();
    assert!(!handle.audio_enabled());
    assert!(!handle.video_enabled());

    let muted = bob
        .expect_event(|e| matches!(e, CallEvent::RemoteMediaChanged { audio_muted: Some(_), .. }))
        .await;
    assert!(matches!(
        muted,
        CallEvent::RemoteMediaChanged {
            audio_muted: Some(true),
            ..
        }
    ));
    let camera = bob
        .expect_event(|e| matches!(e, CallEvent::RemoteMediaChanged { video_enabled: Some(_), .. }))
        .await;
    assert!(matches!(
        camera,
        CallEvent::RemoteMediaChanged {
            video_enabled: Some(false),
            ..
        }
    ));

    alice.calls.set_audio_enabled(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(alice.media.handle().unwrap().audio_enabled());
    assert_eq!(alice.source.acquisitions(), 1);
}

#[tokio::test]
async fn mute_before_connect_is_applied_to_acquired_tracks() {
    let (_hub, mut alice, mut bob) = pair(test_config());
    let call_id = alice
        .calls
        .start_call(conversation(), bob.user.clone(), MediaKind::Audio)
        .await
        .unwrap();
    alice.calls.set_audio_enabled(false).await.unwrap();

    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.calls.accept_call(call_id).await.unwrap();
    alice
        .expect_event(|e| matches!(e, CallEvent::Connected { .. }))
        .await;

    assert!(!alice.media.handle().unwrap().audio_enabled());
}

#[tokio::test]
async fn remote_stream_attached_and_detached() {
    let hub = LoopbackHub::new();
    let sink = Arc::new(RecordingSink::default());
    let alice_user = UserId::new("alice");
    let channel = hub.connect(alice_user.clone(), None);
    let coordinator = CallCoordinator::builder(
        alice_user.clone(),
        Arc::new(SignalingHandler::new(channel)),
        Arc::new(SyntheticMediaSource::new()),
        Arc::new(SimulatedTransportFactory::new()),
    )
    .with_config(test_config())
    .with_media_sink(sink.clone())
    .build()
    .unwrap();
    let alice_calls = coordinator.handle();
    let mut alice_events = coordinator.subscribe_events();
    tokio::spawn(coordinator.run());
    let mut bob = spawn_side(&hub, "bob", test_config());

    let call_id = alice_calls
        .start_call(conversation(), bob.user.clone(), MediaKind::Video)
        .await
        .unwrap();
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    bob.calls.accept_call(call_id).await.unwrap();
    alice_calls.wait_for_phase(CallPhase::Active).await.unwrap();

    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, alice_events.recv())
            .await
            .unwrap()
            .unwrap();
        if let CallEvent::RemoteStream { stream, .. } = event {
            if stream.tracks.len() == 2 {
                assert!(stream.has_video());
                break;
            }
        }
    }

    bob.calls.end_call().await.unwrap();
    alice_calls.wait_for_phase(CallPhase::Idle).await.unwrap();

    let log = sink.log.lock().clone();
    assert_eq!(log.last().map(String::as_str), Some("detach"));
    assert!(log[0].starts_with("attach"));
    assert_eq!(log.iter().filter(|l| *l == "detach").count(), 1);
}

#[tokio::test]
async fn shutdown_hangs_up_active_call() {
    let (_hub, mut alice, mut bob) = pair(test_config());
    connect_call(&mut alice, &mut bob, MediaKind::Audio).await;

    alice.calls.shutdown().await;
    assert_eq!(ended_reason(&mut alice).await, EndReason::Shutdown);
    assert_eq!(
        ended_reason(&mut bob).await,
        EndReason::PeerEnded {
            reason: Some("shutdown".to_string())
        }
    );
    assert_eq!(alice.source.live_tracks(), 0);
    assert_eq!(
        alice.calls.start_call(conversation(), bob.user.clone(), MediaKind::Audio).await,
        Err(callwire_core::CallError::CoordinatorClosed)
    );
}

#[tokio::test]
async fn trickle_ice_forwards_local_candidates() {
    let config = CoordinatorConfig {
        trickle_ice: true,
        ..test_config()
    };
    let (hub, mut alice, mut bob) = pair(config);
    connect_call(&mut alice, &mut bob, MediaKind::Audio).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let alice_sent = hub.sent_by(&alice.user);
    assert_eq!(
        alice_sent.iter().filter(|e| *e == "SendIceCandidate").count(),
        2
    );
    // Trickled candidates reach bob ahead of the offer and are applied once it lands
    let applied = bob.factory.last_probe().unwrap().applied_candidates();
    assert_eq!(applied.len(), 2);
}

#[tokio::test]
async fn calls_can_follow_each_other() {
    let (_hub, mut alice, mut bob) = pair(test_config());
    let first = connect_call(&mut alice, &mut bob, MediaKind::Audio).await;
    alice.calls.end_call().await.unwrap();
    ended_reason(&mut bob).await;

    let second = connect_call(&mut alice, &mut bob, MediaKind::Video).await;
    assert_ne!(first, second);
    assert_eq!(alice.source.acquisitions(), 2);
    assert_eq!(alice.media.stats().releases, 1);

    bob.calls.end_call().await.unwrap();
    ended_reason(&mut alice).await;
    assert_eq!(alice.media.stats().outstanding(), 0);
    assert_eq!(bob.media.stats().outstanding(), 0);
}
