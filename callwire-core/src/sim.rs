//! Deterministic in-process peer transport and media source
//!
//! Used by the test suites and the CLI demo. The simulated transport
//! produces SDP-looking descriptions, gathers a fixed number of host
//! candidates and reports itself connected once both descriptions are set.
//! Unlike a lenient implementation it refuses remote candidates while no
//! remote description exists, so ordering mistakes show up as errors.

use crate::config::IceServerConfig;
use crate::media::{MediaError, MediaSource, MediaTrack};
use crate::peer::{PeerError, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::types::{
    IceCandidate, RemoteTrack, SdpType, SessionDescription, TrackKind, TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Knobs for [`SimulatedTransport`]
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Reject every remote description
    pub fail_remote_description: bool,
    /// Never finish gathering
    pub stall_gathering: bool,
    /// Report `Connected` once both descriptions are set
    pub auto_connect: bool,
    /// Host candidates produced per gathering round
    pub candidates_per_gathering: usize,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            fail_remote_description: false,
            stall_gathering: false,
            auto_connect: true,
            candidates_per_gathering: 2,
        }
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    applied_candidates: Vec<IceCandidate>,
    remote_descriptions: Vec<SdpType>,
    local_tracks: Vec<TrackKind>,
    close_calls: usize,
}

/// Observer for what a transport was asked to do
#[derive(Debug, Clone, Default)]
pub struct TransportProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl TransportProbe {
    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Types of the remote descriptions applied
    pub fn remote_descriptions(&self) -> Vec<SdpType> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Kinds of the local tracks added
    pub fn local_tracks(&self) -> Vec<TrackKind> {
        self.state.lock().local_tracks.clone()
    }

    /// Number of close calls
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Check if the transport was closed
    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

#[derive(Debug, Default)]
struct SimState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    gathered: Vec<String>,
    gathering_done: bool,
    connected: bool,
    closed: bool,
}

/// Simulated peer transport
#[derive(Debug)]
pub struct SimulatedTransport {
    behavior: SimBehavior,
    label: String,
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    probe: TransportProbe,
}

impl SimulatedTransport {
    /// Create a transport and its event stream
    pub fn new(behavior: SimBehavior) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            behavior,
            label: uuid::Uuid::new_v4().simple().to_string(),
            state: Mutex::new(SimState::default()),
            events,
            probe: TransportProbe::default(),
        });
        (transport, rx)
    }

    /// Observer for this transport
    pub fn probe(&self) -> TransportProbe {
        self.probe.clone()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn describe(&self, sdp_type: SdpType) -> String {
        let mut sdp = format!(
            "v=0\r\no=sim-{} 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.label
        );
        for kind in self.probe.local_tracks() {
            match kind {
                TrackKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n"),
                TrackKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n"),
            }
        }
        let setup = match sdp_type {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        sdp.push_str(&format!("a=setup:{}\r\n", setup));
        sdp
    }

    fn maybe_connect(&self) {
        let remote_sdp = {
            let mut state = self.state.lock();
            if !self.behavior.auto_connect
                || state.connected
                || state.closed
                || state.local.is_none()
            {
                return;
            }
            let Some(remote) = state.remote.as_ref() else {
                return;
            };
            let sdp = remote.sdp.clone();
            state.connected = true;
            sdp
        };

        self.emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.emit(TransportEvent::StateChanged(TransportState::Connected));

        let stream_id = format!("remote-{}", self.label);
        for (index, line) in remote_sdp.lines().filter(|l| l.starts_with("m=")).enumerate() {
            let kind = if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            self.emit(TransportEvent::RemoteTrack {
                stream_id: stream_id.clone(),
                track: RemoteTrack {
                    id: format!("{}-track-{}", stream_id, index),
                    kind,
                },
            });
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.lock().closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    async fn add_local_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.probe.state.lock().local_tracks.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.describe(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(PeerError::Transport(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(self.describe(SdpType::Answer)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            state.local = Some(desc);
            state.gathering_done = false;
            state.gathered.clear();
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.behavior.fail_remote_description {
            return Err(PeerError::InvalidDescription(
                "remote description rejected".to_string(),
            ));
        }
        self.probe.state.lock().remote_descriptions.push(desc.sdp_type);
        self.state.lock().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(PeerError::Transport(
                "remote description not set".to_string(),
            ));
        }
        self.probe.state.lock().applied_candidates.push(candidate);
        Ok(())
    }

    async fn gathering_complete(&self) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.behavior.stall_gathering {
            std::future::pending::<()>().await;
        }

        let fresh = {
            let mut state = self.state.lock();
            if state.local.is_none() {
                return Err(PeerError::Transport(
                    "no local description to gather for".to_string(),
                ));
            }
            if state.gathering_done {
                Vec::new()
            } else {
                state.gathering_done = true;
                let candidates: Vec<String> = (0..self.behavior.candidates_per_gathering)
                    .map(|i| {
                        format!(
                            "candidate:{} 1 UDP 2122260223 127.0.0.1 {} typ host",
                            i + 1,
                            50000 + i
                        )
                    })
                    .collect();
                state.gathered = candidates.clone();
                candidates
            }
        };

        for candidate in fresh {
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate,
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        let local = state.local.as_ref()?;
        let mut desc = local.clone();
        if state.gathering_done {
            for candidate in &state.gathered {
                desc.sdp.push_str(&format!("a={}\r\n", candidate));
            }
            desc.sdp.push_str("a=end-of-candidates\r\n");
        }
        Some(desc)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state.lock().closed = true;
        self.probe.state.lock().close_calls += 1;
        Ok(())
    }
}

/// Factory producing [`SimulatedTransport`]s
#[derive(Debug, Default)]
pub struct SimulatedTransportFactory {
    behavior: Mutex<SimBehavior>,
    probes: Mutex<Vec<TransportProbe>>,
    fail_next: AtomicBool,
}

impl SimulatedTransportFactory {
    /// Create a factory with default behavior
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with the given behavior
    pub fn with_behavior(behavior: SimBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Default::default()
        }
    }

    /// Change behavior for transports created from now on
    pub fn set_behavior(&self, behavior: SimBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Make the next `create` fail
    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Probes of all transports created so far
    pub fn probes(&self) -> Vec<TransportProbe> {
        self.probes.lock().clone()
    }

    /// Probe of the most recent transport
    pub fn last_probe(&self) -> Option<TransportProbe> {
        self.probes.lock().last().cloned()
    }

    /// Number of transports created
    pub fn created(&self) -> usize {
        self.probes.lock().len()
    }
}

#[async_trait]
impl PeerTransportFactory for SimulatedTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), PeerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Transport(
                "simulated transport creation failure".to_string(),
            ));
        }
        let behavior = self.behavior.lock().clone();
        let (transport, events) = SimulatedTransport::new(behavior);
        self.probes.lock().push(transport.probe());
        Ok((transport, events))
    }
}

#[derive(Debug, Default)]
struct MediaCounters {
    acquire_calls: AtomicUsize,
    acquisitions: AtomicUsize,
    tracks_opened: AtomicUsize,
    tracks_stopped: AtomicUsize,
}

/// Synthetic capture track
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    counters: Arc<MediaCounters>,
}

impl SyntheticTrack {
    /// Check if the track was stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.counters.tracks_stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Synthetic capture source that counts device opens and stops
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    counters: Arc<MediaCounters>,
    fail_with: Mutex<Option<MediaError>>,
    gate: Option<Arc<Semaphore>>,
}

impl SyntheticMediaSource {
    /// Create a source that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source that fails every acquisition
    pub fn failing(error: MediaError) -> Self {
        let source = Self::default();
        *source.fail_with.lock() = Some(error);
        source
    }

    /// Create a source whose acquisitions each wait for a permit on the gate
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let source = Self {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        (source, gate)
    }

    /// Set or clear the failure returned by acquisitions
    pub fn set_failure(&self, error: Option<MediaError>) {
        *self.fail_with.lock() = error;
    }

    /// Calls to `acquire`, including pending and failed ones
    pub fn acquire_calls(&self) -> usize {
        self.counters.acquire_calls.load(Ordering::SeqCst)
    }

    /// Successful acquisitions
    pub fn acquisitions(&self) -> usize {
        self.counters.acquisitions.load(Ordering::SeqCst)
    }

    /// Tracks opened
    pub fn tracks_opened(&self) -> usize {
        self.counters.tracks_opened.load(Ordering::SeqCst)
    }

    /// Tracks stopped
    pub fn tracks_stopped(&self) -> usize {
        self.counters.tracks_stopped.load(Ordering::SeqCst)
    }

    /// Tracks opened and not yet stopped
    pub fn live_tracks(&self) -> usize {
        self.tracks_opened().saturating_sub(self.tracks_stopped())
    }

    fn open(&self, kind: TrackKind) -> Arc<dyn MediaTrack> {
        self.counters.tracks_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(SyntheticTrack {
            id: format!("{:?}-{}", kind, uuid::Uuid::new_v4().simple()).to_lowercase(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            counters: self.counters.clone(),
        })
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, want_video: bool) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        self.counters.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| MediaError::Closed)?;
            permit.forget();
        }
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }

        let mut tracks = vec![self.open(TrackKind::Audio)];
        if want_video {
            tracks.push(self.open(TrackKind::Video));
        }
        self.counters.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(tracks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_refused() {
        let (transport, _events) = SimulatedTransport::new(SimBehavior::default());
        let res = transport.add_ice_candidate(IceCandidate::new("candidate:1")).await;
        assert!(matches!(res, Err(PeerError::Transport(_))));

        transport
            .set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        transport
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        assert_eq!(transport.probe().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_connects_once_both_descriptions_set() {
        let (transport, mut events) = SimulatedTransport::new(SimBehavior::default());
        transport
            .set_remote_description(SessionDescription::offer("v=0\r\nm=audio 9 X 111\r\n"))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        let answer = transport.create_answer().await.unwrap();
        transport.set_local_description(answer).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TransportEvent::StateChanged(TransportState::Connected)));
        assert!(seen
            .iter()
            .any(|e| matches!(e, TransportEvent::RemoteTrack { track, .. } if track.kind == TrackKind::Audio)));
    }

    #[tokio::test]
    async fn test_track_stop_counted_once() {
        let source = SyntheticMediaSource::new();
        let tracks = source.acquire(true).await.unwrap();
        assert_eq!(source.live_tracks(), 2);

        tracks[0].stop();
        tracks[0].stop();
        assert_eq!(source.tracks_stopped(), 1);
        assert!(!tracks[0].is_enabled());
    }

    #[tokio::test]
    async fn test_factory_failure_is_one_shot() {
        let factory = SimulatedTransportFactory::new();
        factory.fail_next_create();
        assert!(factory.create(&[]).await.is_err());
        assert!(factory.create(&[]).await.is_ok());
        assert_eq!(factory.created(), 1);
    }
}
