//! `webrtc` crate backend for [`PeerTransport`]
//!
//! Each transport wraps one `RTCPeerConnection`. Local capture tracks are
//! mirrored as `TrackLocalStaticSample`s; the capture pipeline writes
//! encoded samples into them through [`WebRtcTransport::local_track`].

use crate::config::IceServerConfig;
use crate::media::MediaTrack;
use crate::peer::{PeerError, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::types::{IceCandidate, RemoteTrack, SdpType, SessionDescription, TrackKind, TransportState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const LOCAL_STREAM_ID: &str = "callwire";

fn transport_error(context: &str, e: impl std::fmt::Display) -> PeerError {
    tracing::error!("{}: {}", context, e);
    PeerError::Transport(format!("{}: {}", context, e))
}

/// Creates `RTCPeerConnection`-backed transports
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), PeerError> {
        let (transport, events) = WebRtcTransport::connect(ice_servers).await?;
        Ok((transport, events))
    }
}

/// One `RTCPeerConnection`
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcTransport {
    /// Open a peer connection and wire its callbacks to an event channel
    ///
    /// # Errors
    ///
    /// Returns error if the media engine or peer connection cannot be built
    pub async fn connect(
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| transport_error("Failed to register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| transport_error("Failed to register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let configuration = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(configuration)
                .await
                .map_err(|e| transport_error("Failed to create peer connection", e))?,
        );
        tracing::debug!(ice_servers = ice_servers.len(), "Created peer connection");

        let (tx, rx) = mpsc::unbounded_channel();
        register_handlers(&peer_connection, tx);

        Ok((
            Arc::new(Self {
                peer_connection,
                gathering: tokio::sync::Mutex::new(None),
                local_tracks: Mutex::new(HashMap::new()),
            }),
            rx,
        ))
    }

    /// Outgoing sample track mirroring the local capture track `id`
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }

    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<TransportEvent>) {
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => Some(TransportState::New),
            RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
            RTCPeerConnectionState::Connected => Some(TransportState::Connected),
            RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
            RTCPeerConnectionState::Failed => Some(TransportState::Failed),
            RTCPeerConnectionState::Closed => Some(TransportState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        if let Some(mapped) = mapped {
            tracing::debug!(state = ?mapped, "Peer connection state changed");
            let _ = state_events.send(TransportEvent::StateChanged(mapped));
        }
        Box::pin(async {})
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::debug!(track = %track.id(), stream = %track.stream_id(), ?kind, "Remote track");
        let _ = events.send(TransportEvent::RemoteTrack {
            stream_id: track.stream_id(),
            track: RemoteTrack {
                id: track.id(),
                kind,
            },
        });
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::InvalidDescription(format!(
            "unsupported description type {:?}",
            other
        ))),
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_local_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            LOCAL_STREAM_ID.to_string(),
        ));
        let local: Arc<dyn TrackLocal + Send + Sync> = sample_track.clone();
        self.peer_connection
            .add_track(local)
            .await
            .map_err(|e| transport_error("Failed to add local track", e))?;
        self.local_tracks
            .lock()
            .insert(track.id().to_string(), sample_track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| transport_error("Failed to create offer", e))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| transport_error("Failed to create answer", e))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc(desc)?;
        // The promise must exist before gathering starts
        let gathering = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| transport_error("Failed to set local description", e))?;
        *self.gathering.lock().await = Some(gathering);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| transport_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| transport_error("Failed to add ICE candidate", e))
    }

    async fn gathering_complete(&self) -> Result<(), PeerError> {
        let mut gathering = self.gathering.lock().await;
        if let Some(done) = gathering.as_mut() {
            let _ = done.recv().await;
        }
        *gathering = None;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.peer_connection.local_description().await?;
        from_rtc(desc).ok()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.local_tracks.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| transport_error("Failed to close peer connection", e))
    }
}
