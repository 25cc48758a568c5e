//! Local media resource management
//!
//! The [`MediaManager`] owns the single live [`LocalMediaHandle`] of the
//! process. Capture devices sit behind the [`MediaSource`] contract and
//! rendering behind [`MediaSink`]; both are implemented outside the crate
//! (see [`crate::sim`] for in-process versions).

use crate::types::{CallId, MediaKind, RemoteStream, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Capture device missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// User or platform refused device access
    #[error("Permission denied")]
    PermissionDenied,

    /// Acquisition resolved after the handle was released
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Media source has shut down
    #[error("Media source closed")]
    Closed,
}

/// One live capture track
pub trait MediaTrack: Send + Sync + std::fmt::Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Audio or video
    fn kind(&self) -> TrackKind;

    /// Enable or disable the track without releasing the device
    fn set_enabled(&self, enabled: bool);

    /// Whether the track currently produces media
    fn is_enabled(&self) -> bool;

    /// Stop the track and release its device
    fn stop(&self);
}

/// Capture device provider
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open an audio track, plus a video track when `want_video` is set
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` or `PermissionDenied` when devices cannot
    /// be opened
    async fn acquire(&self, want_video: bool) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError>;
}

/// Renderer for remote streams
pub trait MediaSink: Send + Sync {
    /// Start rendering a remote stream, replacing any earlier one for the call
    fn attach(&self, call_id: CallId, stream: &RemoteStream);

    /// Stop rendering for the call
    fn detach(&self, call_id: CallId);
}

/// Acquired capture devices for one session
#[derive(Debug, Clone)]
pub struct LocalMediaHandle {
    id: String,
    media_kind: MediaKind,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMediaHandle {
    fn new(media_kind: MediaKind, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            media_kind,
            tracks,
        }
    }

    /// Local stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind the handle was acquired for
    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    /// Whether the microphone is enabled
    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Audio)
    }

    /// Whether the camera is enabled
    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Video)
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        let mut of_kind = self.tracks.iter().filter(|t| t.kind() == kind).peekable();
        of_kind.peek().is_some() && of_kind.all(|t| t.is_enabled())
    }

    fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquire/release bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    /// Handles created
    pub acquisitions: u64,
    /// Handles released
    pub releases: u64,
}

impl MediaStats {
    /// Handles currently alive
    pub fn outstanding(&self) -> u64 {
        self.acquisitions.saturating_sub(self.releases)
    }
}

#[derive(Default)]
struct MediaState {
    handle: Option<LocalMediaHandle>,
    epoch: u64,
    stats: MediaStats,
}

/// Media resource manager
///
/// Cloning shares the same handle slot.
#[derive(Clone)]
pub struct MediaManager {
    source: Arc<dyn MediaSource>,
    state: Arc<Mutex<MediaState>>,
}

impl MediaManager {
    /// Create a manager over a capture source
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            state: Arc::new(Mutex::new(MediaState::default())),
        }
    }

    /// Acquire local media, returning the existing handle if one is live
    ///
    /// A `release()` that happens while the device request is pending wins:
    /// the late tracks are stopped immediately and `Cancelled` is returned.
    ///
    /// # Errors
    ///
    /// Returns the source's device error, or `Cancelled` as described above
    pub async fn acquire(&self, media_kind: MediaKind) -> Result<LocalMediaHandle, MediaError> {
        let epoch = self.epoch();
        self.acquire_at(epoch, media_kind).await
    }

    /// Current release epoch, bumped by every `release()`
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Acquire on behalf of a request made at `epoch`
    ///
    /// Fails with `Cancelled` if `release()` has been called since `epoch`
    /// was read, even before the device request starts.
    ///
    /// # Errors
    ///
    /// Returns the source's device error, or `Cancelled`
    #[tracing::instrument(skip(self))]
    pub async fn acquire_at(
        &self,
        epoch: u64,
        media_kind: MediaKind,
    ) -> Result<LocalMediaHandle, MediaError> {
        {
            let state = self.state.lock();
            if state.epoch != epoch {
                return Err(MediaError::Cancelled);
            }
            if let Some(handle) = &state.handle {
                tracing::debug!(handle = %handle.id, "Reusing live media handle");
                return Ok(handle.clone());
            }
        }

        let tracks = self.source.acquire(media_kind.wants_video()).await?;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            drop(state);
            tracing::debug!("Media released during acquisition, stopping late tracks");
            for track in &tracks {
                track.stop();
            }
            return Err(MediaError::Cancelled);
        }
        if let Some(existing) = state.handle.clone() {
            drop(state);
            for track in &tracks {
                track.stop();
            }
            return Ok(existing);
        }

        let handle = LocalMediaHandle::new(media_kind, tracks);
        state.handle = Some(handle.clone());
        state.stats.acquisitions += 1;
        tracing::info!(handle = %handle.id, tracks = handle.tracks.len(), "Local media acquired");
        Ok(handle)
    }

    /// Enable or disable the microphone, `false` if no handle is live
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    /// Enable or disable the camera, `false` if no handle is live
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Video, enabled)
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let state = self.state.lock();
        match &state.handle {
            Some(handle) => {
                handle.set_kind_enabled(kind, enabled);
                tracing::debug!(?kind, enabled, "Track enablement changed");
                true
            }
            None => false,
        }
    }

    /// Stop all tracks and clear the handle
    ///
    /// Returns `true` if a handle was released. Later calls are no-ops.
    pub fn release(&self) -> bool {
        let handle = {
            let mut state = self.state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            let handle = state.handle.take();
            if handle.is_some() {
                state.stats.releases += 1;
            }
            handle
        };

        match handle {
            Some(handle) => {
                handle.stop_all();
                tracing::info!(handle = %handle.id, "Local media released");
                true
            }
            None => false,
        }
    }

    /// Live handle, if any
    pub fn handle(&self) -> Option<LocalMediaHandle> {
        self.state.lock().handle.clone()
    }

    /// Whether a handle is live
    pub fn is_active(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Acquire/release counters
    pub fn stats(&self) -> MediaStats {
        self.state.lock().stats
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MediaManager")
            .field("handle", &state.handle.as_ref().map(|h| h.id.clone()))
            .field("stats", &state.stats)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sim::SyntheticMediaSource;

    #[tokio::test]
    async fn test_audio_call_acquires_audio_only() {
        let source = Arc::new(SyntheticMediaSource::new());
        let manager = MediaManager::new(source.clone());

        let handle = manager.acquire(MediaKind::Audio).await.unwrap();
        assert_eq!(handle.tracks().len(), 1);
        assert!(handle.audio_enabled());
        assert!(!handle.video_enabled());
        assert_eq!(source.tracks_opened(), 1);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let source = Arc::new(SyntheticMediaSource::new());
        let manager = MediaManager::new(source.clone());

        let first = manager.acquire(MediaKind::Video).await.unwrap();
        let second = manager.acquire(MediaKind::Video).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(source.acquisitions(), 1);
        assert_eq!(manager.stats().acquisitions, 1);
    }

    #[tokio::test]
    async fn test_toggles_do_not_reacquire() {
        let source = Arc::new(SyntheticMediaSource::new());
        let manager = MediaManager::new(source.clone());
        assert!(!manager.set_audio_enabled(false));

        let handle = manager.acquire(MediaKind::Video).await.unwrap();
        assert!(manager.set_audio_enabled(false));
        assert!(manager.set_video_enabled(false));
        assert!(!handle.audio_enabled());
        assert!(!handle.video_enabled());

        manager.set_video_enabled(true);
        assert!(handle.video_enabled());
        assert_eq!(source.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let source = Arc::new(SyntheticMediaSource::new());
        let manager = MediaManager::new(source.clone());
        manager.acquire(MediaKind::Video).await.unwrap();

        assert!(manager.release());
        assert!(!manager.release());
        assert!(!manager.release());
        assert_eq!(source.tracks_stopped(), 2);
        assert_eq!(source.live_tracks(), 0);
        assert_eq!(
            manager.stats(),
            MediaStats {
                acquisitions: 1,
                releases: 1
            }
        );
    }

    #[tokio::test]
    async fn test_release_during_acquisition_cancels() {
        let (source, gate) = SyntheticMediaSource::gated();
        let source = Arc::new(source);
        let manager = MediaManager::new(source.clone());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(MediaKind::Audio).await })
        };
        while source.acquire_calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!manager.release());
        gate.add_permits(1);

        let res = pending.await.unwrap();
        assert_eq!(res.unwrap_err(), MediaError::Cancelled);
        assert!(!manager.is_active());
        assert_eq!(source.live_tracks(), 0);
        assert_eq!(manager.stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stale_epoch_never_reaches_device() {
        let source = Arc::new(SyntheticMediaSource::new());
        let manager = MediaManager::new(source.clone());

        let epoch = manager.epoch();
        manager.release();
        let res = manager.acquire_at(epoch, MediaKind::Video).await;
        assert_eq!(res.unwrap_err(), MediaError::Cancelled);
        assert_eq!(source.acquire_calls(), 0);

        manager.acquire_at(manager.epoch(), MediaKind::Video).await.unwrap();
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn test_device_failure_leaves_no_handle() {
        let source = Arc::new(SyntheticMediaSource::failing(MediaError::PermissionDenied));
        let manager = MediaManager::new(source);

        let res = manager.acquire(MediaKind::Audio).await;
        assert_eq!(res.unwrap_err(), MediaError::PermissionDenied);
        assert!(manager.handle().is_none());
        assert!(!manager.release());
    }
}
