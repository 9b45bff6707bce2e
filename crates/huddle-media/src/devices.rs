//! Camera / microphone seam.
//!
//! [`MediaDevices::acquire`] hands out a [`LocalMedia`] bundle. The bundle
//! owns the devices until [`LocalMedia::stop`] is called or it is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use huddle_shared::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Which devices a call wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// One captured track. Disabling it keeps the device open but sends silence
/// or black frames.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Tracks captured for one call.
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    release: Option<ReleaseFn>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            release: None,
        }
    }

    /// Run `release` once when the media is stopped or dropped.
    pub fn on_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Flip every track of `kind`. Returns the new state, or `None` when
    /// there is no such track.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let enabled = !self.track(kind)?.is_enabled();
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.set_enabled(enabled);
        }
        Some(enabled)
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.is_empty() && self.release.is_none()
    }

    /// Stop every track and give the devices back. Idempotent.
    pub fn stop(&mut self) {
        if !self.tracks.is_empty() {
            debug!(tracks = self.tracks.len(), "Stopping local media");
        }
        self.tracks.clear();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks)
            .finish()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Devices described up front instead of probed.
///
/// Models exclusive ownership: while one `LocalMedia` is live, a second
/// acquire fails with [`MediaError::DeviceBusy`]. A forced failure can be
/// set to stand in for a denied permission prompt.
pub struct StaticDevices {
    has_audio: bool,
    has_video: bool,
    forced: Mutex<Option<MediaError>>,
    in_use: Arc<AtomicBool>,
    acquisitions: AtomicUsize,
}

impl StaticDevices {
    pub fn new(has_audio: bool, has_video: bool) -> Self {
        Self {
            has_audio,
            has_video,
            forced: Mutex::new(None),
            in_use: Arc::new(AtomicBool::new(false)),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Fail every subsequent acquire with `error` (or stop failing on `None`).
    pub fn fail_with(&self, error: Option<MediaError>) {
        *self.forced.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Number of acquire attempts, failed ones included.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for StaticDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let attempt = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;

        let forced = self
            .forced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(error) = forced {
            return Err(error);
        }

        if (constraints.audio && !self.has_audio) || (constraints.video && !self.has_video) {
            return Err(MediaError::DeviceMissing);
        }

        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(MediaError::DeviceBusy);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("audio-{attempt}"), TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(format!("video-{attempt}"), TrackKind::Video));
        }
        info!(audio = constraints.audio, video = constraints.video, "Local media acquired");

        let in_use = self.in_use.clone();
        Ok(LocalMedia::new(tracks).on_release(move || {
            in_use.store(false, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let devices = StaticDevices::new(true, true);
        let mut media = devices.acquire(MediaConstraints::default()).await.unwrap();
        assert_eq!(media.tracks().len(), 2);
        assert!(devices.in_use());

        let err = devices.acquire(MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceBusy);

        media.stop();
        assert!(!devices.in_use());
        assert!(devices.acquire(MediaConstraints::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let devices = StaticDevices::new(true, false);
        let err = devices.acquire(MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceMissing);

        let audio_only = MediaConstraints {
            audio: true,
            video: false,
        };
        assert!(devices.acquire(audio_only).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_denial_and_drop_releases() {
        let devices = StaticDevices::new(true, true);
        devices.fail_with(Some(MediaError::AccessDenied));
        assert_eq!(
            devices.acquire(MediaConstraints::default()).await.unwrap_err(),
            MediaError::AccessDenied
        );

        devices.fail_with(None);
        {
            let _media = devices.acquire(MediaConstraints::default()).await.unwrap();
            assert!(devices.in_use());
        }
        assert!(!devices.in_use());
        assert_eq!(devices.acquisitions(), 2);
    }

    #[test]
    fn test_toggle_flips_only_matching_kind() {
        let media = LocalMedia::new(vec![
            LocalTrack::new("a", TrackKind::Audio),
            LocalTrack::new("v", TrackKind::Video),
        ]);
        assert_eq!(media.toggle(TrackKind::Audio), Some(false));
        assert!(!media.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(media.track(TrackKind::Video).unwrap().is_enabled());
        assert_eq!(media.toggle(TrackKind::Audio), Some(true));

        let audio_only = LocalMedia::new(vec![LocalTrack::new("a", TrackKind::Audio)]);
        assert_eq!(audio_only.toggle(TrackKind::Video), None);
    }
}
