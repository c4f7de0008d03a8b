//! Local and remote media handles.
//!
//! The local stream is acquired once per session and shared by every outbound
//! dial and inbound answer. Only the session actor flips its track-enabled
//! flags (mute, camera toggle) and stops it on leave.

use crate::errors::CallError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One capture track of the local stream.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn kind(&self) -> TrackKind;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Stops capture. Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Shared handle over the local capture tracks. Cloning is cheap.
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Arc<Vec<Arc<dyn LocalTrack>>>,
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn has_audio(&self) -> bool {
        self.tracks_of(TrackKind::Audio).next().is_some()
    }

    pub fn has_video(&self) -> bool {
        self.tracks_of(TrackKind::Video).next().is_some()
    }

    /// True when any audio track is enabled.
    pub fn audio_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Audio).any(|t| t.is_enabled())
    }

    /// True when any video track is enabled.
    pub fn video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(|t| t.is_enabled())
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Audio)
            .for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Video)
            .for_each(|t| t.set_enabled(enabled));
    }

    /// Stops every track.
    pub fn stop(&self) {
        self.tracks.iter().for_each(|t| t.stop());
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }

    /// What a remote participant receives when this stream is attached.
    pub fn describe(&self) -> RemoteStream {
        RemoteStream {
            stream_id: self.id.clone(),
            has_audio: self.has_audio(),
            has_video: self.has_video(),
        }
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn LocalTrack>> + '_ {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }
}

/// A stream received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub stream_id: String,
    pub has_audio: bool,
    pub has_video: bool,
}

/// Which kinds of capture to request.
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

/// Camera/microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquires the local stream. Failure is fatal to session start.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, CallError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FlagTrack {
        kind: TrackKind,
        enabled: AtomicBool,
        stopped: AtomicBool,
    }

    impl FlagTrack {
        fn new(kind: TrackKind) -> Arc<dyn LocalTrack> {
            Arc::new(Self {
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            })
        }
    }

    impl LocalTrack for FlagTrack {
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    fn av_stream() -> LocalStream {
        LocalStream::new(
            "local-1",
            vec![FlagTrack::new(TrackKind::Audio), FlagTrack::new(TrackKind::Video)],
        )
    }

    #[test]
    fn test_toggles_only_touch_matching_tracks() {
        let stream = av_stream();
        assert!(stream.audio_enabled());
        assert!(stream.video_enabled());

        stream.set_audio_enabled(false);
        assert!(!stream.audio_enabled());
        assert!(stream.video_enabled());

        stream.set_video_enabled(false);
        stream.set_audio_enabled(true);
        assert!(stream.audio_enabled());
        assert!(!stream.video_enabled());
    }

    #[test]
    fn test_clones_share_tracks() {
        let stream = av_stream();
        let attached = stream.clone();

        stream.set_video_enabled(false);
        assert!(!attached.video_enabled());

        attached.stop();
        assert!(stream.is_stopped());
    }

    #[test]
    fn test_describe_reports_track_presence() {
        let audio_only = LocalStream::new("mic", vec![FlagTrack::new(TrackKind::Audio)]);
        let description = audio_only.describe();
        assert_eq!(description.stream_id, "mic");
        assert!(description.has_audio);
        assert!(!description.has_video);
    }

    #[test]
    fn test_empty_stream_is_trivially_stopped() {
        let stream = LocalStream::new("empty", Vec::new());
        assert!(!stream.has_audio());
        assert!(!stream.audio_enabled());
        assert!(stream.is_stopped());
    }
}
