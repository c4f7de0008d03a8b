//! Capture device mock.

use async_trait::async_trait;
use call_session::errors::CallError;
use call_session::media::{LocalStream, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct MockMediaDevices {
    failure: Option<CallError>,
    acquisitions: Arc<AtomicUsize>,
    last_stream: Arc<Mutex<Option<LocalStream>>>,
}

impl MockMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `acquire()` fails with `error`.
    pub fn failing(error: CallError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn last_stream(&self) -> Option<LocalStream> {
        self.last_stream.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, CallError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(MockTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(MockTrack::new(TrackKind::Video)));
        }
        let stream = LocalStream::new("mock-local-stream", tracks);
        *self.last_stream.lock().unwrap() = Some(stream.clone());
        Ok(stream)
    }
}

#[derive(Debug)]
pub struct MockTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl LocalTrack for MockTrack {
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
