//! Signaling relay mock.
//!
//! Records announcements and clears; messages pushed by the test are replayed
//! to late subscribers.

use async_trait::async_trait;
use call_session::errors::CallError;
use call_session::identity::ParticipantIdentity;
use call_session::signaling::{SignalMessage, SignalPayload, SignalingRelay};
use common::types::MeetingId;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Default)]
pub struct MockSignaling {
    inner: Arc<Mutex<SignalingInner>>,
}

#[derive(Debug, Default)]
struct SignalingInner {
    announcements: Vec<(ParticipantIdentity, SignalPayload)>,
    clears: usize,
    fail_clear: bool,
    history: Vec<SignalMessage>,
    subscribers: Vec<mpsc::UnboundedSender<SignalMessage>>,
}

impl MockSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_clear(self) -> Self {
        self.inner.lock().unwrap().fail_clear = true;
        self
    }

    /// Delivers a message as if another participant had sent it.
    pub fn push(&self, message: SignalMessage) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
        inner.history.push(message);
    }

    /// `(from, payload)` of every announcement, in order.
    pub fn announcements(&self) -> Vec<(ParticipantIdentity, SignalPayload)> {
        self.inner.lock().unwrap().announcements.clone()
    }

    pub fn announcement_count(&self) -> usize {
        self.inner.lock().unwrap().announcements.len()
    }

    pub fn clear_count(&self) -> usize {
        self.inner.lock().unwrap().clears
    }
}

#[async_trait]
impl SignalingRelay for MockSignaling {
    async fn announce(
        &self,
        _meeting_id: &MeetingId,
        from: &ParticipantIdentity,
        payload: &SignalPayload,
    ) -> Result<(), CallError> {
        self.inner
            .lock()
            .unwrap()
            .announcements
            .push((from.clone(), payload.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        _meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, SignalMessage>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for message in &inner.history {
            let _ = tx.send(message.clone());
        }
        inner.subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn clear(&self, _meeting_id: &MeetingId) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.clears += 1;
        if inner.fail_clear {
            return Err(CallError::Signaling("clear rejected".to_string()));
        }
        inner.history.clear();
        Ok(())
    }
}
