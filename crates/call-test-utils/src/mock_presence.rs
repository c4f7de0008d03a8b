//! Presence store mock.
//!
//! Records every publish, refresh and remove. Snapshots are pushed by the
//! test; the latest one is replayed to late subscribers, so a test does not
//! race the session's subscription.

use crate::fixtures::presence_record;
use async_trait::async_trait;
use call_session::errors::CallError;
use call_session::identity::ParticipantIdentity;
use call_session::presence::{PresenceChannel, PresenceRecord};
use common::types::MeetingId;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Default)]
pub struct MockPresence {
    inner: Arc<Mutex<PresenceInner>>,
}

#[derive(Debug, Default)]
struct PresenceInner {
    published: Vec<PresenceRecord>,
    refreshes: Vec<ParticipantIdentity>,
    removes: Vec<ParticipantIdentity>,
    fail_refresh: bool,
    fail_remove: bool,
    hang_remove: bool,
    current: Option<Vec<PresenceRecord>>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<PresenceRecord>>>,
}

impl MockPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_refresh(self) -> Self {
        self.inner.lock().unwrap().fail_refresh = true;
        self
    }

    pub fn failing_remove(self) -> Self {
        self.inner.lock().unwrap().fail_remove = true;
        self
    }

    /// `remove()` never completes.
    pub fn hanging_remove(self) -> Self {
        self.inner.lock().unwrap().hang_remove = true;
        self
    }

    /// Pushes a membership snapshot of the given identities.
    pub fn push_snapshot(&self, identities: &[&str]) {
        self.push_records(identities.iter().map(|raw| presence_record(raw)).collect());
    }

    pub fn push_records(&self, records: Vec<PresenceRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .retain(|tx| tx.send(records.clone()).is_ok());
        inner.current = Some(records);
    }

    pub fn published(&self) -> Vec<PresenceRecord> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.inner.lock().unwrap().refreshes.len()
    }

    pub fn refreshes(&self) -> Vec<ParticipantIdentity> {
        self.inner.lock().unwrap().refreshes.clone()
    }

    pub fn removes(&self) -> Vec<ParticipantIdentity> {
        self.inner.lock().unwrap().removes.clone()
    }
}

#[async_trait]
impl PresenceChannel for MockPresence {
    async fn publish(&self, _meeting_id: &MeetingId, record: &PresenceRecord) -> Result<(), CallError> {
        self.inner.lock().unwrap().published.push(record.clone());
        Ok(())
    }

    async fn refresh(
        &self,
        _meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.refreshes.push(identity.clone());
        if inner.fail_refresh {
            return Err(CallError::Presence("refresh rejected".to_string()));
        }
        Ok(())
    }

    async fn remove(
        &self,
        _meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError> {
        let (fail, hang) = {
            let mut inner = self.inner.lock().unwrap();
            inner.removes.push(identity.clone());
            (inner.fail_remove, inner.hang_remove)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(CallError::Presence("remove rejected".to_string()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, Vec<PresenceRecord>>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = &inner.current {
            let _ = tx.send(current.clone());
        }
        inner.subscribers.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
