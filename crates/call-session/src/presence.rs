//! Presence glue.
//!
//! The local participant's record is published once the transport has
//! registered its identity, refreshed on every heartbeat and removed on
//! leave. Only the identity that was actually published is refreshed or
//! removed. Publish and refresh run as detached best-effort tasks: a failure
//! is logged and counted, never retried here and never fatal.

use crate::errors::CallError;
use crate::identity::ParticipantIdentity;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One participant's entry in the meeting's presence set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(rename = "userId")]
    pub identity: ParticipantIdentity,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "photoURL", default)]
    pub avatar_url: String,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(
        identity: ParticipantIdentity,
        display_name: impl Into<String>,
        avatar_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            avatar_url: avatar_url.into(),
            joined_at: now,
            last_active_at: now,
        }
    }
}

/// Shared per-meeting presence store.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Creates or replaces the record for `record.identity`.
    async fn publish(&self, meeting_id: &MeetingId, record: &PresenceRecord)
        -> Result<(), CallError>;

    /// Bumps `last_active_at` for `identity`.
    async fn refresh(
        &self,
        meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError>;

    async fn remove(
        &self,
        meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError>;

    /// Stream of full membership snapshots.
    async fn subscribe(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, Vec<PresenceRecord>>, CallError>;
}

/// Ensures the local participant is part of a snapshot, even before the
/// store reflects its own record.
pub fn with_local(mut snapshot: Vec<PresenceRecord>, local: &PresenceRecord) -> Vec<PresenceRecord> {
    if !snapshot.iter().any(|r| r.identity == local.identity) {
        snapshot.push(local.clone());
    }
    snapshot
}

/// The session's view of its own presence record.
pub struct PresenceGlue {
    channel: Arc<dyn PresenceChannel>,
    meeting_id: MeetingId,
    local: PresenceRecord,
    published: Option<ParticipantIdentity>,
}

impl PresenceGlue {
    pub fn new(
        channel: Arc<dyn PresenceChannel>,
        meeting_id: MeetingId,
        local: PresenceRecord,
    ) -> Self {
        Self {
            channel,
            meeting_id,
            local,
            published: None,
        }
    }

    pub fn local_record(&self) -> &PresenceRecord {
        &self.local
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.local.identity
    }

    /// Identity the record was last published under, if any.
    pub fn published(&self) -> Option<&ParticipantIdentity> {
        self.published.as_ref()
    }

    pub fn channel(&self) -> Arc<dyn PresenceChannel> {
        Arc::clone(&self.channel)
    }

    pub fn merge_local(&self, snapshot: Vec<PresenceRecord>) -> Vec<PresenceRecord> {
        with_local(snapshot, &self.local)
    }

    /// Publishes the local record in the background.
    pub fn publish(&mut self) -> JoinHandle<()> {
        self.published = Some(self.local.identity.clone());
        let channel = Arc::clone(&self.channel);
        let meeting_id = self.meeting_id.clone();
        let record = self.local.clone();
        tokio::spawn(async move {
            match channel.publish(&meeting_id, &record).await {
                Ok(()) => {
                    debug!(target: "call.presence", identity = %record.identity, "Presence published");
                }
                Err(e) => {
                    warn!(target: "call.presence", identity = %record.identity, error = %e, "Presence publish failed");
                    metrics::record_collaborator_failure("presence_publish");
                }
            }
        })
    }

    /// Heartbeat refresh in the background. `None` while nothing is
    /// published.
    pub fn refresh(&self) -> Option<JoinHandle<()>> {
        let identity = self.published.clone()?;
        let channel = Arc::clone(&self.channel);
        let meeting_id = self.meeting_id.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = channel.refresh(&meeting_id, &identity).await {
                warn!(target: "call.presence", identity = %identity, error = %e, "Presence refresh failed");
                metrics::record_collaborator_failure("presence_refresh");
            }
        }))
    }

    /// Moves the local record to `identity`. Nothing is published until the
    /// next [`publish`](Self::publish).
    ///
    /// A record already published under the previous identity is not
    /// touched: the transport now registers that identity for another live
    /// session, which owns the record.
    pub fn rebind(&mut self, identity: ParticipantIdentity) {
        if let Some(previous) = self.published.take() {
            debug!(
                target: "call.presence",
                previous = %previous,
                identity = %identity,
                "Leaving record under previous identity to its registered session"
            );
        }
        self.local.identity = identity;
        self.local.last_active_at = Utc::now();
    }

    /// Removes the published record, if any. Awaited by the leave path.
    pub async fn remove(&self) -> Result<(), CallError> {
        match &self.published {
            Some(identity) => self.channel.remove(&self.meeting_id, identity).await,
            None => Ok(()),
        }
    }
}
