//! Signaling relay contract and the identity announcement.
//!
//! The relay only carries the bootstrap `peer-id` message telling the other
//! participants which transport identity this session registered. Media
//! negotiation itself goes through the transport library.

use crate::errors::CallError;
use crate::identity::ParticipantIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Payload of a relay message, tagged by `type` with its body under `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Announces the transport identity of the sender.
    PeerId {
        #[serde(rename = "peerId")]
        peer_id: ParticipantIdentity,
    },
}

/// A message as stored by the relay:
/// `{"from": .., "type": "peer-id", "data": {"peerId": ..}, "timestamp": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Account-derived identity of the sender.
    pub from: ParticipantIdentity,
    #[serde(flatten)]
    pub payload: SignalPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SignalMessage {
    pub fn new(from: ParticipantIdentity, payload: SignalPayload) -> Self {
        Self {
            from,
            payload,
            timestamp: Some(Utc::now()),
        }
    }

    /// Transport identity announced by this message, if it is an announcement.
    pub fn announced_identity(&self) -> Option<&ParticipantIdentity> {
        match &self.payload {
            SignalPayload::PeerId { peer_id } => Some(peer_id),
        }
    }

    /// Whether this message was sent by the session with the given account
    /// identity or transport identity.
    pub fn is_from(&self, account: &ParticipantIdentity, transport: &ParticipantIdentity) -> bool {
        &self.from == account || self.announced_identity() == Some(transport)
    }
}

/// Ordered per-meeting message relay.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn announce(
        &self,
        meeting_id: &MeetingId,
        from: &ParticipantIdentity,
        payload: &SignalPayload,
    ) -> Result<(), CallError>;

    /// Stream of newly added messages.
    async fn subscribe(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, SignalMessage>, CallError>;

    /// Deletes the meeting's messages.
    async fn clear(&self, meeting_id: &MeetingId) -> Result<(), CallError>;
}
