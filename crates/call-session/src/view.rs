//! What the call view renders, and what leave reports back.

use crate::identity::ParticipantIdentity;
use crate::presence::PresenceRecord;
use crate::registry::RemotePeerState;
use crate::transport::TransportPhase;
use common::types::MeetingId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantEntry {
    pub record: PresenceRecord,
    pub is_local: bool,
}

/// Snapshot of a call session for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallView {
    pub meeting_id: MeetingId,
    pub phase: TransportPhase,
    pub local_identity: ParticipantIdentity,
    /// Presence membership; always contains the local participant.
    pub participants: Vec<ParticipantEntry>,
    /// Ordered by identity.
    pub remote_peers: Vec<RemotePeerState>,
    pub signaling_degraded: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    /// Persistent error shown instead of the call (e.g. "could not join").
    pub fatal_notice: Option<String>,
}

impl CallView {
    pub fn remote_peer(&self, peer: &ParticipantIdentity) -> Option<&RemotePeerState> {
        self.remote_peers.iter().find(|p| &p.peer_identity == peer)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == TransportPhase::Closed
    }
}

/// Leave steps that can fail. Closing connections and stopping local media
/// cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CleanupStep {
    Transport,
    Presence,
    Signaling,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::Transport => "transport",
            CleanupStep::Presence => "presence",
            CleanupStep::Signaling => "signaling",
        }
    }
}

/// Outcome of the leave routine. Every step runs regardless of the others.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub connections_closed: usize,
    pub failed_steps: Vec<CleanupStep>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }

    pub fn failed(&self, step: CleanupStep) -> bool {
        self.failed_steps.contains(&step)
    }
}
