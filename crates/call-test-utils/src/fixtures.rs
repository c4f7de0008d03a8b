//! Test fixtures: identities, records, settings and the [`TestRig`] bundle.

use crate::{MockMediaDevices, MockPresence, MockSignaling, MockTransportFactory};
use call_session::backoff::Backoff;
use call_session::identity::ParticipantIdentity;
use call_session::media::MediaConstraints;
use call_session::presence::PresenceRecord;
use call_session::session::{
    CallSession, CallSessionHandle, Collaborators, SessionArgs, SessionSettings,
};
use call_session::transport::TransportConfig;
use call_session::view::CallView;
use chrono::{TimeZone, Utc};
use common::types::MeetingId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_MEETING_ID: &str = "meeting-under-test";

pub fn identity(raw: &str) -> ParticipantIdentity {
    ParticipantIdentity::parse(raw).unwrap()
}

pub fn meeting_id() -> MeetingId {
    MeetingId::new(TEST_MEETING_ID)
}

/// Presence record with fixed timestamps.
pub fn presence_record(raw: &str) -> PresenceRecord {
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    PresenceRecord::new(identity(raw), raw, "", at)
}

/// Default timings: 20s heartbeat, 3s/30s backoff, 5s leave steps.
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        heartbeat_interval: Duration::from_secs(20),
        backoff: Backoff::new(Duration::from_millis(3000), Duration::from_millis(30_000)),
        leave_step_timeout: Duration::from_secs(5),
        transport: TransportConfig::default(),
        media: MediaConstraints::default(),
    }
}

pub fn session_args(account_key: &str) -> SessionArgs {
    SessionArgs {
        meeting_id: meeting_id(),
        account_key: account_key.to_string(),
        display_name: account_key.to_string(),
        avatar_url: String::new(),
    }
}

/// Lets spawned tasks run, then returns the view as of every event they
/// queued.
pub async fn settle(session: &CallSessionHandle) -> CallView {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    session.snapshot().await
}

/// One set of mock collaborators.
#[derive(Debug, Clone, Default)]
pub struct TestRig {
    pub presence: MockPresence,
    pub signaling: MockSignaling,
    pub transport: MockTransportFactory,
    pub media: MockMediaDevices,
}

impl TestRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_presence(mut self, presence: MockPresence) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_signaling(mut self, signaling: MockSignaling) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_transport(mut self, transport: MockTransportFactory) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_media(mut self, media: MockMediaDevices) -> Self {
        self.media = media;
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            presence: Arc::new(self.presence.clone()),
            signaling: Arc::new(self.signaling.clone()),
            transport: Arc::new(self.transport.clone()),
            media: Arc::new(self.media.clone()),
        }
    }

    /// Starts a session for `account_key` with [`test_settings`] and waits
    /// for its startup events.
    pub async fn start(&self, account_key: &str) -> (CallSessionHandle, JoinHandle<()>) {
        let (handle, task) = CallSession::start(
            session_args(account_key),
            test_settings(),
            self.collaborators(),
            CancellationToken::new(),
        )
        .await
        .expect("session start failed");
        settle(&handle).await;
        (handle, task)
    }
}
