//! The call session actor.
//!
//! One actor per call participation. It owns the transport manager, the peer
//! registry, the presence glue and the local stream, and consumes a single
//! [`SessionEvent`] channel fed by the presence and signaling subscriptions,
//! the transport handle, every media connection and the call view. All state
//! is touched from this one task.
//!
//! # Lifecycle
//!
//! 1. [`CallSession::start`] acquires local media; failure ends the start
//!    before anything is published or allocated
//! 2. The actor subscribes to presence and signaling and allocates the first
//!    transport handle
//! 3. The first open under a settled identity publishes presence and
//!    announces the identity
//! 4. It runs until `leave()`, cancellation, or an unrecoverable identity
//!    collision; all three run the same cleanup routine

use crate::backoff::Backoff;
use crate::errors::CallError;
use crate::events::{ConnectionEvent, SessionCommand, SessionEvent, TransportEvent};
use crate::identity::{self, ParticipantIdentity};
use crate::media::{LocalStream, MediaConstraints, MediaDevices};
use crate::observability::metrics;
use crate::presence::{PresenceChannel, PresenceGlue, PresenceRecord};
use crate::registry::{ConnectionUpdate, InboundOutcome, PeerRegistry};
use crate::signaling::{SignalMessage, SignalPayload, SignalingRelay};
use crate::transport::{
    TransportAction, TransportConfig, TransportFactory, TransportManager, TransportStateMachine,
};
use crate::view::{CallView, CleanupReport, CleanupStep, ParticipantEntry};
use chrono::Utc;
use common::types::MeetingId;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Join parameters of the local participant.
#[derive(Debug, Clone)]
pub struct SessionArgs {
    pub meeting_id: MeetingId,
    pub account_key: String,
    pub display_name: String,
    pub avatar_url: String,
}

/// Timing, transport and capture settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub backoff: Backoff,
    /// Bound for each awaited leave step (presence removal, signal clear).
    pub leave_step_timeout: Duration,
    pub transport: TransportConfig,
    pub media: MediaConstraints,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            backoff: Backoff::default(),
            leave_step_timeout: Duration::from_secs(5),
            transport: TransportConfig::default(),
            media: MediaConstraints::default(),
        }
    }
}

/// The external systems a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub presence: Arc<dyn PresenceChannel>,
    pub signaling: Arc<dyn SignalingRelay>,
    pub transport: Arc<dyn TransportFactory>,
    pub media: Arc<dyn MediaDevices>,
}

/// Handle to a running call session, held by the call view.
#[derive(Clone, Debug)]
pub struct CallSessionHandle {
    sender: mpsc::UnboundedSender<SessionEvent>,
    view: watch::Receiver<CallView>,
    local_stream: LocalStream,
    cancel_token: CancellationToken,
    meeting_id: MeetingId,
}

impl CallSessionHandle {
    #[must_use]
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Reactive view, updated after every processed event.
    #[must_use]
    pub fn view(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    /// Last published view.
    #[must_use]
    pub fn current_view(&self) -> CallView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn local_stream(&self) -> &LocalStream {
        &self.local_stream
    }

    pub fn toggle_audio(&self) -> Result<(), CallError> {
        self.command(SessionCommand::ToggleAudio)
    }

    pub fn toggle_video(&self) -> Result<(), CallError> {
        self.command(SessionCommand::ToggleVideo)
    }

    /// View as of every event queued before this call.
    ///
    /// Falls back to the last published view once the actor has stopped.
    pub async fn snapshot(&self) -> CallView {
        let (tx, rx) = oneshot::channel();
        if self.command(SessionCommand::Snapshot { respond_to: tx }).is_err() {
            return self.current_view();
        }
        rx.await.unwrap_or_else(|_| self.current_view())
    }

    /// Leaves the call and waits for the cleanup routine.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session already stopped.
    pub async fn leave(&self) -> Result<CleanupReport, CallError> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Leave { respond_to: tx })?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// External cancellation; runs the same cleanup as `leave()`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn command(&self, command: SessionCommand) -> Result<(), CallError> {
        self.sender
            .send(SessionEvent::Command(command))
            .map_err(|_| CallError::SessionClosed)
    }
}

pub struct CallSession {
    meeting_id: MeetingId,
    /// Deterministic identity of the account, used as the `from` of
    /// signaling messages.
    account_identity: ParticipantIdentity,
    presence: PresenceGlue,
    signaling: Arc<dyn SignalingRelay>,
    transport: TransportManager,
    registry: PeerRegistry,
    local_stream: LocalStream,
    participants: Vec<PresenceRecord>,
    signaling_degraded: bool,
    fatal_notice: Option<String>,
    /// Set once the cleanup routine has run.
    cleanup: Option<CleanupReport>,
    settings: SessionSettings,
    receiver: mpsc::UnboundedReceiver<SessionEvent>,
    view_tx: watch::Sender<CallView>,
    cancel_token: CancellationToken,
    /// Child of `cancel_token`; stops the subscription forwarders.
    subscriptions: CancellationToken,
}

impl CallSession {
    /// Acquires local media and spawns the session actor.
    ///
    /// # Errors
    ///
    /// Returns `MediaAcquisition` if the local stream cannot be acquired. No
    /// presence record is published and no transport is allocated in that
    /// case.
    pub async fn start(
        args: SessionArgs,
        settings: SessionSettings,
        collaborators: Collaborators,
        cancel_token: CancellationToken,
    ) -> Result<(CallSessionHandle, JoinHandle<()>), CallError> {
        let local_stream = collaborators
            .media
            .acquire(settings.media)
            .await
            .map_err(|e| match e {
                CallError::MediaAcquisition(_) => e,
                other => CallError::MediaAcquisition(other.to_string()),
            })
            .inspect_err(|e| {
                error!(target: "call.session", meeting_id = %args.meeting_id, error = %e, "Local media unavailable");
            })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let machine = TransportStateMachine::new(args.account_key.as_str(), settings.backoff);
        let account_identity = identity::resolve(&args.account_key);
        let transport = TransportManager::new(
            collaborators.transport,
            settings.transport.clone(),
            sender.clone(),
            machine,
        );
        let local_record = PresenceRecord::new(
            transport.identity().clone(),
            args.display_name,
            args.avatar_url,
            Utc::now(),
        );
        let presence = PresenceGlue::new(
            collaborators.presence,
            args.meeting_id.clone(),
            local_record.clone(),
        );

        let initial_view = CallView {
            meeting_id: args.meeting_id.clone(),
            phase: transport.phase(),
            local_identity: transport.identity().clone(),
            participants: vec![ParticipantEntry {
                record: local_record.clone(),
                is_local: true,
            }],
            remote_peers: Vec::new(),
            signaling_degraded: false,
            audio_enabled: local_stream.audio_enabled(),
            video_enabled: local_stream.video_enabled(),
            fatal_notice: None,
        };
        let (view_tx, view) = watch::channel(initial_view);

        let session = Self {
            meeting_id: args.meeting_id.clone(),
            account_identity,
            presence,
            signaling: collaborators.signaling,
            transport,
            registry: PeerRegistry::new(),
            local_stream: local_stream.clone(),
            participants: vec![local_record],
            signaling_degraded: false,
            fatal_notice: None,
            cleanup: None,
            settings,
            receiver,
            view_tx,
            subscriptions: cancel_token.child_token(),
            cancel_token: cancel_token.clone(),
        };
        let task = tokio::spawn(session.run(sender.clone()));

        let handle = CallSessionHandle {
            sender,
            view,
            local_stream,
            cancel_token,
            meeting_id: args.meeting_id,
        };
        Ok((handle, task))
    }

    #[instrument(skip_all, name = "call.session", fields(meeting_id = %self.meeting_id))]
    async fn run(mut self, events: mpsc::UnboundedSender<SessionEvent>) {
        info!(
            target: "call.session",
            identity = %self.transport.identity(),
            "Call session started"
        );

        self.spawn_presence_forwarder(events.clone());
        self.spawn_signal_forwarder(events);

        let actions = self.transport.begin(Instant::now());
        self.apply(actions).await;
        self.publish_view();

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.transport.reconnect_deadline();
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(target: "call.session", "Call session cancelled");
                    self.shutdown("cancelled").await;
                    self.publish_view();
                    break;
                }

                () = wait_until(deadline) => {
                    let actions = self.transport.on_reconnect_timer(Instant::now());
                    self.apply(actions).await;
                }

                _ = heartbeat.tick() => {
                    if self.cleanup.is_none() {
                        let _ = self.presence.refresh();
                    }
                }

                event = self.receiver.recv() => {
                    let Some(event) = event else {
                        debug!(target: "call.session", "Event channel closed");
                        break;
                    };
                    if self.handle_event(event).await {
                        break;
                    }
                }
            }
            self.publish_view();
        }

        info!(
            target: "call.session",
            identity = %self.transport.identity(),
            "Call session stopped"
        );
    }

    /// Handles one event. Returns true when the actor should exit.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Presence(snapshot) => {
                if self.cleanup.is_none() {
                    self.participants = self.presence.merge_local(snapshot);
                    self.reconcile();
                }
            }
            SessionEvent::Signal(message) => self.handle_signal(&message),
            SessionEvent::Transport {
                generation,
                event: TransportEvent::IncomingCall(connection),
            } => {
                if !self.transport.is_current(generation) {
                    debug!(
                        target: "call.session",
                        peer = %connection.peer(),
                        generation,
                        "Closing incoming call on replaced transport"
                    );
                    connection.close();
                    return false;
                }
                let outcome = self.registry.accept_inbound(
                    connection,
                    Some(&self.local_stream),
                    self.transport.identity(),
                );
                if let InboundOutcome::Accepted { replaced: true } = outcome {
                    debug!(target: "call.session", "Incoming call replaced an existing connection");
                }
            }
            SessionEvent::Transport { generation, event } => {
                let actions = self
                    .transport
                    .handle_event(generation, event, Instant::now());
                self.apply(actions).await;
            }
            SessionEvent::Connection {
                peer,
                connection_id,
                event,
            } => {
                if self.cleanup.is_some() {
                    return false;
                }
                metrics::record_connection_event(event.as_str());
                if let ConnectionEvent::Error(detail) = &event {
                    warn!(
                        target: "call.session",
                        peer = %peer,
                        connection_id = %connection_id,
                        error = %detail,
                        "Peer connection error"
                    );
                }
                match self.registry.on_connection_event(&peer, connection_id, &event) {
                    ConnectionUpdate::Applied => {
                        debug!(target: "call.session", peer = %peer, event = event.as_str(), "Peer connection updated");
                    }
                    ConnectionUpdate::Stale | ConnectionUpdate::Unknown => {
                        debug!(
                            target: "call.session",
                            peer = %peer,
                            connection_id = %connection_id,
                            "Ignoring event from untracked connection"
                        );
                    }
                }
            }
            SessionEvent::Command(command) => return self.handle_command(command).await,
        }
        false
    }

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::ToggleAudio => {
                if self.cleanup.is_none() {
                    let enabled = !self.local_stream.audio_enabled();
                    self.local_stream.set_audio_enabled(enabled);
                    debug!(target: "call.session", enabled, "Audio toggled");
                }
                false
            }
            SessionCommand::ToggleVideo => {
                if self.cleanup.is_none() {
                    let enabled = !self.local_stream.video_enabled();
                    self.local_stream.set_video_enabled(enabled);
                    debug!(target: "call.session", enabled, "Video toggled");
                }
                false
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.build_view());
                false
            }
            SessionCommand::Leave { respond_to } => {
                let report = self.shutdown("leave").await;
                self.publish_view();
                let _ = respond_to.send(report);
                true
            }
        }
    }

    fn handle_signal(&mut self, message: &SignalMessage) {
        if self.cleanup.is_some()
            || message.is_from(&self.account_identity, self.transport.identity())
        {
            return;
        }
        if let Some(peer) = message.announced_identity() {
            debug!(
                target: "call.session",
                from = %message.from,
                peer = %peer,
                "Peer announced transport identity"
            );
        }
        self.reconcile();
    }

    /// Carries out the transport manager's follow-up actions.
    async fn apply(&mut self, actions: Vec<TransportAction>) {
        for action in actions {
            match action {
                TransportAction::SetDegraded(degraded) => {
                    if degraded != self.signaling_degraded {
                        info!(target: "call.session", degraded, "Signaling degraded flag changed");
                    }
                    self.signaling_degraded = degraded;
                }
                TransportAction::Announce(peer_id) => {
                    // First open under a settled identity.
                    self.presence.publish();
                    self.announce(peer_id);
                }
                TransportAction::IdentityChanged(identity) => {
                    info!(target: "call.session", identity = %identity, "Joining under a unique identity");
                    self.presence.rebind(identity);
                    self.participants = self
                        .presence
                        .merge_local(std::mem::take(&mut self.participants));
                }
                TransportAction::Reconcile => self.reconcile(),
                TransportAction::PeerUnreachable(peer) => {
                    if self.registry.mark_unreachable(&peer) {
                        debug!(target: "call.session", peer = %peer, "Peer marked unreachable");
                    }
                }
                TransportAction::Fatal(e) => {
                    error!(target: "call.session", error = %e, "Call session cannot continue");
                    self.fatal_notice = Some(e.user_notice());
                    self.shutdown("fatal").await;
                }
                TransportAction::Allocate { .. } | TransportAction::ScheduleReconnect { .. } => {}
            }
        }
    }

    /// Sends the `peer-id` bootstrap message in the background.
    fn announce(&self, peer_id: ParticipantIdentity) {
        let signaling = Arc::clone(&self.signaling);
        let meeting_id = self.meeting_id.clone();
        let from = self.account_identity.clone();
        tokio::spawn(async move {
            let payload = SignalPayload::PeerId {
                peer_id: peer_id.clone(),
            };
            match signaling.announce(&meeting_id, &from, &payload).await {
                Ok(()) => {
                    debug!(target: "call.session", peer_id = %peer_id, "Transport identity announced");
                }
                Err(e) => {
                    warn!(target: "call.session", peer_id = %peer_id, error = %e, "Announcement failed");
                    metrics::record_collaborator_failure("signal_announce");
                }
            }
        });
    }

    fn reconcile(&mut self) {
        if self.cleanup.is_some() {
            return;
        }
        let present: BTreeSet<ParticipantIdentity> = self
            .participants
            .iter()
            .map(|record| record.identity.clone())
            .collect();
        let dialer = self.transport.dialer();
        let outcome = self.registry.reconcile(
            &present,
            self.transport.identity(),
            dialer.as_deref(),
            Some(&self.local_stream),
        );
        if !outcome.is_noop() {
            debug!(
                target: "call.session",
                dialed = outcome.dialed.len(),
                removed = outcome.removed.len(),
                failed = outcome.failed.len(),
                "Peers reconciled"
            );
        }
    }

    /// The leave routine. Every step runs whatever happened to the previous
    /// ones; the awaited steps are bounded by the leave step timeout. Runs at
    /// most once.
    async fn shutdown(&mut self, reason: &'static str) -> CleanupReport {
        if let Some(report) = &self.cleanup {
            return report.clone();
        }
        let started = Instant::now();
        let step_timeout = self.settings.leave_step_timeout;
        let mut report = CleanupReport::default();

        // Destroys the handle and cancels the pending reconnect timer.
        if let Err(e) = self.transport.leave() {
            warn!(target: "call.session", error = %e, "Transport teardown failed");
            metrics::record_collaborator_failure("transport_destroy");
            report.failed_steps.push(CleanupStep::Transport);
        }

        report.connections_closed = self.registry.close_all();
        self.local_stream.stop();

        match tokio::time::timeout(step_timeout, self.presence.remove()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target: "call.session", error = %e, "Presence removal failed");
                metrics::record_collaborator_failure("presence_remove");
                report.failed_steps.push(CleanupStep::Presence);
            }
            Err(_) => {
                warn!(target: "call.session", "Presence removal timed out");
                metrics::record_collaborator_failure("presence_remove");
                report.failed_steps.push(CleanupStep::Presence);
            }
        }

        match tokio::time::timeout(step_timeout, self.signaling.clear(&self.meeting_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target: "call.session", error = %e, "Clearing signal messages failed");
                metrics::record_collaborator_failure("signal_clear");
                report.failed_steps.push(CleanupStep::Signaling);
            }
            Err(_) => {
                warn!(target: "call.session", "Clearing signal messages timed out");
                metrics::record_collaborator_failure("signal_clear");
                report.failed_steps.push(CleanupStep::Signaling);
            }
        }

        self.subscriptions.cancel();
        self.signaling_degraded = false;
        metrics::record_leave_duration(started.elapsed());

        info!(
            target: "call.session",
            reason,
            connections_closed = report.connections_closed,
            failed_steps = report.failed_steps.len(),
            "Left call"
        );
        self.cleanup = Some(report.clone());
        report
    }

    fn spawn_presence_forwarder(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let channel = self.presence.channel();
        let meeting_id = self.meeting_id.clone();
        let token = self.subscriptions.clone();
        tokio::spawn(async move {
            let mut stream = match channel.subscribe(&meeting_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target: "call.presence", error = %e, "Presence subscription failed");
                    metrics::record_collaborator_failure("presence_subscribe");
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(snapshot) => {
                            if events.send(SessionEvent::Presence(snapshot)).is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!(target: "call.presence", "Presence subscription ended");
                            break;
                        }
                    },
                }
            }
        });
    }

    fn spawn_signal_forwarder(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let signaling = Arc::clone(&self.signaling);
        let meeting_id = self.meeting_id.clone();
        let token = self.subscriptions.clone();
        tokio::spawn(async move {
            let mut stream = match signaling.subscribe(&meeting_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target: "call.session", error = %e, "Signal subscription failed");
                    metrics::record_collaborator_failure("signal_subscribe");
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(message) => {
                            if events.send(SessionEvent::Signal(message)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn build_view(&self) -> CallView {
        let local = self.presence.identity();
        CallView {
            meeting_id: self.meeting_id.clone(),
            phase: self.transport.phase(),
            local_identity: self.transport.identity().clone(),
            participants: self
                .participants
                .iter()
                .map(|record| ParticipantEntry {
                    is_local: &record.identity == local,
                    record: record.clone(),
                })
                .collect(),
            remote_peers: self.registry.states(),
            signaling_degraded: self.signaling_degraded,
            audio_enabled: self.local_stream.audio_enabled(),
            video_enabled: self.local_stream.video_enabled(),
            fatal_notice: self.fatal_notice.clone(),
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.build_view());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
