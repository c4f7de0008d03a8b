//! Peer connection registry.
//!
//! An owned map from remote identity to its current media connection and the
//! UI-facing [`RemotePeerState`]. Reconciliation against presence membership
//! is idempotent: an identity with a live connection is never dialed again,
//! so repeated or reordered triggers cannot produce duplicate connections.
//!
//! Connection events are applied only when they come from the connection the
//! registry currently holds for that peer. An inbound call replaces and
//! closes the current connection, so a peer never has more than one open
//! connection. When both sides dial each other at once, the dial placed by
//! the lower identity is kept on both ends: the lower side declines the
//! inbound call, the higher side accepts it and closes its own dial.

use crate::errors::CallError;
use crate::events::ConnectionEvent;
use crate::identity::ParticipantIdentity;
use crate::media::{LocalStream, RemoteStream};
use crate::observability::metrics;
use crate::transport::{ConnectionId, MediaConnection, TransportHandle};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the call view shows for one remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemotePeerState {
    pub peer_identity: ParticipantIdentity,
    pub stream: Option<RemoteStream>,
    pub camera_on: bool,
    pub audio_on: bool,
    pub reconnecting: bool,
}

impl RemotePeerState {
    pub fn new(peer_identity: ParticipantIdentity) -> Self {
        Self {
            peer_identity,
            stream: None,
            camera_on: true,
            audio_on: true,
            reconnecting: false,
        }
    }

    /// Placeholder selection for the peer's tile.
    pub fn tile(&self) -> PeerTile {
        if self.stream.is_some() && self.camera_on {
            PeerTile::Video
        } else if self.reconnecting {
            PeerTile::Reconnecting
        } else {
            PeerTile::CameraOff
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerTile {
    Video,
    CameraOff,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialDirection {
    Outbound,
    Inbound,
}

impl DialDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialDirection::Outbound => "outbound",
            DialDirection::Inbound => "inbound",
        }
    }
}

struct TrackedConnection {
    connection: Arc<dyn MediaConnection>,
    direction: DialDirection,
    open: bool,
}

struct PeerEntry {
    state: RemotePeerState,
    connection: Option<TrackedConnection>,
}

impl PeerEntry {
    fn new(peer: ParticipantIdentity) -> Self {
        Self {
            state: RemotePeerState::new(peer),
            connection: None,
        }
    }

    fn has_live_connection(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.open)
    }

    fn current_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.connection.id())
    }

    /// Whether the current connection is a live dial of ours.
    fn has_live_outbound(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.open && c.direction == DialDirection::Outbound)
    }

    /// Installs `connection` as current and closes the one it replaces.
    fn attach(&mut self, connection: Arc<dyn MediaConnection>, direction: DialDirection) {
        let replaced = self.connection.replace(TrackedConnection {
            connection,
            direction,
            open: true,
        });
        if let Some(previous) = replaced {
            previous.connection.close();
        }
        self.state.stream = None;
        self.state.camera_on = true;
        self.state.audio_on = true;
        self.state.reconnecting = false;
    }

    fn mark_dropped(&mut self) {
        if let Some(current) = self.connection.as_mut() {
            current.open = false;
        }
        self.state.stream = None;
        self.state.reconnecting = true;
    }

    /// Closes the peer's connection. Returns how many were closed.
    fn close_all(&mut self) -> usize {
        match self.connection.take() {
            Some(current) => {
                current.connection.close();
                1
            }
            None => 0,
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub dialed: Vec<ParticipantIdentity>,
    pub removed: Vec<ParticipantIdentity>,
    pub failed: Vec<(ParticipantIdentity, CallError)>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.dialed.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug)]
pub enum InboundOutcome {
    /// The caller is the local participant.
    Ignored,
    /// No local stream yet; the call was closed.
    Dropped,
    /// Both sides dialed at once and the local dial wins; the call was
    /// closed.
    Declined,
    Accepted {
        replaced: bool,
    },
    Failed(CallError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Applied,
    /// Event from a connection that is no longer current.
    Stale,
    /// No state for this peer.
    Unknown,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: BTreeMap<ParticipantIdentity, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &ParticipantIdentity) -> Option<&RemotePeerState> {
        self.peers.get(peer).map(|e| &e.state)
    }

    /// Remote peer states ordered by identity.
    pub fn states(&self) -> Vec<RemotePeerState> {
        self.peers.values().map(|e| e.state.clone()).collect()
    }

    pub fn has_live_connection(&self, peer: &ParticipantIdentity) -> bool {
        self.peers
            .get(peer)
            .is_some_and(PeerEntry::has_live_connection)
    }

    pub fn connection_id(&self, peer: &ParticipantIdentity) -> Option<ConnectionId> {
        self.peers.get(peer).and_then(PeerEntry::current_id)
    }

    pub fn direction(&self, peer: &ParticipantIdentity) -> Option<DialDirection> {
        self.peers
            .get(peer)
            .and_then(|e| e.connection.as_ref())
            .map(|c| c.direction)
    }

    /// Number of peers with a live connection.
    pub fn live_connections(&self) -> usize {
        self.peers.values().filter(|e| e.has_live_connection()).count()
    }

    /// Synchronizes with presence membership.
    ///
    /// Every present remote identity gets a state entry and, when a dialer
    /// and a local stream are available and it has no live connection, an
    /// outbound dial. Every entry whose identity left presence is closed and
    /// removed.
    pub fn reconcile(
        &mut self,
        present: &BTreeSet<ParticipantIdentity>,
        local: &ParticipantIdentity,
        dialer: Option<&dyn TransportHandle>,
        stream: Option<&LocalStream>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for peer in present.iter().filter(|p| *p != local) {
            let entry = self
                .peers
                .entry(peer.clone())
                .or_insert_with(|| PeerEntry::new(peer.clone()));

            if entry.has_live_connection() {
                continue;
            }
            let (Some(dialer), Some(stream)) = (dialer, stream) else {
                continue;
            };

            match dialer.dial(peer, stream) {
                Ok(connection) => {
                    info!(
                        target: "call.registry",
                        peer = %peer,
                        connection_id = %connection.id(),
                        "Dialing peer"
                    );
                    metrics::record_dial(DialDirection::Outbound);
                    entry.attach(connection, DialDirection::Outbound);
                    outcome.dialed.push(peer.clone());
                }
                Err(e) => {
                    warn!(target: "call.registry", peer = %peer, error = %e, "Dial failed");
                    metrics::record_collaborator_failure("dial");
                    outcome.failed.push((peer.clone(), e));
                }
            }
        }

        let departed: Vec<ParticipantIdentity> = self
            .peers
            .keys()
            .filter(|p| !present.contains(*p))
            .cloned()
            .collect();
        for peer in departed {
            if let Some(mut entry) = self.peers.remove(&peer) {
                let closed = entry.close_all();
                debug!(target: "call.registry", peer = %peer, closed, "Peer left presence");
                outcome.removed.push(peer);
            }
        }

        metrics::set_remote_peers(self.peers.len());
        outcome
    }

    /// Accepts an inbound call with the local stream and registers it as the
    /// peer's current connection.
    pub fn accept_inbound(
        &mut self,
        connection: Arc<dyn MediaConnection>,
        stream: Option<&LocalStream>,
        local: &ParticipantIdentity,
    ) -> InboundOutcome {
        let peer = connection.peer().clone();
        if &peer == local {
            debug!(target: "call.registry", "Ignoring incoming call from self");
            connection.close();
            return InboundOutcome::Ignored;
        }
        let Some(stream) = stream else {
            warn!(target: "call.registry", peer = %peer, "Dropping incoming call without local stream");
            connection.close();
            return InboundOutcome::Dropped;
        };
        if &peer > local && self.peers.get(&peer).is_some_and(PeerEntry::has_live_outbound) {
            debug!(
                target: "call.registry",
                peer = %peer,
                connection_id = %connection.id(),
                "Declining incoming call, keeping own dial to lower identity"
            );
            connection.close();
            return InboundOutcome::Declined;
        }
        if let Err(e) = connection.answer(stream) {
            warn!(target: "call.registry", peer = %peer, error = %e, "Answering incoming call failed");
            metrics::record_collaborator_failure("answer");
            connection.close();
            return InboundOutcome::Failed(e);
        }

        info!(
            target: "call.registry",
            peer = %peer,
            connection_id = %connection.id(),
            "Accepted incoming call"
        );
        metrics::record_dial(DialDirection::Inbound);

        let entry = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerEntry::new(peer));
        let replaced = entry.connection.is_some();
        entry.attach(connection, DialDirection::Inbound);
        metrics::set_remote_peers(self.peers.len());
        InboundOutcome::Accepted { replaced }
    }

    /// Applies a connection lifecycle event.
    pub fn on_connection_event(
        &mut self,
        peer: &ParticipantIdentity,
        connection_id: ConnectionId,
        event: &ConnectionEvent,
    ) -> ConnectionUpdate {
        let Some(entry) = self.peers.get_mut(peer) else {
            return ConnectionUpdate::Unknown;
        };
        if entry.current_id() != Some(connection_id) {
            return ConnectionUpdate::Stale;
        }

        match event {
            ConnectionEvent::StreamReceived(stream) => {
                entry.state.camera_on = stream.has_video;
                entry.state.audio_on = stream.has_audio;
                entry.state.stream = Some(stream.clone());
                entry.state.reconnecting = false;
                if let Some(current) = entry.connection.as_mut() {
                    current.open = true;
                }
            }
            ConnectionEvent::Closed | ConnectionEvent::Error(_) => entry.mark_dropped(),
        }
        ConnectionUpdate::Applied
    }

    /// The transport reported the peer as unreachable.
    pub fn mark_unreachable(&mut self, peer: &ParticipantIdentity) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) if entry.connection.is_some() => {
                entry.mark_dropped();
                true
            }
            _ => false,
        }
    }

    /// Closes every connection and forgets all peers. Returns how many
    /// connections were closed.
    pub fn close_all(&mut self) -> usize {
        let closed: usize = self
            .peers
            .values_mut()
            .map(PeerEntry::close_all)
            .sum();
        self.peers.clear();
        metrics::set_remote_peers(0);
        closed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    #[derive(Debug)]
    struct FakeConnection {
        id: ConnectionId,
        peer: ParticipantIdentity,
        closed: AtomicBool,
        answered: AtomicBool,
        fail_answer: bool,
    }

    impl FakeConnection {
        fn new(peer: &ParticipantIdentity) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId(NEXT_ID.fetch_add(1, Ordering::SeqCst)),
                peer: peer.clone(),
                closed: AtomicBool::new(false),
                answered: AtomicBool::new(false),
                fail_answer: false,
            })
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl MediaConnection for FakeConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn peer(&self) -> &ParticipantIdentity {
            &self.peer
        }
        fn answer(&self, _stream: &LocalStream) -> Result<(), CallError> {
            if self.fail_answer {
                return Err(CallError::Dial("ice failed".to_string()));
            }
            self.answered.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    struct FakeDialer {
        dials: Mutex<Vec<Arc<FakeConnection>>>,
        failures: AtomicUsize,
    }

    impl FakeDialer {
        fn dial_count(&self) -> usize {
            self.dials.lock().unwrap().len()
        }

        fn last(&self) -> Arc<FakeConnection> {
            Arc::clone(self.dials.lock().unwrap().last().unwrap())
        }
    }

    impl TransportHandle for FakeDialer {
        fn identity(&self) -> &ParticipantIdentity {
            unreachable!("not used by the registry")
        }
        fn dial(
            &self,
            peer: &ParticipantIdentity,
            _stream: &LocalStream,
        ) -> Result<Arc<dyn MediaConnection>, CallError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CallError::Dial("peer-unavailable".to_string()));
            }
            let connection = FakeConnection::new(peer);
            self.dials.lock().unwrap().push(Arc::clone(&connection));
            Ok(connection)
        }
        fn destroy(&self) -> Result<(), CallError> {
            Ok(())
        }
        fn is_destroyed(&self) -> bool {
            false
        }
    }

    fn id(raw: &str) -> ParticipantIdentity {
        ParticipantIdentity::parse(raw).unwrap()
    }

    fn present(ids: &[&str]) -> BTreeSet<ParticipantIdentity> {
        ids.iter().map(|raw| id(raw)).collect()
    }

    fn stream() -> LocalStream {
        LocalStream::new("local", Vec::new())
    }

    fn remote_stream(video: bool) -> RemoteStream {
        RemoteStream {
            stream_id: "remote".to_string(),
            has_audio: true,
            has_video: video,
        }
    }

    #[test]
    fn test_reconcile_dials_present_remotes_only() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        let outcome = registry.reconcile(
            &present(&["alice", "bob", "carol"]),
            &id("alice"),
            Some(&dialer),
            Some(&local_stream),
        );

        assert_eq!(outcome.dialed, vec![id("bob"), id("carol")]);
        assert_eq!(dialer.dial_count(), 2);
        assert!(registry.get(&id("alice")).is_none());

        let bob = registry.get(&id("bob")).unwrap();
        assert!(bob.stream.is_none());
        assert!(!bob.reconnecting);
        assert_eq!(registry.direction(&id("bob")), Some(DialDirection::Outbound));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();
        let members = present(&["alice", "bob"]);

        for _ in 0..5 {
            registry.reconcile(&members, &id("alice"), Some(&dialer), Some(&local_stream));
        }

        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(registry.live_connections(), 1);
    }

    #[test]
    fn test_without_dialer_states_exist_but_no_dial() {
        let mut registry = PeerRegistry::new();
        let local_stream = stream();

        let outcome = registry.reconcile(
            &present(&["alice", "bob"]),
            &id("alice"),
            None,
            Some(&local_stream),
        );

        assert!(outcome.dialed.is_empty());
        assert!(registry.get(&id("bob")).is_some());

        let dialer = FakeDialer::default();
        registry.reconcile(
            &present(&["alice", "bob"]),
            &id("alice"),
            Some(&dialer),
            Some(&local_stream),
        );
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test]
    fn test_without_stream_no_dial() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();

        registry.reconcile(&present(&["alice", "bob"]), &id("alice"), Some(&dialer), None);

        assert_eq!(dialer.dial_count(), 0);
    }

    #[test]
    fn test_departed_peer_closed_and_removed() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(
            &present(&["alice", "bob"]),
            &id("alice"),
            Some(&dialer),
            Some(&local_stream),
        );
        let bob_connection = dialer.last();

        let outcome = registry.reconcile(
            &present(&["alice"]),
            &id("alice"),
            Some(&dialer),
            Some(&local_stream),
        );

        assert_eq!(outcome.removed, vec![id("bob")]);
        assert!(bob_connection.is_closed());
        assert!(registry.get(&id("bob")).is_none());
    }

    #[test]
    fn test_presence_flicker_with_open_connection_does_not_redial() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();
        let alice = id("alice");

        registry.reconcile(&present(&["alice", "bob"]), &alice, Some(&dialer), Some(&local_stream));
        let first = dialer.last();
        registry.on_connection_event(
            &id("bob"),
            first.id,
            &ConnectionEvent::StreamReceived(remote_stream(true)),
        );

        // Same membership delivered again in a different order of triggers.
        registry.reconcile(&present(&["bob", "alice"]), &alice, Some(&dialer), Some(&local_stream));

        assert_eq!(dialer.dial_count(), 1);
        assert!(!first.is_closed());
    }

    #[test]
    fn test_stream_received_sets_state() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("a"), Some(&dialer), Some(&local_stream));
        let connection = dialer.last();

        let update = registry.on_connection_event(
            &id("b"),
            connection.id,
            &ConnectionEvent::StreamReceived(remote_stream(true)),
        );

        assert_eq!(update, ConnectionUpdate::Applied);
        let b = registry.get(&id("b")).unwrap();
        assert!(b.stream.is_some());
        assert!(!b.reconnecting);
        assert!(b.camera_on);
        assert_eq!(b.tile(), PeerTile::Video);
    }

    #[test]
    fn test_audio_only_stream_shows_camera_off() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("a"), Some(&dialer), Some(&local_stream));
        registry.on_connection_event(
            &id("b"),
            dialer.last().id,
            &ConnectionEvent::StreamReceived(remote_stream(false)),
        );

        let b = registry.get(&id("b")).unwrap();
        assert!(!b.camera_on);
        assert!(b.audio_on);
        assert_eq!(b.tile(), PeerTile::CameraOff);
    }

    #[test]
    fn test_close_marks_reconnecting_and_next_reconcile_redials() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();
        let members = present(&["a", "b"]);

        registry.reconcile(&members, &id("a"), Some(&dialer), Some(&local_stream));
        let first = dialer.last();
        registry.on_connection_event(
            &id("b"),
            first.id,
            &ConnectionEvent::StreamReceived(remote_stream(true)),
        );
        registry.on_connection_event(&id("b"), first.id, &ConnectionEvent::Closed);

        let b = registry.get(&id("b")).unwrap();
        assert!(b.stream.is_none());
        assert!(b.reconnecting);
        assert_eq!(b.tile(), PeerTile::Reconnecting);
        assert!(!registry.has_live_connection(&id("b")));

        // Close alone does not dial; the next membership evaluation does.
        assert_eq!(dialer.dial_count(), 1);
        registry.reconcile(&members, &id("a"), Some(&dialer), Some(&local_stream));
        assert_eq!(dialer.dial_count(), 2);
        assert!(!registry.get(&id("b")).unwrap().reconnecting);
    }

    #[test]
    fn test_error_behaves_like_close() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("a"), Some(&dialer), Some(&local_stream));
        let update = registry.on_connection_event(
            &id("b"),
            dialer.last().id,
            &ConnectionEvent::Error("ice connection failed".to_string()),
        );

        assert_eq!(update, ConnectionUpdate::Applied);
        assert!(registry.get(&id("b")).unwrap().reconnecting);
    }

    #[test]
    fn test_events_from_replaced_connection_are_stale() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("b"), Some(&dialer), Some(&local_stream));
        let outbound = dialer.last();

        let inbound = FakeConnection::new(&id("a"));
        let outcome = registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("b"));
        assert!(matches!(outcome, InboundOutcome::Accepted { replaced: true }));
        assert!(outbound.is_closed());

        // Late close of the outbound leg must not mark the peer as reconnecting.
        let update = registry.on_connection_event(&id("a"), outbound.id, &ConnectionEvent::Closed);
        assert_eq!(update, ConnectionUpdate::Stale);
        assert!(!registry.get(&id("a")).unwrap().reconnecting);
        assert_eq!(registry.connection_id(&id("a")), Some(inbound.id));
    }

    #[test]
    fn test_inbound_from_unknown_peer_creates_state() {
        let mut registry = PeerRegistry::new();
        let local_stream = stream();
        let inbound = FakeConnection::new(&id("dave"));

        let outcome = registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("a"));

        assert!(matches!(outcome, InboundOutcome::Accepted { replaced: false }));
        assert!(inbound.answered.load(Ordering::SeqCst));
        assert_eq!(registry.direction(&id("dave")), Some(DialDirection::Inbound));
        assert!(registry.has_live_connection(&id("dave")));
    }

    #[test]
    fn test_inbound_from_self_ignored() {
        let mut registry = PeerRegistry::new();
        let local_stream = stream();
        let inbound = FakeConnection::new(&id("a"));

        let outcome = registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("a"));

        assert!(matches!(outcome, InboundOutcome::Ignored));
        assert!(!inbound.answered.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_inbound_without_stream_dropped() {
        let mut registry = PeerRegistry::new();
        let inbound = FakeConnection::new(&id("b"));

        let outcome = registry.accept_inbound(inbound.clone(), None, &id("a"));

        assert!(matches!(outcome, InboundOutcome::Dropped));
        assert!(inbound.is_closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_inbound_answer_failure_not_registered() {
        let mut registry = PeerRegistry::new();
        let local_stream = stream();
        let inbound = Arc::new(FakeConnection {
            id: ConnectionId(NEXT_ID.fetch_add(1, Ordering::SeqCst)),
            peer: id("b"),
            closed: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            fail_answer: true,
        });

        let outcome = registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("a"));

        assert!(matches!(outcome, InboundOutcome::Failed(CallError::Dial(_))));
        assert!(inbound.is_closed());
        assert!(registry.get(&id("b")).is_none());
    }

    #[test]
    fn test_simultaneous_dial_lower_identity_keeps_own_dial() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("a"), Some(&dialer), Some(&local_stream));
        let outbound = dialer.last();
        let inbound = FakeConnection::new(&id("b"));
        let outcome = registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("a"));

        assert!(matches!(outcome, InboundOutcome::Declined));
        assert!(inbound.is_closed());
        assert!(!inbound.answered.load(Ordering::SeqCst));
        assert!(!outbound.is_closed());
        assert_eq!(registry.connection_id(&id("b")), Some(outbound.id));
    }

    #[test]
    fn test_simultaneous_dial_higher_identity_takes_inbound() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("b"), Some(&dialer), Some(&local_stream));
        let outbound = dialer.last();
        let inbound = FakeConnection::new(&id("a"));
        registry.accept_inbound(inbound.clone(), Some(&local_stream), &id("b"));

        assert!(outbound.is_closed());
        assert!(!inbound.is_closed());
        assert!(inbound.answered.load(Ordering::SeqCst));
        assert_eq!(registry.direction(&id("a")), Some(DialDirection::Inbound));
    }

    #[test]
    fn test_inbound_replacing_inbound_closes_previous() {
        let mut registry = PeerRegistry::new();
        let local_stream = stream();
        let first = FakeConnection::new(&id("b"));
        let second = FakeConnection::new(&id("b"));

        registry.accept_inbound(first.clone(), Some(&local_stream), &id("a"));
        let outcome = registry.accept_inbound(second.clone(), Some(&local_stream), &id("a"));

        assert!(matches!(outcome, InboundOutcome::Accepted { replaced: true }));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.close_all(), 1);
    }

    #[test]
    fn test_dial_failure_reported_and_retried_later() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        dialer.failures.store(1, Ordering::SeqCst);
        let local_stream = stream();
        let members = present(&["a", "b"]);

        let outcome = registry.reconcile(&members, &id("a"), Some(&dialer), Some(&local_stream));
        assert_eq!(outcome.failed.len(), 1);
        assert!(registry.get(&id("b")).is_some());
        assert!(!registry.has_live_connection(&id("b")));

        let outcome = registry.reconcile(&members, &id("a"), Some(&dialer), Some(&local_stream));
        assert_eq!(outcome.dialed, vec![id("b")]);
    }

    #[test]
    fn test_mark_unreachable() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(&present(&["a", "b"]), &id("a"), Some(&dialer), Some(&local_stream));

        assert!(registry.mark_unreachable(&id("b")));
        assert!(registry.get(&id("b")).unwrap().reconnecting);
        assert!(!registry.mark_unreachable(&id("zed")));
    }

    #[test]
    fn test_close_all() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();

        registry.reconcile(
            &present(&["a", "b", "c"]),
            &id("a"),
            Some(&dialer),
            Some(&local_stream),
        );
        let connections = dialer.dials.lock().unwrap().clone();

        assert_eq!(registry.close_all(), 2);
        assert!(connections.iter().all(|c| c.is_closed()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_never_two_live_connections_per_peer() {
        let mut registry = PeerRegistry::new();
        let dialer = FakeDialer::default();
        let local_stream = stream();
        let snapshots = [
            present(&["a", "b"]),
            present(&["a"]),
            present(&["a", "b", "c"]),
            present(&["a", "b", "c"]),
            present(&["a", "c"]),
            present(&["a", "b", "c"]),
        ];

        for snapshot in &snapshots {
            registry.reconcile(snapshot, &id("a"), Some(&dialer), Some(&local_stream));
            let dials = dialer.dials.lock().unwrap();
            for peer in ["b", "c"] {
                let open = dials
                    .iter()
                    .filter(|c| c.peer.as_str() == peer && !c.is_closed())
                    .count();
                assert!(open <= 1, "peer {peer} has {open} open connections");
            }
        }
    }
}
