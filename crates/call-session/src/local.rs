//! In-process collaborators.
//!
//! [`LocalHub`] plays every external system at once: a presence store, a
//! signaling relay, a signaling server with loopback media connections, and
//! synthetic capture devices. Sessions sharing a hub can call each other in
//! one process. Used by the harness binary and the loopback tests.

use crate::errors::CallError;
use crate::events::{ConnectionEvent, ConnectionEventSink, TransportEvent, TransportEventSink};
use crate::identity::ParticipantIdentity;
use crate::media::{
    LocalStream, LocalTrack, MediaConstraints, MediaDevices, RemoteStream, TrackKind,
};
use crate::presence::{PresenceChannel, PresenceRecord};
use crate::session::Collaborators;
use crate::signaling::{SignalMessage, SignalPayload, SignalingRelay};
use crate::transport::{
    ConnectionId, MediaConnection, TransportConfig, TransportErrorKind, TransportFactory,
    TransportHandle,
};
use async_trait::async_trait;
use chrono::Utc;
use common::types::MeetingId;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

struct Endpoint {
    handle_id: u64,
    sink: TransportEventSink,
}

#[derive(Default)]
struct HubInner {
    presence: HashMap<MeetingId, BTreeMap<ParticipantIdentity, PresenceRecord>>,
    presence_watchers: HashMap<MeetingId, Vec<mpsc::UnboundedSender<Vec<PresenceRecord>>>>,
    signals: HashMap<MeetingId, Vec<SignalMessage>>,
    signal_watchers: HashMap<MeetingId, Vec<mpsc::UnboundedSender<SignalMessage>>>,
    endpoints: HashMap<ParticipantIdentity, Endpoint>,
    next_handle_id: u64,
    next_connection_id: u64,
}

impl HubInner {
    fn broadcast_presence(&mut self, meeting_id: &MeetingId) {
        let snapshot: Vec<PresenceRecord> = self
            .presence
            .get(meeting_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        if let Some(watchers) = self.presence_watchers.get_mut(meeting_id) {
            watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

/// Shared in-process hub. Cloning is cheap; clones share state.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every collaborator of a session, backed by this hub.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            presence: Arc::new(self.clone()),
            signaling: Arc::new(self.clone()),
            transport: Arc::new(self.clone()),
            media: Arc::new(self.clone()),
        }
    }

    /// Whether `identity` is registered with the loopback signaling server.
    pub fn is_registered(&self, identity: &ParticipantIdentity) -> bool {
        self.lock()
            .map(|inner| inner.endpoints.contains_key(identity))
            .unwrap_or(false)
    }

    /// Drops the signaling connection of `identity`, as a server restart
    /// would. Returns false if it was not registered.
    pub fn interrupt(&self, identity: &ParticipantIdentity) -> Result<bool, CallError> {
        let mut inner = self.lock()?;
        match inner.endpoints.remove(identity) {
            Some(endpoint) => {
                info!(target: "call.local", identity = %identity, "Interrupting signaling connection");
                endpoint.sink.emit(TransportEvent::Disconnected);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Presence records currently stored for `meeting_id`.
    pub fn presence_of(&self, meeting_id: &MeetingId) -> Result<Vec<PresenceRecord>, CallError> {
        let inner = self.lock()?;
        Ok(inner
            .presence
            .get(meeting_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Signal messages currently stored for `meeting_id`.
    pub fn signals_of(&self, meeting_id: &MeetingId) -> Result<Vec<SignalMessage>, CallError> {
        let inner = self.lock()?;
        Ok(inner.signals.get(meeting_id).cloned().unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubInner>, CallError> {
        self.inner
            .lock()
            .map_err(|_| CallError::Internal("local hub lock poisoned".to_string()))
    }

    fn unregister(&self, identity: &ParticipantIdentity, handle_id: u64) -> Result<(), CallError> {
        let mut inner = self.lock()?;
        if inner
            .endpoints
            .get(identity)
            .is_some_and(|endpoint| endpoint.handle_id == handle_id)
        {
            inner.endpoints.remove(identity);
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceChannel for LocalHub {
    async fn publish(&self, meeting_id: &MeetingId, record: &PresenceRecord) -> Result<(), CallError> {
        let mut inner = self.lock()?;
        inner
            .presence
            .entry(meeting_id.clone())
            .or_default()
            .insert(record.identity.clone(), record.clone());
        inner.broadcast_presence(meeting_id);
        Ok(())
    }

    async fn refresh(
        &self,
        meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError> {
        let mut inner = self.lock()?;
        let record = inner
            .presence
            .get_mut(meeting_id)
            .and_then(|records| records.get_mut(identity))
            .ok_or_else(|| CallError::Presence(format!("no presence record for {identity}")))?;
        record.last_active_at = Utc::now();
        inner.broadcast_presence(meeting_id);
        Ok(())
    }

    async fn remove(
        &self,
        meeting_id: &MeetingId,
        identity: &ParticipantIdentity,
    ) -> Result<(), CallError> {
        let mut inner = self.lock()?;
        if let Some(records) = inner.presence.get_mut(meeting_id) {
            records.remove(identity);
        }
        inner.broadcast_presence(meeting_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, Vec<PresenceRecord>>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        let snapshot: Vec<PresenceRecord> = inner
            .presence
            .get(meeting_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        let _ = tx.send(snapshot);
        inner
            .presence_watchers
            .entry(meeting_id.clone())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl SignalingRelay for LocalHub {
    async fn announce(
        &self,
        meeting_id: &MeetingId,
        from: &ParticipantIdentity,
        payload: &SignalPayload,
    ) -> Result<(), CallError> {
        let message = SignalMessage::new(from.clone(), payload.clone());
        let mut inner = self.lock()?;
        inner
            .signals
            .entry(meeting_id.clone())
            .or_default()
            .push(message.clone());
        if let Some(watchers) = inner.signal_watchers.get_mut(meeting_id) {
            watchers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<BoxStream<'static, SignalMessage>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        for message in inner.signals.get(meeting_id).into_iter().flatten() {
            let _ = tx.send(message.clone());
        }
        inner
            .signal_watchers
            .entry(meeting_id.clone())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn clear(&self, meeting_id: &MeetingId) -> Result<(), CallError> {
        let mut inner = self.lock()?;
        inner.signals.remove(meeting_id);
        Ok(())
    }
}

impl TransportFactory for LocalHub {
    fn create_session(
        &self,
        identity: &ParticipantIdentity,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>, CallError> {
        let mut inner = self.lock()?;
        inner.next_handle_id += 1;
        let handle_id = inner.next_handle_id;

        if inner.endpoints.contains_key(identity) {
            debug!(target: "call.local", identity = %identity, "Identity already registered");
            events.emit(TransportEvent::Error(TransportErrorKind::UnavailableId));
        } else {
            debug!(
                target: "call.local",
                identity = %identity,
                server = %config.signaling_url(),
                "Endpoint registered"
            );
            inner.endpoints.insert(
                identity.clone(),
                Endpoint {
                    handle_id,
                    sink: events.clone(),
                },
            );
            events.emit(TransportEvent::Opened);
        }

        Ok(Arc::new(LocalTransportHandle {
            hub: self.clone(),
            identity: identity.clone(),
            handle_id,
            events,
            destroyed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl MediaDevices for LocalHub {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, CallError> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(SyntheticTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(SyntheticTrack::new(TrackKind::Video)));
        }
        if tracks.is_empty() {
            return Err(CallError::MediaAcquisition(
                "neither audio nor video requested".to_string(),
            ));
        }
        Ok(LocalStream::new(Uuid::new_v4().to_string(), tracks))
    }
}

/// Capture track that produces nothing.
#[derive(Debug)]
pub struct SyntheticTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SyntheticTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl LocalTrack for SyntheticTrack {
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

struct LocalTransportHandle {
    hub: LocalHub,
    identity: ParticipantIdentity,
    handle_id: u64,
    events: TransportEventSink,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for LocalTransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransportHandle")
            .field("identity", &self.identity)
            .field("handle_id", &self.handle_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl TransportHandle for LocalTransportHandle {
    fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    fn dial(
        &self,
        peer: &ParticipantIdentity,
        stream: &LocalStream,
    ) -> Result<Arc<dyn MediaConnection>, CallError> {
        if self.is_destroyed() {
            return Err(CallError::Transport("transport handle destroyed".to_string()));
        }
        let mut inner = self.hub.lock()?;
        inner.next_connection_id += 1;
        let id = ConnectionId(inner.next_connection_id);
        let caller_sink = self.events.connection_sink(peer.clone(), id);

        let Some(callee) = inner.endpoints.get(peer) else {
            debug!(target: "call.local", peer = %peer, "Dialed identity is not registered");
            self.events
                .emit(TransportEvent::Error(TransportErrorKind::PeerUnavailable(peer.clone())));
            let link = Arc::new(Link::unanswered(id, caller_sink));
            return Ok(Arc::new(LocalConnection {
                link,
                peer: peer.clone(),
                side: Side::Caller,
            }));
        };

        let link = Arc::new(Link {
            id,
            caller_stream: stream.describe(),
            caller_sink,
            callee_sink: Some(callee.sink.connection_sink(self.identity.clone(), id)),
            closed: AtomicBool::new(false),
        });
        callee.sink.emit(TransportEvent::IncomingCall(Arc::new(LocalConnection {
            link: Arc::clone(&link),
            peer: self.identity.clone(),
            side: Side::Callee,
        })));
        Ok(Arc::new(LocalConnection {
            link,
            peer: peer.clone(),
            side: Side::Caller,
        }))
    }

    fn destroy(&self) -> Result<(), CallError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.hub.unregister(&self.identity, self.handle_id)?;
        debug!(target: "call.local", identity = %self.identity, "Endpoint destroyed");
        self.events.emit(TransportEvent::Closed);
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Both ends of one loopback media connection.
struct Link {
    id: ConnectionId,
    caller_stream: RemoteStream,
    caller_sink: ConnectionEventSink,
    /// `None` when the dialed identity was not registered.
    callee_sink: Option<ConnectionEventSink>,
    closed: AtomicBool,
}

impl Link {
    fn unanswered(id: ConnectionId, caller_sink: ConnectionEventSink) -> Self {
        Self {
            id,
            caller_stream: RemoteStream {
                stream_id: String::new(),
                has_audio: false,
                has_video: false,
            },
            caller_sink,
            callee_sink: None,
            closed: AtomicBool::new(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

struct LocalConnection {
    link: Arc<Link>,
    peer: ParticipantIdentity,
    side: Side,
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.link.id)
            .field("peer", &self.peer)
            .field("side", &self.side)
            .finish()
    }
}

impl MediaConnection for LocalConnection {
    fn id(&self) -> ConnectionId {
        self.link.id
    }

    fn peer(&self) -> &ParticipantIdentity {
        &self.peer
    }

    fn answer(&self, stream: &LocalStream) -> Result<(), CallError> {
        let Some(callee_sink) = self.link.callee_sink.as_ref() else {
            return Err(CallError::Dial("no remote endpoint".to_string()));
        };
        if self.side != Side::Callee {
            return Err(CallError::Dial("only the called side can answer".to_string()));
        }
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(CallError::Dial("connection already closed".to_string()));
        }
        self.link
            .caller_sink
            .emit(ConnectionEvent::StreamReceived(stream.describe()));
        callee_sink.emit(ConnectionEvent::StreamReceived(self.link.caller_stream.clone()));
        Ok(())
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link.caller_sink.emit(ConnectionEvent::Closed);
        if let Some(callee_sink) = &self.link.callee_sink {
            callee_sink.emit(ConnectionEvent::Closed);
        }
    }
}
