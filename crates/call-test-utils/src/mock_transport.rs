//! Scriptable transport library.
//!
//! Every allocation is recorded. By default a new handle reports `Opened`
//! immediately and a destroyed handle reports `Closed` immediately; both can
//! be switched to manual so tests decide when registration and teardown
//! complete.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = MockTransportFactory::new().with_manual_teardown();
//! // ... start a session with it ...
//! transport.latest().disconnect();
//! tokio::time::advance(Duration::from_millis(3000)).await;
//! transport.session(0).complete_teardown();
//! assert_eq!(transport.allocation_count(), 2);
//! ```

use call_session::errors::CallError;
use call_session::events::{ConnectionEvent, ConnectionEventSink, TransportEvent, TransportEventSink};
use call_session::identity::ParticipantIdentity;
use call_session::media::{LocalStream, RemoteStream};
use call_session::transport::{
    ConnectionId, MediaConnection, TransportConfig, TransportErrorKind, TransportFactory,
    TransportHandle,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock transport library.
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    inner: Arc<Mutex<FactoryInner>>,
    next_connection_id: Arc<AtomicU64>,
}

#[derive(Debug)]
struct FactoryInner {
    auto_open: bool,
    manual_teardown: bool,
    failing_destroy: bool,
    failing_allocations: usize,
    handles: Vec<Arc<MockTransportHandle>>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FactoryInner {
                auto_open: true,
                manual_teardown: false,
                failing_destroy: false,
                failing_allocations: 0,
                handles: Vec::new(),
            })),
            next_connection_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// New handles stay in `Connecting` until the test calls `open()`.
    pub fn without_auto_open(self) -> Self {
        self.inner.lock().unwrap().auto_open = false;
        self
    }

    /// `destroy()` does not report `Closed`; the test calls
    /// `complete_teardown()`.
    pub fn with_manual_teardown(self) -> Self {
        self.inner.lock().unwrap().manual_teardown = true;
        self
    }

    /// `destroy()` returns an error and leaves the handle alive.
    pub fn with_failing_destroy(self) -> Self {
        self.inner.lock().unwrap().failing_destroy = true;
        self
    }

    /// The next `count` allocations fail synchronously.
    pub fn with_failing_allocations(self, count: usize) -> Self {
        self.inner.lock().unwrap().failing_allocations = count;
        self
    }

    /// Number of handles created (failed allocations not counted).
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    /// The `index`-th handle created.
    pub fn session(&self, index: usize) -> Arc<MockTransportHandle> {
        let inner = self.inner.lock().unwrap();
        Arc::clone(
            inner
                .handles
                .get(index)
                .unwrap_or_else(|| panic!("no transport allocation #{index}")),
        )
    }

    /// The most recently created handle.
    pub fn latest(&self) -> Arc<MockTransportHandle> {
        let inner = self.inner.lock().unwrap();
        Arc::clone(inner.handles.last().expect("no transport allocated"))
    }

    /// Identities of all allocations, in order.
    pub fn identities(&self) -> Vec<ParticipantIdentity> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .iter()
            .map(|h| h.identity.clone())
            .collect()
    }

    /// Handles not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .handles
            .iter()
            .filter(|h| !h.is_destroyed())
            .count()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create_session(
        &self,
        identity: &ParticipantIdentity,
        _config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>, CallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_allocations > 0 {
            inner.failing_allocations -= 1;
            return Err(CallError::Transport("allocation refused".to_string()));
        }

        let handle = Arc::new(MockTransportHandle {
            identity: identity.clone(),
            events,
            manual_teardown: inner.manual_teardown,
            fail_destroy: inner.failing_destroy,
            destroyed: AtomicBool::new(false),
            destroy_calls: AtomicUsize::new(0),
            dials: Mutex::new(Vec::new()),
            next_connection_id: Arc::clone(&self.next_connection_id),
        });
        inner.handles.push(Arc::clone(&handle));
        if inner.auto_open {
            handle.open();
        }
        Ok(handle)
    }
}

/// One recorded allocation.
#[derive(Debug)]
pub struct MockTransportHandle {
    identity: ParticipantIdentity,
    events: TransportEventSink,
    manual_teardown: bool,
    fail_destroy: bool,
    destroyed: AtomicBool,
    destroy_calls: AtomicUsize,
    dials: Mutex<Vec<Arc<MockConnection>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl MockTransportHandle {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    pub fn open(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn disconnect(&self) {
        self.emit(TransportEvent::Disconnected);
    }

    pub fn error(&self, kind: TransportErrorKind) {
        self.emit(TransportEvent::Error(kind));
    }

    pub fn unavailable_id(&self) {
        self.error(TransportErrorKind::UnavailableId);
    }

    /// Reports the `Closed` that ends a teardown.
    pub fn complete_teardown(&self) {
        self.emit(TransportEvent::Closed);
    }

    /// Delivers an inbound call from `from`.
    pub fn incoming_call(&self, from: &str) -> Arc<MockConnection> {
        let peer = ParticipantIdentity::parse(from).unwrap();
        let connection = self.new_connection(peer);
        self.emit(TransportEvent::IncomingCall(connection.clone()));
        connection
    }

    /// Outbound connections, in dial order.
    pub fn dials(&self) -> Vec<Arc<MockConnection>> {
        self.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    pub fn dials_to(&self, peer: &str) -> usize {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.peer.as_str() == peer)
            .count()
    }

    /// Most recent outbound connection to `peer`.
    pub fn dial_to(&self, peer: &str) -> Arc<MockConnection> {
        self.dials
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.peer.as_str() == peer)
            .cloned()
            .unwrap_or_else(|| panic!("no dial to {peer}"))
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn new_connection(&self, peer: ParticipantIdentity) -> Arc<MockConnection> {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1);
        Arc::new(MockConnection {
            id,
            sink: self.events.connection_sink(peer.clone(), id),
            peer,
            closed: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            fail_answer: AtomicBool::new(false),
        })
    }
}

impl TransportHandle for MockTransportHandle {
    fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    fn dial(
        &self,
        peer: &ParticipantIdentity,
        _stream: &LocalStream,
    ) -> Result<Arc<dyn MediaConnection>, CallError> {
        if self.is_destroyed() {
            return Err(CallError::Transport("handle destroyed".to_string()));
        }
        let connection = self.new_connection(peer.clone());
        self.dials.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }

    fn destroy(&self) -> Result<(), CallError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(CallError::Transport("destroy refused".to_string()));
        }
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.manual_teardown {
            self.complete_teardown();
        }
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// One media connection, outbound or inbound.
#[derive(Debug)]
pub struct MockConnection {
    id: ConnectionId,
    peer: ParticipantIdentity,
    sink: ConnectionEventSink,
    closed: AtomicBool,
    answered: AtomicBool,
    fail_answer: AtomicBool,
}

impl MockConnection {
    /// The remote side's stream arrives.
    pub fn deliver_stream(&self, has_audio: bool, has_video: bool) {
        self.sink.emit(ConnectionEvent::StreamReceived(RemoteStream {
            stream_id: format!("{}-stream", self.peer),
            has_audio,
            has_video,
        }));
    }

    /// The remote side hung up.
    pub fn remote_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sink.emit(ConnectionEvent::Closed);
    }

    pub fn fail(&self, detail: &str) {
        self.sink.emit(ConnectionEvent::Error(detail.to_string()));
    }

    /// Makes the next `answer()` fail.
    pub fn refuse_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn was_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }
}

impl MediaConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> &ParticipantIdentity {
        &self.peer
    }

    fn answer(&self, _stream: &LocalStream) -> Result<(), CallError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(CallError::Dial("answer refused".to_string()));
        }
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sink.emit(ConnectionEvent::Closed);
        }
    }
}
