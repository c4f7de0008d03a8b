//! The single inbound event stream of a call session.
//!
//! Presence snapshots, signal messages, transport lifecycle, per-connection
//! lifecycle and view commands are all funnelled into one unbounded channel
//! consumed by the session actor, so state is only ever touched from one task.

use crate::identity::ParticipantIdentity;
use crate::media::RemoteStream;
use crate::presence::PresenceRecord;
use crate::signaling::SignalMessage;
use crate::transport::{ConnectionId, MediaConnection, TransportErrorKind};
use crate::view::{CallView, CleanupReport};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle of one transport handle.
#[derive(Debug)]
pub enum TransportEvent {
    /// Registration with the signaling server succeeded.
    Opened,
    /// Signaling connectivity was lost.
    Disconnected,
    /// The handle is fully torn down.
    Closed,
    Error(TransportErrorKind),
    /// A remote participant is calling.
    IncomingCall(Arc<dyn MediaConnection>),
}

/// Lifecycle of one media connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StreamReceived(RemoteStream),
    Closed,
    Error(String),
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::StreamReceived(_) => "stream",
            ConnectionEvent::Closed => "close",
            ConnectionEvent::Error(_) => "error",
        }
    }
}

/// Intents from the call view.
#[derive(Debug)]
pub enum SessionCommand {
    ToggleAudio,
    ToggleVideo,
    Snapshot {
        respond_to: oneshot::Sender<CallView>,
    },
    Leave {
        respond_to: oneshot::Sender<CleanupReport>,
    },
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Full membership snapshot from the presence channel.
    Presence(Vec<PresenceRecord>),
    /// Newly added signaling message.
    Signal(SignalMessage),
    /// Transport lifecycle, tagged with the allocation generation.
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Connection {
        peer: ParticipantIdentity,
        connection_id: ConnectionId,
        event: ConnectionEvent,
    },
    Command(SessionCommand),
}

/// Where a transport handle reports its events.
///
/// Each allocation gets a sink tagged with its generation, so events from a
/// handle that has since been replaced can be told apart.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    /// Sink for events of the connection `connection_id` to `peer`.
    pub fn connection_sink(
        &self,
        peer: ParticipantIdentity,
        connection_id: ConnectionId,
    ) -> ConnectionEventSink {
        ConnectionEventSink {
            peer,
            connection_id,
            tx: self.tx.clone(),
        }
    }
}

/// Where a media connection reports its events.
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    peer: ParticipantIdentity,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionEventSink {
    pub fn peer(&self) -> &ParticipantIdentity {
        &self.peer
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns false once the session has shut down.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx
            .send(SessionEvent::Connection {
                peer: self.peer.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }
}
