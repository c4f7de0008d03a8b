//! Peer transport contracts and the session manager built on them.
//!
//! The transport library registers the local endpoint under a
//! [`ParticipantIdentity`] with a signaling server and creates direct media
//! connections. Everything it reports arrives later through the
//! [`TransportEventSink`] handed to [`TransportFactory::create_session`].

pub mod manager;
pub mod state;

use crate::config::DEFAULT_STUN_URL;
use crate::errors::CallError;
use crate::events::TransportEventSink;
use crate::identity::ParticipantIdentity;
use crate::media::LocalStream;
use common::secret::SecretString;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub use manager::TransportManager;
pub use state::{TransportAction, TransportPhase, TransportStateMachine};

/// Identifier of one media connection, unique per transport library instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// STUN/TURN server entry. `Debug` never prints the credential.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<SecretString>,
}

impl IceServer {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

/// Signaling server location and ICE configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub ice_servers: Vec<IceServer>,
}

impl Default for TransportConfig {
    /// Local development signaling server with the public STUN server.
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            path: "/peerjs".to_string(),
            secure: false,
            ice_servers: vec![IceServer::stun(vec![DEFAULT_STUN_URL.to_string()])],
        }
    }
}

impl TransportConfig {
    pub fn signaling_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Error kinds reported by the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The requested identity is registered by another live endpoint.
    UnavailableId,
    /// A dialed peer is not registered with the signaling server.
    PeerUnavailable(ParticipantIdentity),
    /// Connection to the signaling server failed or dropped.
    Network,
    /// The signaling server rejected or failed the request.
    ServerError,
    Other(String),
}

impl TransportErrorKind {
    /// Bounded label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::UnavailableId => "unavailable-id",
            TransportErrorKind::PeerUnavailable(_) => "peer-unavailable",
            TransportErrorKind::Network => "network",
            TransportErrorKind::ServerError => "server-error",
            TransportErrorKind::Other(_) => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::PeerUnavailable(peer) => write!(f, "peer-unavailable({peer})"),
            TransportErrorKind::Other(detail) => write!(f, "other({detail})"),
            kind => f.write_str(kind.as_str()),
        }
    }
}

/// Creates transport sessions.
pub trait TransportFactory: Send + Sync {
    /// Starts registering `identity` with the signaling server.
    ///
    /// Must not block: the outcome (`Opened`, or `Error(UnavailableId)` etc.)
    /// is delivered through `events`.
    fn create_session(
        &self,
        identity: &ParticipantIdentity,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>, CallError>;
}

/// One registration with the signaling server.
pub trait TransportHandle: Send + Sync + fmt::Debug {
    fn identity(&self) -> &ParticipantIdentity;

    /// Starts a media connection to `peer`. Connection events are delivered
    /// through the session's sink, keyed by the returned connection's id.
    fn dial(
        &self,
        peer: &ParticipantIdentity,
        stream: &LocalStream,
    ) -> Result<Arc<dyn MediaConnection>, CallError>;

    /// Starts teardown. Completion is reported by a `Closed` event unless the
    /// handle was already destroyed.
    fn destroy(&self) -> Result<(), CallError>;

    fn is_destroyed(&self) -> bool;
}

/// A direct audio/video link to one remote participant.
pub trait MediaConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    fn peer(&self) -> &ParticipantIdentity;

    /// Accepts an inbound call, attaching the local stream.
    fn answer(&self, stream: &LocalStream) -> Result<(), CallError>;

    /// Closes the connection. Idempotent.
    fn close(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_url() {
        let mut config = TransportConfig {
            host: "localhost".to_string(),
            port: 9000,
            path: "/peerjs".to_string(),
            secure: false,
            ice_servers: Vec::new(),
        };
        assert_eq!(config.signaling_url(), "ws://localhost:9000/peerjs");

        config.secure = true;
        config.port = 443;
        assert_eq!(config.signaling_url(), "wss://localhost:443/peerjs");
    }

    #[test]
    fn test_error_kind_labels_are_bounded() {
        let peer = ParticipantIdentity::parse("bob").unwrap();
        assert_eq!(
            TransportErrorKind::PeerUnavailable(peer).as_str(),
            "peer-unavailable"
        );
        assert_eq!(
            TransportErrorKind::Other("socket hang up".to_string()).as_str(),
            "other"
        );
        assert_eq!(TransportErrorKind::UnavailableId.to_string(), "unavailable-id");
    }

    #[test]
    fn test_ice_server_debug_redacts_credential() {
        let turn = IceServer {
            urls: vec!["turn:relay.example.com".to_string()],
            username: Some("user".to_string()),
            credential: Some(SecretString::from("pa55")),
        };
        let debug = format!("{turn:?}");
        assert!(!debug.contains("pa55"));
        assert!(debug.contains("relay.example.com"));
    }
}
