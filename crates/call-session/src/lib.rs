//! Live call session coordinator.
//!
//! For one meeting this library discovers which participants are present,
//! keeps a direct media connection to each of them, recovers from signaling
//! and transport disconnects, and keeps the per-peer view state (stream,
//! camera/audio flags, reconnecting flag) consistent with the network.
//!
//! # Architecture
//!
//! One actor per call participation, fed by a single event channel:
//!
//! ```text
//! CallSession (actor)
//! ├── TransportManager      one transport handle, reconnect state machine, backoff
//! ├── PeerRegistry          one connection + view state per remote identity
//! ├── PresenceGlue          publish / heartbeat refresh / remove of the local record
//! └── LocalStream           shared by every dial and answer
//! ```
//!
//! Presence, signaling, the transport library and capture devices are
//! collaborators behind traits ([`presence::PresenceChannel`],
//! [`signaling::SignalingRelay`], [`transport::TransportFactory`],
//! [`media::MediaDevices`]). [`local::LocalHub`] implements all of them in
//! process.
//!
//! # Modules
//!
//! - [`session`] - the actor and the handle the call view holds
//! - [`transport`] - state machine, allocation serialization, collaborator traits
//! - [`registry`] - presence reconciliation and connection events
//! - [`identity`] - deterministic and unique participant identities
//! - [`config`] - configuration from environment

pub mod backoff;
pub mod config;
pub mod errors;
pub mod events;
pub mod identity;
pub mod local;
pub mod media;
pub mod observability;
pub mod presence;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod view;

pub use errors::CallError;
pub use identity::ParticipantIdentity;
pub use session::{CallSession, CallSessionHandle, Collaborators, SessionArgs, SessionSettings};
pub use view::{CallView, CleanupReport};
