//! Call session error types.
//!
//! Only local media acquisition and an unrecoverable identity collision end a
//! session. Everything else is converted into view state (`reconnecting`,
//! "signaling degraded") by the session actor and logged server-side.

use thiserror::Error;

/// Call session error type.
///
/// Collaborator implementations convert their own failures into one of these
/// variants at the trait boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The camera/microphone stream could not be acquired.
    #[error("Local media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// The deterministic and the unique identity were both already registered.
    #[error("Identity already registered: {0}")]
    IdentityCollision(String),

    /// Transport library failure (allocation, dial, teardown).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Presence channel operation failed.
    #[error("Presence error: {0}")]
    Presence(String),

    /// Signaling relay operation failed.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Outbound dial or inbound answer failed for one peer.
    #[error("Dial error: {0}")]
    Dial(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session actor has already shut down.
    #[error("Call session closed")]
    SessionClosed,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::MediaAcquisition(_) | CallError::IdentityCollision(_)
        )
    }

    /// Returns a user-safe message for the call view (no internal details).
    pub fn user_notice(&self) -> String {
        match self {
            CallError::MediaAcquisition(_) => {
                "Could not access your camera or microphone".to_string()
            }
            CallError::IdentityCollision(_) => {
                "Could not join the call: you are already connected from another window"
                    .to_string()
            }
            CallError::Transport(_) | CallError::Signaling(_) => {
                "Lost connection to signaling server. Reconnecting...".to_string()
            }
            CallError::Dial(_) => "Could not connect to a participant".to_string(),
            CallError::SessionClosed => "You have left the call".to_string(),
            CallError::Presence(_) | CallError::Config(_) | CallError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
