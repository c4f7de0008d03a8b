//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. `SecretString` implements `Debug`
//! with redaction, so deriving `Debug` on a struct holding one (for example
//! an ICE server entry with a TURN credential) never prints the value.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnServer {
//!     url: String,
//!     credential: SecretString,
//! }
//!
//! let turn = TurnServer {
//!     url: "turn:relay.example.com:3478".to_string(),
//!     credential: SecretString::from("relay-pass"),
//! };
//!
//! assert!(!format!("{turn:?}").contains("relay-pass"));
//! assert_eq!(turn.credential.expose_secret(), "relay-pass");
//! ```
//!
//! Use `SecretString` for relay credentials, API keys and bearer tokens.
//! Secrets are zeroized when dropped.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
