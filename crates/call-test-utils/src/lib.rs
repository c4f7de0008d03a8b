//! # Call Session Test Utilities
//!
//! Mock collaborators and fixtures for driving a call session in tests
//! without a signaling server, a presence store or capture devices.
//!
//! ## Modules
//!
//! - `mock_transport` - scriptable transport library: open, disconnect, error
//!   and teardown on demand; records dials and destroys
//! - `mock_presence` - presence store that records calls and pushes snapshots
//! - `mock_signaling` - signaling relay that records announcements
//! - `mock_media` - capture devices that succeed or fail
//! - `fixtures` - identities, records, settings and the [`TestRig`] bundle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let rig = TestRig::new();
//!     let (session, _task) = rig.start("alice").await;
//!
//!     rig.presence.push_snapshot(&["alice", "bob"]);
//!     let view = settle(&session).await;
//!
//!     assert_eq!(rig.transport.latest().dials_to("bob"), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod mock_presence;
pub mod mock_signaling;
pub mod mock_transport;

pub use fixtures::*;
pub use mock_media::*;
pub use mock_presence::*;
pub use mock_signaling::*;
pub use mock_transport::*;
