//! Observability for the call session coordinator.
//!
//! Logging goes through `tracing` with per-component targets
//! (`call.session`, `call.transport`, `call.registry`, `call.presence`,
//! `call.local`). Identities and meeting ids are logged as fields, never
//! interpolated into messages.
//!
//! # Metrics
//!
//! Recorded through the `metrics` facade; the harness binary installs a
//! Prometheus recorder when a bind address is configured. Without a recorder
//! every call is a no-op.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `call_transport_allocations_total` | Counter | none | Transport handles created |
//! | `call_reconnects_scheduled_total` | Counter | none | Backoff timers armed |
//! | `call_identity_collisions_total` | Counter | none | Identity rejected by the signaling service |
//! | `call_dials_total` | Counter | `direction` | Peer connections dialed or answered |
//! | `call_peer_connection_events_total` | Counter | `event` | Connection lifecycle events |
//! | `call_collaborator_failures_total` | Counter | `operation` | Best-effort collaborator calls that failed |
//! | `call_remote_peers` | Gauge | none | Remote peers tracked by the registry |
//! | `call_leave_duration_seconds` | Histogram | none | Time spent in the leave routine |

pub mod metrics;

pub use metrics::init_metrics_recorder;
