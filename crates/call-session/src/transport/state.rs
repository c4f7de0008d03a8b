//! Transport session state machine.
//!
//! Pure transition functions: every input that depends on time takes `now`,
//! and the outputs are [`TransportAction`]s for the manager and the session
//! actor to carry out. No I/O happens here.
//!
//! ```text
//! (start) -> Connecting -> Open -> Disconnected -> Reconnecting -> Connecting
//!               |  ^                                   |
//!               +--+ unavailable-id (once)             +--> Closed (leave)
//! ```
//!
//! `Closed` is terminal and reachable from every other phase via [`leave`],
//! or from `Connecting` on a second identity collision.
//!
//! [`leave`]: TransportStateMachine::leave

use crate::backoff::Backoff;
use crate::errors::CallError;
use crate::identity::{self, ParticipantIdentity};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportPhase {
    Connecting,
    Open,
    Disconnected,
    Reconnecting,
    Closed,
}

impl TransportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportPhase::Connecting => "connecting",
            TransportPhase::Open => "open",
            TransportPhase::Disconnected => "disconnected",
            TransportPhase::Reconnecting => "reconnecting",
            TransportPhase::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Allocate a transport handle for `identity`, tagged `generation`.
    Allocate {
        identity: ParticipantIdentity,
        generation: u64,
    },
    /// A single-shot reconnect timer is now pending.
    ScheduleReconnect {
        at: Instant,
        delay: Duration,
        attempt: u32,
    },
    /// Show or clear the "signaling degraded" notice.
    SetDegraded(bool),
    /// Announce the transport identity over the signaling relay.
    Announce(ParticipantIdentity),
    /// The local identity switched to a unique variant.
    IdentityChanged(ParticipantIdentity),
    /// Run peer reconciliation.
    Reconcile,
    /// Mark the peer's connection as dropped.
    PeerUnreachable(ParticipantIdentity),
    /// The session cannot continue.
    Fatal(CallError),
}

#[derive(Debug)]
pub struct TransportStateMachine {
    account_key: String,
    identity: ParticipantIdentity,
    phase: TransportPhase,
    generation: u64,
    attempt: u32,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    tried_unique: bool,
    announced: Option<ParticipantIdentity>,
}

impl TransportStateMachine {
    /// New machine in `Connecting` with the deterministic identity. Nothing is
    /// allocated until [`begin`](Self::begin).
    pub fn new(account_key: impl Into<String>, backoff: Backoff) -> Self {
        let account_key = account_key.into();
        let identity = identity::resolve(&account_key);
        Self {
            account_key,
            identity,
            phase: TransportPhase::Connecting,
            generation: 0,
            attempt: 0,
            backoff,
            reconnect_at: None,
            tried_unique: false,
            announced: None,
        }
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    /// Generation of the most recent allocation (0 before [`begin`](Self::begin)).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive reconnects since the last `Open`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next reconnect would wait.
    pub fn current_backoff(&self) -> Duration {
        self.backoff.delay_for_attempt(self.attempt)
    }

    /// Deadline of the pending reconnect timer, if any.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn is_closed(&self) -> bool {
        self.phase == TransportPhase::Closed
    }

    /// `(start) -> Connecting`: first allocation.
    pub fn begin(&mut self) -> Vec<TransportAction> {
        if self.generation != 0 || self.is_closed() {
            return Vec::new();
        }
        vec![self.allocate()]
    }

    /// Registration succeeded.
    pub fn on_opened(&mut self) -> Vec<TransportAction> {
        if self.is_closed() {
            return Vec::new();
        }
        self.phase = TransportPhase::Open;
        self.attempt = 0;
        self.reconnect_at = None;

        let mut actions = vec![TransportAction::SetDegraded(false)];
        if self.announced.as_ref() != Some(&self.identity) {
            self.announced = Some(self.identity.clone());
            actions.push(TransportAction::Announce(self.identity.clone()));
        }
        actions.push(TransportAction::Reconcile);
        actions
    }

    /// Signaling connectivity lost (disconnect, network error, unexpected
    /// close). Schedules a reconnect unless one is already pending.
    pub fn on_signaling_lost(&mut self, now: Instant) -> Vec<TransportAction> {
        if self.is_closed() {
            return Vec::new();
        }
        self.phase = TransportPhase::Disconnected;
        let mut actions = vec![TransportAction::SetDegraded(true)];

        if self.reconnect_at.is_none() {
            let delay = self.current_backoff();
            let at = self.backoff.deadline(now, self.attempt);
            self.reconnect_at = Some(at);
            actions.push(TransportAction::ScheduleReconnect {
                at,
                delay,
                attempt: self.attempt,
            });
        }

        self.phase = TransportPhase::Reconnecting;
        actions
    }

    /// The reconnect timer fired. Ignored unless it is the pending timer and
    /// its deadline has passed.
    pub fn on_reconnect_timer(&mut self, now: Instant) -> Vec<TransportAction> {
        if self.phase != TransportPhase::Reconnecting {
            return Vec::new();
        }
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                self.attempt = self.attempt.saturating_add(1);
                self.phase = TransportPhase::Connecting;
                vec![self.allocate()]
            }
            _ => Vec::new(),
        }
    }

    /// The candidate identity is registered by another live session.
    ///
    /// First time while `Connecting`: retry with a unique identity. Second
    /// time: terminal. Outside `Connecting` it is treated as signaling loss.
    pub fn on_unavailable_id(&mut self, now: Instant) -> Vec<TransportAction> {
        if self.is_closed() {
            return Vec::new();
        }
        if self.phase != TransportPhase::Connecting {
            return self.on_signaling_lost(now);
        }
        if !self.tried_unique {
            self.tried_unique = true;
            self.identity = identity::resolve_unique(&self.account_key);
            return vec![
                TransportAction::IdentityChanged(self.identity.clone()),
                self.allocate(),
            ];
        }

        let identity = self.identity.to_string();
        self.close();
        vec![TransportAction::Fatal(CallError::IdentityCollision(identity))]
    }

    /// Deliberate leave. Returns false if already `Closed`.
    pub fn leave(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.close();
        true
    }

    fn close(&mut self) {
        self.phase = TransportPhase::Closed;
        self.reconnect_at = None;
    }

    fn allocate(&mut self) -> TransportAction {
        self.generation += 1;
        TransportAction::Allocate {
            identity: self.identity.clone(),
            generation: self.generation,
        }
    }
}
