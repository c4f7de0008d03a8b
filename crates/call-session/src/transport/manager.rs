//! Transport session manager.
//!
//! Owns the live transport handle and the state machine, and executes the
//! machine's `Allocate` actions. Allocation is the one serialization point of
//! a session: a new handle is only created once the previous one has reported
//! `Closed`, so two live handles never share an identity. A request arriving
//! while a teardown is outstanding is queued; a newer request replaces an
//! older queued one.

use super::state::{TransportAction, TransportStateMachine};
use super::{TransportConfig, TransportFactory, TransportHandle};
use crate::errors::CallError;
use crate::events::{SessionEvent, TransportEvent, TransportEventSink};
use crate::identity::ParticipantIdentity;
use crate::observability::metrics;
use crate::transport::{TransportErrorKind, TransportPhase};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct ActiveHandle {
    generation: u64,
    handle: Arc<dyn TransportHandle>,
}

pub struct TransportManager {
    factory: Arc<dyn TransportFactory>,
    config: TransportConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    machine: TransportStateMachine,
    current: Option<ActiveHandle>,
    /// Generation whose `Closed` event is awaited before allocating again.
    teardown: Option<u64>,
    queued: Option<(ParticipantIdentity, u64)>,
}

impl TransportManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        config: TransportConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
        machine: TransportStateMachine,
    ) -> Self {
        Self {
            factory,
            config,
            events,
            machine,
            current: None,
            teardown: None,
            queued: None,
        }
    }

    pub fn machine(&self) -> &TransportStateMachine {
        &self.machine
    }

    pub fn phase(&self) -> TransportPhase {
        self.machine.phase()
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        self.machine.identity()
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.machine.reconnect_deadline()
    }

    /// Whether events tagged `generation` come from the newest allocation.
    pub fn is_current(&self, generation: u64) -> bool {
        !self.machine.is_closed() && generation == self.machine.generation()
    }

    /// Handle usable for dialing: only while `Open`.
    pub fn dialer(&self) -> Option<Arc<dyn TransportHandle>> {
        if self.machine.phase() != TransportPhase::Open {
            return None;
        }
        self.current
            .as_ref()
            .filter(|active| active.generation == self.machine.generation())
            .map(|active| Arc::clone(&active.handle))
    }

    /// Whether an allocation is waiting for a teardown to complete.
    pub fn allocation_pending(&self) -> bool {
        self.queued.is_some()
    }

    /// First allocation.
    pub fn begin(&mut self, now: Instant) -> Vec<TransportAction> {
        let actions = self.machine.begin();
        self.execute(actions, now)
    }

    /// Applies a transport event. `IncomingCall` is not handled here.
    pub fn handle_event(
        &mut self,
        generation: u64,
        event: TransportEvent,
        now: Instant,
    ) -> Vec<TransportAction> {
        if self.machine.is_closed() {
            debug!(target: "call.transport", generation, ?event, "Ignoring event after close");
            return Vec::new();
        }

        if matches!(event, TransportEvent::Closed) {
            if let Some(actions) = self.complete_teardown(generation, now) {
                return actions;
            }
        }

        if !self.is_current(generation) {
            debug!(
                target: "call.transport",
                generation,
                current = self.machine.generation(),
                "Ignoring event from replaced transport handle"
            );
            return Vec::new();
        }

        let actions = match event {
            TransportEvent::Opened => {
                info!(target: "call.transport", identity = %self.machine.identity(), generation, "Transport open");
                self.machine.on_opened()
            }
            TransportEvent::Disconnected => {
                warn!(target: "call.transport", generation, "Signaling connection lost");
                self.machine.on_signaling_lost(now)
            }
            TransportEvent::Closed => {
                warn!(target: "call.transport", generation, "Transport closed unexpectedly");
                self.current = None;
                self.machine.on_signaling_lost(now)
            }
            TransportEvent::Error(TransportErrorKind::UnavailableId) => {
                warn!(target: "call.transport", identity = %self.machine.identity(), "Identity already registered");
                metrics::record_identity_collision();
                self.machine.on_unavailable_id(now)
            }
            TransportEvent::Error(TransportErrorKind::PeerUnavailable(peer)) => {
                debug!(target: "call.transport", peer = %peer, "Dialed peer is not registered");
                vec![TransportAction::PeerUnreachable(peer)]
            }
            TransportEvent::Error(kind) => {
                warn!(target: "call.transport", error = %kind, generation, "Transport error");
                self.machine.on_signaling_lost(now)
            }
            TransportEvent::IncomingCall(connection) => {
                debug!(target: "call.transport", peer = %connection.peer(), "Incoming call routed past manager");
                Vec::new()
            }
        };
        self.execute(actions, now)
    }

    /// Reconnect timer fired.
    pub fn on_reconnect_timer(&mut self, now: Instant) -> Vec<TransportAction> {
        let actions = self.machine.on_reconnect_timer(now);
        self.execute(actions, now)
    }

    /// Deliberate leave: close the machine, drop any queued allocation and
    /// destroy the live handle. Also used after a fatal collision, when the
    /// machine is already closed but the last handle is still alive.
    ///
    /// Returns the handle's destroy error, if any.
    pub fn leave(&mut self) -> Result<(), CallError> {
        if self.machine.reconnect_deadline().is_some() {
            debug!(target: "call.transport", "Pending reconnect cancelled");
        }
        self.machine.leave();
        self.queued = None;
        self.teardown = None;
        match self.current.take() {
            Some(active) if !active.handle.is_destroyed() => active.handle.destroy(),
            _ => Ok(()),
        }
    }

    /// Carries out `Allocate` actions and returns the rest for the session.
    fn execute(&mut self, actions: Vec<TransportAction>, now: Instant) -> Vec<TransportAction> {
        let mut pending: VecDeque<TransportAction> = actions.into();
        let mut out = Vec::new();

        while let Some(action) = pending.pop_front() {
            match action {
                TransportAction::Allocate {
                    identity,
                    generation,
                } => {
                    if let Err(e) = self.request_allocation(identity, generation) {
                        warn!(target: "call.transport", error = %e, generation, "Transport allocation failed");
                        pending.extend(self.machine.on_signaling_lost(now));
                    }
                }
                TransportAction::ScheduleReconnect {
                    delay, attempt, ..
                } => {
                    info!(
                        target: "call.transport",
                        delay_ms = delay.as_millis() as u64,
                        attempt,
                        "Reconnect scheduled"
                    );
                    metrics::record_reconnect_scheduled();
                    out.push(action);
                }
                other => out.push(other),
            }
        }
        out
    }

    fn request_allocation(
        &mut self,
        identity: ParticipantIdentity,
        generation: u64,
    ) -> Result<(), CallError> {
        if self.teardown.is_some() {
            debug!(target: "call.transport", generation, "Allocation queued behind teardown");
            self.queued = Some((identity, generation));
            return Ok(());
        }

        if let Some(active) = self.current.take() {
            if !active.handle.is_destroyed() {
                match active.handle.destroy() {
                    Ok(()) => {
                        debug!(
                            target: "call.transport",
                            previous = active.generation,
                            generation,
                            "Waiting for previous transport handle to close"
                        );
                        self.teardown = Some(active.generation);
                        self.queued = Some((identity, generation));
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(target: "call.transport", error = %e, "Destroying previous transport handle failed");
                    }
                }
            }
        }

        self.create(identity, generation)
    }

    /// Starts the queued allocation once the awaited teardown completes.
    /// Returns `None` if `generation` was not the teardown being awaited.
    fn complete_teardown(&mut self, generation: u64, now: Instant) -> Option<Vec<TransportAction>> {
        if self.teardown != Some(generation) {
            return None;
        }
        self.teardown = None;
        debug!(target: "call.transport", generation, "Previous transport handle closed");

        let Some((identity, queued_generation)) = self.queued.take() else {
            return Some(Vec::new());
        };
        if queued_generation != self.machine.generation() {
            return Some(Vec::new());
        }
        match self.create(identity, queued_generation) {
            Ok(()) => Some(Vec::new()),
            Err(e) => {
                warn!(target: "call.transport", error = %e, generation = queued_generation, "Transport allocation failed");
                let actions = self.machine.on_signaling_lost(now);
                Some(self.execute(actions, now))
            }
        }
    }

    fn create(&mut self, identity: ParticipantIdentity, generation: u64) -> Result<(), CallError> {
        let sink = TransportEventSink::new(generation, self.events.clone());
        let handle = self.factory.create_session(&identity, &self.config, sink)?;
        metrics::record_transport_allocation();
        info!(
            target: "call.transport",
            identity = %identity,
            generation,
            server = %self.config.signaling_url(),
            "Transport allocated"
        );
        self.current = Some(ActiveHandle { generation, handle });
        Ok(())
    }
}
