//! Transfer coordinator: the ownership-migration state machine
//!
//! Every ownership change of a session flows through [`TransferCoordinator::apply`].
//! A transition validates the target, updates the registry (which records the
//! transfer history entry), adjusts operator availability through the broker,
//! and notifies both transport sides exactly once. The dispatcher serializes
//! each session's processing, so a transition commits as a single logical
//! unit from its point of view: no message reaches the old owner after a
//! request is accepted, none reaches the new owner before.
//!
//! "No human agents available" is a first-class rejected outcome here, not an
//! error and not a magic reply string.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::ConnectionBroker;
use crate::error::{HelplineError, Result};
use crate::items::{
    Message, OperatorId, OutboundEvent, Owner, ResponderKind, Role, SessionId, SessionStatus,
};
use crate::registry::SessionRegistry;
use crate::transfer::{TransferRequest, TransferTarget};

/// Customer notice when an escalation finds no free operator.
pub const NO_OPERATOR_NOTICE: &str = "I understand you'd like to speak with a human representative. Unfortunately, \
     no human agents are currently available. I'm here to help you with your \
     request - please let me know what you need and I'll do my best to resolve it.";

/// Customer notice while an operator is being attached.
pub const CONNECTING_NOTICE: &str =
    "I'm connecting you to a human support representative. They will assist you shortly.";

/// Customer notice when the owning operator's connection is lost.
pub const OPERATOR_LOST_NOTICE: &str = "Your support agent was disconnected. Please hold while we find another agent, \
     or continue with our AI assistant in the meantime.";

/// Result of applying a transfer request.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    /// Ownership moved; the session now belongs to `to`.
    Applied { to: Owner },
    /// The transfer was rejected (no operator free). The session stays with
    /// its current owner; `notice` was delivered to the customer.
    Rejected { notice: String },
}

/// Applies ownership transitions against the registry and broker.
pub struct TransferCoordinator {
    registry: Arc<SessionRegistry>,
    broker: Arc<ConnectionBroker>,
    /// How much recent history an assigned operator is shown.
    escalation_window: usize,
}

impl TransferCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, broker: Arc<ConnectionBroker>) -> Self {
        Self {
            registry,
            broker,
            escalation_window: 10,
        }
    }

    pub fn with_escalation_window(mut self, window: usize) -> Self {
        self.escalation_window = window;
        self
    }

    /// Validate and apply one transfer request from the session's current
    /// owner. Same-owner requests fail with `InvalidTransition` (a second,
    /// concurrent request observes the already-updated owner and is never
    /// double-applied).
    pub fn apply(
        &self,
        session_id: &SessionId,
        request: TransferRequest,
    ) -> Result<TransferOutcome> {
        let from = self.registry.owner(session_id)?;
        match request.target {
            TransferTarget::Human => self.apply_escalation(session_id, from, request),
            TransferTarget::Responder(kind) => {
                self.apply_ai_transfer(session_id, from, kind, request.reason)
            }
        }
    }

    /// Operator disconnect while owning a session: the session reverts to
    /// `WaitingForHuman` with no owner, the customer is told, and a later
    /// escalation may assign a different operator. The broker entry is
    /// assumed already removed.
    pub fn handle_operator_disconnect(
        &self,
        operator: &OperatorId,
        session_id: &SessionId,
    ) -> Result<()> {
        info!(operator = %operator, session = %session_id, "Owning operator disconnected");
        self.registry.update_owner(
            session_id,
            Owner::Unassigned,
            Some(format!("operator {operator} disconnected")),
        )?;
        self.registry
            .set_status(session_id, SessionStatus::WaitingForHuman)?;
        self.notify_customer(
            session_id,
            OutboundEvent::TransferNotice {
                session_id: session_id.clone(),
                to: "Support".to_string(),
                notice: OPERATOR_LOST_NOTICE.to_string(),
            },
        );
        Ok(())
    }

    /// Fallback when routing to an owning operator fails (`NotConnected`
    /// discovered outside a disconnect event): drop the stale connection,
    /// park the session, and re-attempt human assignment right away.
    pub fn recover_lost_operator(
        &self,
        operator: &OperatorId,
        session_id: &SessionId,
        snapshot: Vec<Message>,
    ) -> Result<TransferOutcome> {
        warn!(operator = %operator, session = %session_id, "Operator transport stale, recovering");
        self.broker.unregister_operator(operator);
        self.handle_operator_disconnect(operator, session_id)?;
        let request = TransferRequest::new(
            TransferTarget::Human,
            Some("previous operator connection lost".to_string()),
            snapshot,
        );
        self.apply(session_id, request)
    }

    fn apply_escalation(
        &self,
        session_id: &SessionId,
        from: Owner,
        request: TransferRequest,
    ) -> Result<TransferOutcome> {
        if from.is_operator() {
            return Err(HelplineError::invalid_transition(format!(
                "session {session_id} is already assigned to a human operator"
            )));
        }

        // Reserve and verify the transport; a reserved operator whose
        // transport died between connect and now is dropped and the next one
        // tried, until the pool is exhausted.
        loop {
            let Some(operator) = self.broker.reserve_operator(session_id) else {
                info!(session = %session_id, "Escalation rejected: no operator available");
                self.notify_customer(
                    session_id,
                    OutboundEvent::NoOperatorAvailable {
                        session_id: session_id.clone(),
                        notice: NO_OPERATOR_NOTICE.to_string(),
                    },
                );
                return Ok(TransferOutcome::Rejected {
                    notice: NO_OPERATOR_NOTICE.to_string(),
                });
            };

            let transport = match self.broker.route_operator(&operator) {
                Ok(transport) => transport,
                Err(_) => {
                    warn!(operator = %operator, "Reserved operator has a dead transport, skipping");
                    self.broker.unregister_operator(&operator);
                    continue;
                }
            };

            if let Err(e) = self.registry.update_owner(
                session_id,
                Owner::Operator(operator.clone()),
                request.reason.clone(),
            ) {
                // Roll the reservation back; the session was closed or the
                // owner changed under us.
                let _ = self.broker.mark_available(&operator);
                return Err(e);
            }

            info!(
                session = %session_id,
                from = %from,
                operator = %operator,
                "Escalation assigned"
            );

            let history = self.trimmed_history(session_id, &request.snapshot);
            let latest = latest_customer_text(&request.snapshot)
                .unwrap_or_else(|| "Customer needs assistance".to_string());
            if transport
                .send(OutboundEvent::EscalationAssigned {
                    session_id: session_id.clone(),
                    reason: request.reason.clone(),
                    history,
                    latest,
                })
                .is_err()
            {
                warn!(operator = %operator, "Operator transport closed during assignment");
            }

            self.notify_customer(
                session_id,
                OutboundEvent::TransferNotice {
                    session_id: session_id.clone(),
                    to: "Human Support".to_string(),
                    notice: CONNECTING_NOTICE.to_string(),
                },
            );

            return Ok(TransferOutcome::Applied {
                to: Owner::Operator(operator),
            });
        }
    }

    fn apply_ai_transfer(
        &self,
        session_id: &SessionId,
        from: Owner,
        kind: ResponderKind,
        reason: Option<String>,
    ) -> Result<TransferOutcome> {
        self.registry
            .update_owner(session_id, Owner::Responder(kind), reason)?;

        // A releasing operator goes straight back to the idle pool; they do
        // not stay attached to the session for monitoring.
        if let Owner::Operator(operator) = &from {
            if self.broker.mark_available(operator).is_err() {
                debug!(operator = %operator, "Releasing operator already disconnected");
            }
            if let Ok(transport) = self.broker.route_operator(operator) {
                let _ = transport.send(OutboundEvent::TransferConfirmation {
                    session_id: session_id.clone(),
                    target: kind.label().to_string(),
                    accepted: true,
                });
            }
        }

        info!(session = %session_id, from = %from, to = %kind, "Transfer applied");

        self.notify_customer(
            session_id,
            OutboundEvent::TransferNotice {
                session_id: session_id.clone(),
                to: kind.label().to_string(),
                notice: format!(
                    "I'm transferring you to our {} team. They will continue assisting you.",
                    kind.label()
                ),
            },
        );

        Ok(TransferOutcome::Applied {
            to: Owner::Responder(kind),
        })
    }

    fn trimmed_history(&self, session_id: &SessionId, snapshot: &[Message]) -> Vec<Message> {
        if snapshot.is_empty() {
            self.registry
                .context_window(session_id, self.escalation_window)
                .unwrap_or_default()
        } else {
            let skip = snapshot.len().saturating_sub(self.escalation_window);
            snapshot[skip..].to_vec()
        }
    }

    /// Best-effort customer notification; a disconnected customer transport
    /// never aborts a transition.
    fn notify_customer(&self, session_id: &SessionId, event: OutboundEvent) {
        match self.broker.route_customer(session_id) {
            Ok(transport) => {
                if transport.send(event).is_err() {
                    debug!(session = %session_id, "Customer transport closed, notice dropped");
                }
            }
            Err(_) => {
                debug!(session = %session_id, "Customer not connected, notice dropped");
            }
        }
    }
}

fn latest_customer_text(snapshot: &[Message]) -> Option<String> {
    snapshot
        .iter()
        .rev()
        .find(|m| m.role == Role::Customer)
        .map(|m| m.content.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Availability;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        broker: Arc<ConnectionBroker>,
        coordinator: TransferCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let broker = Arc::new(ConnectionBroker::new());
            let coordinator = TransferCoordinator::new(registry.clone(), broker.clone());
            Self {
                registry,
                broker,
                coordinator,
            }
        }

        fn customer(&self, id: &SessionId) -> UnboundedReceiver<OutboundEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.broker.register_customer(id, tx).unwrap();
            self.registry.get_or_create(id);
            rx
        }

        fn operator(&self, id: &OperatorId) -> UnboundedReceiver<OutboundEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.broker.register_operator(id, tx).unwrap();
            rx
        }
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn human_request(snapshot: Vec<Message>) -> TransferRequest {
        TransferRequest::new(TransferTarget::Human, Some("escalate".to_string()), snapshot)
    }

    #[test]
    fn ai_transfer_round_trip_restores_owner() {
        let f = Fixture::new();
        let id = SessionId::from("s-1");
        let _rx = f.customer(&id);

        let out = f
            .coordinator
            .apply(
                &id,
                TransferRequest::new(
                    TransferTarget::Responder(ResponderKind::Technical),
                    None,
                    vec![],
                ),
            )
            .unwrap();
        assert!(matches!(
            out,
            TransferOutcome::Applied {
                to: Owner::Responder(ResponderKind::Technical)
            }
        ));

        f.coordinator
            .apply(
                &id,
                TransferRequest::new(
                    TransferTarget::Responder(ResponderKind::Triage),
                    None,
                    vec![],
                ),
            )
            .unwrap();

        assert_eq!(
            f.registry.owner(&id).unwrap(),
            Owner::Responder(ResponderKind::Triage)
        );
        assert_eq!(f.registry.transfer_log(&id).unwrap().len(), 2);
    }

    #[test]
    fn noop_transfer_is_rejected_not_double_applied() {
        let f = Fixture::new();
        let id = SessionId::from("s-2");
        f.registry.get_or_create(&id);

        let err = f
            .coordinator
            .apply(
                &id,
                TransferRequest::new(
                    TransferTarget::Responder(ResponderKind::Triage),
                    None,
                    vec![],
                ),
            )
            .unwrap_err();
        assert!(matches!(err, HelplineError::InvalidTransition { .. }));
        assert!(f.registry.transfer_log(&id).unwrap().is_empty());
    }

    #[test]
    fn escalation_without_operators_is_rejected_in_place() {
        let f = Fixture::new();
        let id = SessionId::from("s-3");
        let mut customer_rx = f.customer(&id);

        let out = f
            .coordinator
            .apply(&id, human_request(vec![Message::customer("help me")]))
            .unwrap();
        assert!(matches!(out, TransferOutcome::Rejected { .. }));

        // Owner unchanged, no transfer logged, availability untouched.
        assert_eq!(
            f.registry.owner(&id).unwrap(),
            Owner::Responder(ResponderKind::Triage)
        );
        assert!(f.registry.transfer_log(&id).unwrap().is_empty());
        assert_eq!(f.broker.availability().len(), 0);

        let events = drain(&mut customer_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            OutboundEvent::NoOperatorAvailable { .. }
        ));
    }

    #[test]
    fn escalation_assigns_and_notifies_both_sides_once() {
        let f = Fixture::new();
        let id = SessionId::from("s-4");
        let op = OperatorId::from("op-1");
        let mut customer_rx = f.customer(&id);
        let mut operator_rx = f.operator(&op);

        let snapshot = vec![
            Message::customer("My bill is wrong"),
            Message::assistant("Let me check", "Billing Support"),
            Message::customer("I want a person"),
        ];
        let out = f.coordinator.apply(&id, human_request(snapshot)).unwrap();
        assert!(matches!(
            out,
            TransferOutcome::Applied {
                to: Owner::Operator(_)
            }
        ));

        assert_eq!(f.registry.owner(&id).unwrap(), Owner::Operator(op.clone()));
        assert_eq!(f.broker.operator_session(&op), Some(id.clone()));

        let operator_events = drain(&mut operator_rx);
        assert_eq!(operator_events.len(), 1);
        match &operator_events[0] {
            OutboundEvent::EscalationAssigned {
                history, latest, ..
            } => {
                assert_eq!(history.len(), 3);
                assert_eq!(latest, "I want a person");
            }
            other => panic!("expected EscalationAssigned, got {other:?}"),
        }

        let customer_events = drain(&mut customer_rx);
        assert_eq!(customer_events.len(), 1);
        assert!(matches!(
            customer_events[0],
            OutboundEvent::TransferNotice { .. }
        ));
    }

    #[test]
    fn escalation_for_human_owned_session_is_invalid() {
        let f = Fixture::new();
        let id = SessionId::from("s-5");
        let op = OperatorId::from("op-1");
        f.registry.get_or_create(&id);
        let _op_rx = f.operator(&op);

        f.coordinator.apply(&id, human_request(vec![])).unwrap();

        let err = f.coordinator.apply(&id, human_request(vec![])).unwrap_err();
        assert!(matches!(err, HelplineError::InvalidTransition { .. }));
    }

    #[test]
    fn human_to_ai_transfer_releases_operator() {
        let f = Fixture::new();
        let id = SessionId::from("s-6");
        let op = OperatorId::from("op-1");
        let _customer_rx = f.customer(&id);
        let mut operator_rx = f.operator(&op);

        f.coordinator.apply(&id, human_request(vec![])).unwrap();
        drain(&mut operator_rx);

        let out = f
            .coordinator
            .apply(
                &id,
                TransferRequest::new(
                    TransferTarget::Responder(ResponderKind::Triage),
                    Some("resolved, back to AI".to_string()),
                    vec![],
                ),
            )
            .unwrap();
        assert!(matches!(out, TransferOutcome::Applied { .. }));

        assert_eq!(
            f.broker.availability(),
            vec![(op.clone(), Availability::Available)]
        );
        let events = drain(&mut operator_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            OutboundEvent::TransferConfirmation {
                target, accepted, ..
            } => {
                assert_eq!(target, "Customer Service");
                assert!(accepted);
            }
            other => panic!("expected TransferConfirmation, got {other:?}"),
        }
    }

    #[test]
    fn operator_disconnect_parks_session() {
        let f = Fixture::new();
        let id = SessionId::from("s-7");
        let op = OperatorId::from("op-1");
        let _customer_rx = f.customer(&id);
        let _operator_rx = f.operator(&op);

        f.coordinator.apply(&id, human_request(vec![])).unwrap();

        // Transport drops, dispatcher unregisters, coordinator parks.
        let held = f.broker.unregister_operator(&op);
        assert_eq!(held, Some(id.clone()));
        f.coordinator.handle_operator_disconnect(&op, &id).unwrap();

        assert_eq!(
            f.registry.status(&id).unwrap(),
            SessionStatus::WaitingForHuman
        );
        assert_eq!(f.registry.owner(&id).unwrap(), Owner::Unassigned);
        assert!(f.broker.availability().is_empty());

        // A later escalation can pick a different operator.
        let other = OperatorId::from("op-2");
        let _other_rx = f.operator(&other);
        let out = f.coordinator.apply(&id, human_request(vec![])).unwrap();
        match out {
            TransferOutcome::Applied { to } => assert_eq!(to, Owner::Operator(other)),
            other => panic!("expected assignment, got {other:?}"),
        }
        assert_eq!(f.registry.status(&id).unwrap(), SessionStatus::Active);
    }

    #[test]
    fn stale_reserved_operator_is_skipped() {
        let f = Fixture::new();
        let id = SessionId::from("s-8");
        let dead = OperatorId::from("op-dead");
        let live = OperatorId::from("op-live");
        let _customer_rx = f.customer(&id);

        // First operator's receiving end is dropped immediately.
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        f.broker.register_operator(&dead, dead_tx).unwrap();
        drop(dead_rx);
        let _live_rx = f.operator(&live);

        let out = f.coordinator.apply(&id, human_request(vec![])).unwrap();
        match out {
            TransferOutcome::Applied { to } => assert_eq!(to, Owner::Operator(live)),
            other => panic!("expected assignment to live operator, got {other:?}"),
        }
        // The dead operator was purged from the table.
        assert_eq!(f.broker.operator_count(), 1);
    }
}
