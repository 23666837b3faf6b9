//! Dispatcher: inbound entry points and per-session serialized processing
//!
//! The dispatcher owns all routing decisions. Each session gets one worker
//! task fed by an unbounded queue: messages for a session are processed
//! strictly in arrival order, never concurrently, while independent sessions
//! proceed in parallel. A transfer commit inside a worker turn is the
//! linearization point: everything queued behind it is routed against the
//! new owner.
//!
//! Transports and the inference provider are injected; nothing here reaches
//! for ambient state.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::broker::{Availability, ConnectionBroker, Transport};
use crate::coordinator::{TransferCoordinator, TransferOutcome};
use crate::error::{HelplineError, Result};
use crate::items::{
    Message, OperatorId, OutboundEvent, Owner, ResponderKind, Role, SessionId, SessionStatus,
};
use crate::model::InferenceProvider;
use crate::registry::SessionRegistry;
use crate::responder::{ResponderPool, SessionContext};
use crate::transfer::{Outcome, TransferRequest, TransferTarget};

/// Greeting pushed to a newly connected customer.
pub const GREETING: &str = "Hello! I'm your AI support assistant. How can I help you today?";

/// Reply used when routing repeatedly fails and the session stays put.
const ROUTING_FALLBACK_REPLY: &str =
    "Sorry - I ran into a problem routing your conversation. Let's continue here: how can I help?";

/// Tunables for the core. Plain defaults with builder-style overrides; the
/// embedding application owns any env/file loading.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Recent-history window handed to responders and assigned operators.
    pub context_window: usize,
    /// Upper bound on infer→tools→infer rounds per message.
    pub max_tool_turns: usize,
    /// Upper bound on AI→AI transfer hops triggered by one inbound message.
    pub max_transfer_hops: usize,
    /// Minimum intent score before triage routes without a clarifying
    /// question.
    pub clarify_threshold: f32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            context_window: 10,
            max_tool_turns: 4,
            max_transfer_hops: 10,
            clarify_threshold: 1.0,
        }
    }
}

impl CoreConfig {
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    pub fn with_max_tool_turns(mut self, turns: usize) -> Self {
        self.max_tool_turns = turns;
        self
    }

    pub fn with_max_transfer_hops(mut self, hops: usize) -> Self {
        self.max_transfer_hops = hops;
        self
    }

    pub fn with_clarify_threshold(mut self, threshold: f32) -> Self {
        self.clarify_threshold = threshold;
        self
    }
}

/// One row of the monitoring snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorStatus {
    pub id: OperatorId,
    pub availability: Availability,
}

/// Monitoring snapshot returned by [`Dispatcher::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_sessions: usize,
    pub waiting_sessions: usize,
    pub available_operators: usize,
    pub operators: Vec<OperatorStatus>,
}

/// Unit of work queued to a session's worker.
enum SessionJob {
    CustomerMessage {
        body: String,
    },
    OperatorMessage {
        operator: OperatorId,
        body: String,
    },
    Escalation {
        reason: Option<String>,
    },
    AiTransfer {
        operator: OperatorId,
        target: ResponderKind,
        note: Option<String>,
    },
    OperatorLost {
        operator: OperatorId,
    },
    Close,
}

struct Inner {
    registry: Arc<SessionRegistry>,
    broker: Arc<ConnectionBroker>,
    pool: ResponderPool,
    coordinator: TransferCoordinator,
    config: CoreConfig,
    workers: Mutex<HashMap<SessionId, mpsc::UnboundedSender<SessionJob>>>,
}

/// The core's front door. Cheap to clone; all state lives behind `Arc`s.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn InferenceProvider>) -> Self {
        Self::with_config(provider, CoreConfig::default())
    }

    pub fn with_config(provider: Arc<dyn InferenceProvider>, config: CoreConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let broker = Arc::new(ConnectionBroker::new());
        let pool = ResponderPool::standard(
            provider,
            broker.clone(),
            config.max_tool_turns,
            config.clarify_threshold,
        );
        let coordinator = TransferCoordinator::new(registry.clone(), broker.clone())
            .with_escalation_window(config.context_window);
        Self {
            inner: Arc::new(Inner {
                registry,
                broker,
                pool,
                coordinator,
                config,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The session registry (read access for embedders and tests).
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// The connection broker (read access for embedders and tests).
    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.inner.broker
    }

    /// Attach a customer transport and create the session. Sends the
    /// greeting on success.
    pub fn customer_connect(&self, session_id: &SessionId, transport: Transport) -> Result<()> {
        self.inner.broker.register_customer(session_id, transport)?;
        self.inner.registry.get_or_create(session_id);
        self.ensure_worker(session_id);
        if let Ok(transport) = self.inner.broker.route_customer(session_id) {
            let _ = transport.send(OutboundEvent::Greeting {
                session_id: session_id.clone(),
                body: GREETING.to_string(),
            });
        }
        info!(session = %session_id, "Customer connected");
        Ok(())
    }

    /// Customer transport dropped: the session closes and any owning
    /// operator is released. No remote cancellation signal is needed.
    pub fn customer_disconnect(&self, session_id: &SessionId) {
        if !self.enqueue(session_id, SessionJob::Close) {
            // No worker (customer never fully attached); clean up directly.
            self.inner.broker.unregister_customer(session_id);
            if self.inner.registry.contains(session_id) {
                let _ = self.inner.registry.close(session_id);
            }
        }
    }

    /// Inbound customer message. Creates the session on first use; replies
    /// and notices flow back asynchronously over the transport.
    pub fn submit_customer_message(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<()> {
        let session = self.inner.registry.get_or_create(session_id);
        if session.status == SessionStatus::Closed {
            return Err(HelplineError::SessionClosed(session_id.clone()));
        }
        self.ensure_worker(session_id);
        self.enqueue(
            session_id,
            SessionJob::CustomerMessage { body: text.into() },
        );
        Ok(())
    }

    /// Inbound operator message for the session the operator currently
    /// serves.
    pub fn submit_operator_message(
        &self,
        operator_id: &OperatorId,
        text: impl Into<String>,
    ) -> Result<()> {
        // Surface a stale transport before accepting the message.
        self.inner.broker.route_operator(operator_id)?;
        let session_id = self
            .inner
            .broker
            .operator_session(operator_id)
            .ok_or_else(|| {
                HelplineError::invalid_transition(format!(
                    "operator {operator_id} has no assigned session"
                ))
            })?;
        self.ensure_worker(&session_id);
        self.enqueue(
            &session_id,
            SessionJob::OperatorMessage {
                operator: operator_id.clone(),
                body: text.into(),
            },
        );
        Ok(())
    }

    /// Attach an operator transport; the operator joins the idle pool.
    pub fn operator_connect(&self, operator_id: &OperatorId, transport: Transport) -> Result<()> {
        self.inner.broker.register_operator(operator_id, transport)?;
        if let Ok(transport) = self.inner.broker.route_operator(operator_id) {
            let _ = transport.send(OutboundEvent::ConnectionConfirmed {
                operator_id: operator_id.clone(),
            });
        }
        info!(operator = %operator_id, "Operator connected");
        Ok(())
    }

    /// Operator transport dropped: remove from the availability table and
    /// park any owned session as waiting.
    pub fn operator_disconnect(&self, operator_id: &OperatorId) {
        let held = self.inner.broker.unregister_operator(operator_id);
        if let Some(session_id) = held {
            let queued = self.enqueue(
                &session_id,
                SessionJob::OperatorLost {
                    operator: operator_id.clone(),
                },
            );
            if !queued {
                if let Err(e) = self
                    .inner
                    .coordinator
                    .handle_operator_disconnect(operator_id, &session_id)
                {
                    warn!(operator = %operator_id, session = %session_id, error = %e,
                        "Failed to park session after operator disconnect");
                }
            }
        }
    }

    /// Ask for a human operator on behalf of a session.
    pub fn request_human_escalation(
        &self,
        session_id: &SessionId,
        reason: Option<String>,
    ) -> Result<()> {
        if !self.inner.registry.contains(session_id) {
            return Err(HelplineError::UnknownSession(session_id.clone()));
        }
        self.ensure_worker(session_id);
        self.enqueue(session_id, SessionJob::Escalation { reason });
        Ok(())
    }

    /// Operator hands their session back to an AI responder, optionally with
    /// a note folded into the context for the receiving responder.
    pub fn request_ai_transfer(
        &self,
        operator_id: &OperatorId,
        target: ResponderKind,
        note: Option<String>,
    ) -> Result<()> {
        let session_id = self
            .inner
            .broker
            .operator_session(operator_id)
            .ok_or_else(|| {
                HelplineError::invalid_transition(format!(
                    "operator {operator_id} has no assigned session"
                ))
            })?;
        self.ensure_worker(&session_id);
        self.enqueue(
            &session_id,
            SessionJob::AiTransfer {
                operator: operator_id.clone(),
                target,
                note,
            },
        );
        Ok(())
    }

    /// Monitoring snapshot: active sessions and the operator availability
    /// table.
    pub fn get_status(&self) -> StatusReport {
        let operators = self
            .inner
            .broker
            .availability()
            .into_iter()
            .map(|(id, availability)| OperatorStatus { id, availability })
            .collect();
        StatusReport {
            active_sessions: self.inner.registry.active_count(),
            waiting_sessions: self.inner.registry.waiting_count(),
            available_operators: self.inner.broker.available_count(),
            operators,
        }
    }

    fn ensure_worker(&self, session_id: &SessionId) {
        let mut workers = self.inner.workers.lock().unwrap();
        if let Some(tx) = workers.get(session_id) {
            if !tx.is_closed() {
                return;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        workers.insert(session_id.clone(), tx);
        let inner = self.inner.clone();
        let session_id = session_id.clone();
        tokio::spawn(session_worker(inner, session_id, rx));
    }

    fn enqueue(&self, session_id: &SessionId, job: SessionJob) -> bool {
        let workers = self.inner.workers.lock().unwrap();
        match workers.get(session_id) {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }
}

/// One task per session: drains the queue in order, so a session's
/// processing is serialized while other sessions run in parallel.
async fn session_worker(
    inner: Arc<Inner>,
    session_id: SessionId,
    mut rx: UnboundedReceiver<SessionJob>,
) {
    debug!(session = %session_id, "Session worker started");
    while let Some(job) = rx.recv().await {
        match job {
            SessionJob::CustomerMessage { body } => {
                handle_customer_message(&inner, &session_id, body).await;
            }
            SessionJob::OperatorMessage { operator, body } => {
                handle_operator_message(&inner, &session_id, &operator, body);
            }
            SessionJob::Escalation { reason } => {
                handle_escalation(&inner, &session_id, reason);
            }
            SessionJob::AiTransfer {
                operator,
                target,
                note,
            } => {
                handle_ai_transfer(&inner, &session_id, &operator, target, note).await;
            }
            SessionJob::OperatorLost { operator } => {
                if let Err(e) = inner
                    .coordinator
                    .handle_operator_disconnect(&operator, &session_id)
                {
                    warn!(session = %session_id, error = %e, "Failed to park session");
                }
            }
            SessionJob::Close => {
                inner.workers.lock().unwrap().remove(&session_id);
                close_session(&inner, &session_id);
                break;
            }
        }
    }
    debug!(session = %session_id, "Session worker stopped");
}

async fn handle_customer_message(inner: &Arc<Inner>, session_id: &SessionId, body: String) {
    match inner.registry.status(session_id) {
        Ok(SessionStatus::Closed) => {
            warn!(session = %session_id, "Message for closed session dropped");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(session = %session_id, error = %e, "Message for unknown session dropped");
            return;
        }
    }
    if let Err(e) = inner
        .registry
        .append_message(session_id, Message::customer(&body))
    {
        warn!(session = %session_id, error = %e, "Failed to append customer message");
        return;
    }

    let owner = match inner.registry.owner(session_id) {
        Ok(owner) => owner,
        Err(e) => {
            warn!(session = %session_id, error = %e, "Owner lookup failed");
            return;
        }
    };

    match owner {
        Owner::Operator(operator) => {
            deliver_to_operator(inner, session_id, &operator, &body);
        }
        Owner::Responder(kind) => {
            run_responder_chain(inner, session_id, kind, &body).await;
        }
        Owner::Unassigned => {
            // The human owner was lost earlier; fall back to triage so the
            // customer is never stranded. An explicit escalation can still
            // reassign a human later.
            match inner.coordinator.apply(
                session_id,
                TransferRequest::new(
                    TransferTarget::Responder(ResponderKind::Triage),
                    Some("no human owner attached".to_string()),
                    vec![],
                ),
            ) {
                Ok(_) => run_responder_chain(inner, session_id, ResponderKind::Triage, &body).await,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Fallback to triage failed")
                }
            }
        }
    }
}

fn deliver_to_operator(
    inner: &Arc<Inner>,
    session_id: &SessionId,
    operator: &OperatorId,
    body: &str,
) {
    if inner.pool.human().deliver(operator, session_id, body).is_ok() {
        return;
    }
    // Stale mapping: recover by re-attempting assignment, then hand the
    // message to whoever we got.
    let snapshot = inner
        .registry
        .context_window(session_id, inner.config.context_window)
        .unwrap_or_default();
    match inner
        .coordinator
        .recover_lost_operator(operator, session_id, snapshot)
    {
        Ok(TransferOutcome::Applied {
            to: Owner::Operator(next),
        }) => {
            let _ = inner.pool.human().deliver(&next, session_id, body);
        }
        Ok(_) => {
            // No replacement found; the customer already got the notice and
            // the session waits for a human.
        }
        Err(e) => {
            warn!(session = %session_id, error = %e, "Operator recovery failed");
        }
    }
}

fn handle_operator_message(
    inner: &Arc<Inner>,
    session_id: &SessionId,
    operator: &OperatorId,
    body: String,
) {
    // Ownership may have moved between enqueue and processing; a message
    // from a no-longer-owning operator is dropped, never delivered across a
    // committed transfer.
    match inner.registry.owner(session_id) {
        Ok(Owner::Operator(current)) if &current == operator => {}
        Ok(owner) => {
            warn!(
                session = %session_id,
                operator = %operator,
                owner = %owner,
                "Operator message dropped: session owner changed"
            );
            return;
        }
        Err(e) => {
            warn!(session = %session_id, error = %e, "Operator message for unknown session");
            return;
        }
    }

    if let Err(e) = inner
        .registry
        .append_message(session_id, Message::operator(&body, operator))
    {
        warn!(session = %session_id, error = %e, "Failed to append operator message");
        return;
    }
    send_to_customer(
        inner,
        session_id,
        OutboundEvent::Reply {
            session_id: session_id.clone(),
            sender: "Human Support".to_string(),
            body,
        },
    );
}

fn handle_escalation(inner: &Arc<Inner>, session_id: &SessionId, reason: Option<String>) {
    let snapshot = inner
        .registry
        .context_window(session_id, inner.config.context_window)
        .unwrap_or_default();
    match inner.coordinator.apply(
        session_id,
        TransferRequest::new(TransferTarget::Human, reason, snapshot),
    ) {
        Ok(TransferOutcome::Applied { to }) => {
            debug!(session = %session_id, to = %to, "Escalation applied");
        }
        Ok(TransferOutcome::Rejected { .. }) => {
            // Notice already delivered; the session stays with its AI owner.
        }
        Err(e) => {
            warn!(session = %session_id, error = %e, "Escalation failed");
        }
    }
}

async fn handle_ai_transfer(
    inner: &Arc<Inner>,
    session_id: &SessionId,
    operator: &OperatorId,
    target: ResponderKind,
    note: Option<String>,
) {
    match inner.registry.owner(session_id) {
        Ok(Owner::Operator(current)) if &current == operator => {}
        _ => {
            warn!(
                session = %session_id,
                operator = %operator,
                "AI transfer refused: operator does not own the session"
            );
            if let Ok(transport) = inner.broker.route_operator(operator) {
                let _ = transport.send(OutboundEvent::TransferConfirmation {
                    session_id: session_id.clone(),
                    target: target.label().to_string(),
                    accepted: false,
                });
            }
            return;
        }
    }

    if let Some(note) = &note {
        let _ = inner.registry.append_message(
            session_id,
            Message::operator(format!("Human agent note: {note}"), operator),
        );
    }
    let _ = inner.registry.append_message(
        session_id,
        Message::operator(
            "This conversation has been transferred from a human agent. \
             Please continue assisting the customer.",
            operator,
        ),
    );

    let snapshot = inner
        .registry
        .context_window(session_id, inner.config.context_window)
        .unwrap_or_default();
    match inner.coordinator.apply(
        session_id,
        TransferRequest::new(TransferTarget::Responder(target), note, snapshot),
    ) {
        Ok(TransferOutcome::Applied {
            to: Owner::Responder(kind),
        }) => {
            // Let the receiving responder pick the conversation up right
            // away instead of waiting for the next customer message.
            let latest = latest_customer_text(inner, session_id);
            run_responder_chain(inner, session_id, kind, &latest).await;
        }
        Ok(outcome) => {
            debug!(session = %session_id, ?outcome, "Unexpected AI transfer outcome");
        }
        Err(e) => {
            warn!(session = %session_id, error = %e, "AI transfer failed");
            if let Ok(transport) = inner.broker.route_operator(operator) {
                let _ = transport.send(OutboundEvent::TransferConfirmation {
                    session_id: session_id.clone(),
                    target: target.label().to_string(),
                    accepted: false,
                });
            }
        }
    }
}

/// Run the owning responder, following AI→AI transfers until a reply, an
/// operator assignment, or the hop budget is spent.
async fn run_responder_chain(
    inner: &Arc<Inner>,
    session_id: &SessionId,
    mut kind: ResponderKind,
    latest: &str,
) {
    for _hop in 0..inner.config.max_transfer_hops {
        let Some(responder) = inner.pool.get(kind) else {
            warn!(session = %session_id, responder = %kind, "No responder registered");
            reply_in_place(inner, session_id, kind, ROUTING_FALLBACK_REPLY);
            return;
        };

        let history = match inner
            .registry
            .context_window(session_id, inner.config.context_window)
        {
            Ok(history) => history,
            Err(e) => {
                warn!(session = %session_id, error = %e, "History lookup failed");
                return;
            }
        };
        let ctx = SessionContext {
            session_id: session_id.clone(),
            history,
            latest: latest.to_string(),
        };

        match responder.handle(&ctx).await {
            Outcome::Reply(text) => {
                reply_in_place(inner, session_id, kind, &text);
                return;
            }
            Outcome::Transfer(request) => match inner.coordinator.apply(session_id, request) {
                Ok(TransferOutcome::Applied {
                    to: Owner::Responder(next),
                }) => {
                    kind = next;
                    continue;
                }
                Ok(TransferOutcome::Applied { to }) => {
                    debug!(session = %session_id, to = %to, "Chain ended in assignment");
                    return;
                }
                Ok(TransferOutcome::Rejected { .. }) => {
                    // "No operator" notice already went out; the session
                    // stays with the current AI owner.
                    return;
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Transfer failed mid-chain");
                    reply_in_place(inner, session_id, kind, ROUTING_FALLBACK_REPLY);
                    return;
                }
            },
        }
    }
    warn!(session = %session_id, "Transfer hop budget exhausted");
    reply_in_place(inner, session_id, kind, ROUTING_FALLBACK_REPLY);
}

fn reply_in_place(inner: &Arc<Inner>, session_id: &SessionId, kind: ResponderKind, text: &str) {
    let sender = kind.label().to_string();
    if let Err(e) = inner
        .registry
        .append_message(session_id, Message::assistant(text, &sender))
    {
        warn!(session = %session_id, error = %e, "Failed to append reply");
    }
    send_to_customer(
        inner,
        session_id,
        OutboundEvent::Reply {
            session_id: session_id.clone(),
            sender,
            body: text.to_string(),
        },
    );
}

fn send_to_customer(inner: &Arc<Inner>, session_id: &SessionId, event: OutboundEvent) {
    match inner.broker.route_customer(session_id) {
        Ok(transport) => {
            if transport.send(event).is_err() {
                debug!(session = %session_id, "Customer transport closed, event dropped");
            }
        }
        Err(_) => {
            debug!(session = %session_id, "Customer not connected, event dropped");
        }
    }
}

fn latest_customer_text(inner: &Arc<Inner>, session_id: &SessionId) -> String {
    inner
        .registry
        .history(session_id)
        .ok()
        .and_then(|history| {
            history
                .iter()
                .rev()
                .find(|m| m.role == Role::Customer)
                .map(|m| m.content.clone())
        })
        .unwrap_or_default()
}

fn close_session(inner: &Arc<Inner>, session_id: &SessionId) {
    if let Ok(Owner::Operator(operator)) = inner.registry.owner(session_id) {
        if inner.broker.mark_available(&operator).is_ok() {
            if let Ok(transport) = inner.broker.route_operator(&operator) {
                let _ = transport.send(OutboundEvent::SessionEnded {
                    session_id: session_id.clone(),
                    notice: "The customer ended this conversation.".to_string(),
                });
            }
        }
    }
    if let Err(e) = inner.registry.close(session_id) {
        debug!(session = %session_id, error = %e, "Close on missing session");
    }
    inner.broker.unregister_customer(session_id);
    info!(session = %session_id, "Session closed");
}
