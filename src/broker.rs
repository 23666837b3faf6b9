//! Connection broker: transport ↔ identity mapping and operator availability
//!
//! The broker is the only component that knows which live transports belong
//! to which customer session or operator. It is an explicit, lifecycle-scoped
//! object injected into the dispatcher: registration on connect,
//! unregistration on disconnect, never ambient state.
//!
//! Operator selection is deterministic: the first idle operator, ties broken
//! by earliest connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{HelplineError, Result};
use crate::items::{OperatorId, OutboundEvent, SessionId};

/// Outbound side of a transport channel. The real transport (e.g. a
/// WebSocket writer) drains the receiving end outside the core.
pub type Transport = mpsc::UnboundedSender<OutboundEvent>;

/// Operator availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    Busy(SessionId),
    Offline,
}

struct OperatorConnection {
    transport: Transport,
    availability: Availability,
    /// Monotonic connect order; the selection tie-breaker.
    connected_seq: u64,
}

#[derive(Default)]
struct BrokerState {
    customers: HashMap<SessionId, Transport>,
    operators: HashMap<OperatorId, OperatorConnection>,
    next_seq: u64,
}

/// Internally synchronized transport/availability table.
#[derive(Default)]
pub struct ConnectionBroker {
    inner: Mutex<BrokerState>,
}

impl ConnectionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a customer transport. A second registration for the same live
    /// session is rejected rather than silently replacing the channel.
    pub fn register_customer(&self, id: &SessionId, transport: Transport) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.customers.contains_key(id) {
            return Err(HelplineError::invalid_transition(format!(
                "customer transport already registered for session {id}"
            )));
        }
        state.customers.insert(id.clone(), transport);
        debug!(session = %id, "Customer transport registered");
        Ok(())
    }

    /// Detach a customer transport. Returns whether it was present.
    pub fn unregister_customer(&self, id: &SessionId) -> bool {
        let mut state = self.inner.lock().unwrap();
        state.customers.remove(id).is_some()
    }

    /// Attach an operator transport; the operator starts `Available`.
    pub fn register_operator(&self, id: &OperatorId, transport: Transport) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.operators.contains_key(id) {
            return Err(HelplineError::invalid_transition(format!(
                "operator {id} already connected"
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.operators.insert(
            id.clone(),
            OperatorConnection {
                transport,
                availability: Availability::Available,
                connected_seq: seq,
            },
        );
        debug!(operator = %id, seq, "Operator connected");
        Ok(())
    }

    /// Detach an operator. Returns the session the operator was serving, if
    /// any, so the caller can release it.
    pub fn unregister_operator(&self, id: &OperatorId) -> Option<SessionId> {
        let mut state = self.inner.lock().unwrap();
        let connection = state.operators.remove(id)?;
        debug!(operator = %id, "Operator disconnected");
        match connection.availability {
            Availability::Busy(session) => Some(session),
            _ => None,
        }
    }

    /// First idle operator, earliest-connected first. Deterministic across
    /// repeated calls with unchanged state.
    pub fn find_available_operator(&self) -> Option<OperatorId> {
        let state = self.inner.lock().unwrap();
        state
            .operators
            .iter()
            .filter(|(_, c)| c.availability == Availability::Available)
            .min_by_key(|(_, c)| c.connected_seq)
            .map(|(id, _)| id.clone())
    }

    /// Atomically pick an idle operator and mark them busy with `session`.
    /// Selection and reservation happen under one lock so two concurrent
    /// escalations can never grab the same operator.
    pub fn reserve_operator(&self, session: &SessionId) -> Option<OperatorId> {
        let mut state = self.inner.lock().unwrap();
        let id = state
            .operators
            .iter()
            .filter(|(_, c)| c.availability == Availability::Available)
            .min_by_key(|(_, c)| c.connected_seq)
            .map(|(id, _)| id.clone())?;
        if let Some(connection) = state.operators.get_mut(&id) {
            connection.availability = Availability::Busy(session.clone());
        }
        debug!(operator = %id, session = %session, "Operator reserved");
        Some(id)
    }

    /// Mark an operator busy with a session.
    pub fn mark_busy(&self, id: &OperatorId, session: &SessionId) -> Result<()> {
        self.set_availability(id, Availability::Busy(session.clone()))
    }

    /// Return an operator to the idle pool.
    pub fn mark_available(&self, id: &OperatorId) -> Result<()> {
        self.set_availability(id, Availability::Available)
    }

    fn set_availability(&self, id: &OperatorId, availability: Availability) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let connection = state
            .operators
            .get_mut(id)
            .ok_or_else(|| HelplineError::not_connected(id))?;
        connection.availability = availability;
        Ok(())
    }

    /// The session an operator is currently serving.
    pub fn operator_session(&self, id: &OperatorId) -> Option<SessionId> {
        let state = self.inner.lock().unwrap();
        match state.operators.get(id)?.availability {
            Availability::Busy(ref session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Transport for a customer session. Fails with `NotConnected` when the
    /// customer has disconnected since assignment.
    pub fn route_customer(&self, id: &SessionId) -> Result<Transport> {
        let state = self.inner.lock().unwrap();
        let transport = state
            .customers
            .get(id)
            .ok_or_else(|| HelplineError::not_connected(id))?;
        if transport.is_closed() {
            warn!(session = %id, "Customer transport closed but still registered");
            return Err(HelplineError::not_connected(id));
        }
        Ok(transport.clone())
    }

    /// Transport for an operator. Fails with `NotConnected` when the
    /// operator has disconnected since assignment.
    pub fn route_operator(&self, id: &OperatorId) -> Result<Transport> {
        let state = self.inner.lock().unwrap();
        let connection = state
            .operators
            .get(id)
            .ok_or_else(|| HelplineError::not_connected(id))?;
        if connection.transport.is_closed() {
            warn!(operator = %id, "Operator transport closed but still registered");
            return Err(HelplineError::not_connected(id));
        }
        Ok(connection.transport.clone())
    }

    /// Availability table in connect order, for status reporting.
    pub fn availability(&self) -> Vec<(OperatorId, Availability)> {
        let state = self.inner.lock().unwrap();
        let mut entries: Vec<_> = state
            .operators
            .iter()
            .map(|(id, c)| (c.connected_seq, id.clone(), c.availability.clone()))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, id, availability)| (id, availability))
            .collect()
    }

    pub fn operator_count(&self) -> usize {
        self.inner.lock().unwrap().operators.len()
    }

    pub fn available_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .operators
            .values()
            .filter(|c| c.availability == Availability::Available)
            .count()
    }
}
