//! Items representing messages, session ownership, and outbound envelopes
//!
//! This module defines the core data structures shared by the registry,
//! broker, coordinator, and dispatcher. Everything that crosses a component
//! boundary is a tagged type, exhaustively matched at each boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for one customer conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh session id.
    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier for one connected human operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperatorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Assistant,
    Operator,
    Tool,
}

/// A message in the conversation history.
///
/// History entries are append-only; past entries are never mutated. The
/// ordered history is the single source of truth any future owner resumes
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Display name of the responder or operator that produced the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn customer(content: impl Into<String>) -> Self {
        Self {
            role: Role::Customer,
            content: content.into(),
            sender: None,
            tool_call_id: None,
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sender: Some(sender.into()),
            tool_call_id: None,
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        sender: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            sender: Some(sender.into()),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
            created_at: Utc::now(),
        }
    }

    pub fn operator(content: impl Into<String>, operator: &OperatorId) -> Self {
        Self {
            role: Role::Operator,
            content: content.into(),
            sender: Some(operator.to_string()),
            tool_call_id: None,
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            sender: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
            created_at: Utc::now(),
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The specialized AI responders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponderKind {
    Triage,
    Technical,
    Billing,
    Sales,
}

impl ResponderKind {
    /// Short identifier used in transfer tool names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponderKind::Triage => "triage",
            ResponderKind::Technical => "technical",
            ResponderKind::Billing => "billing",
            ResponderKind::Sales => "sales",
        }
    }

    /// Customer-facing display label.
    pub fn label(&self) -> &'static str {
        match self {
            ResponderKind::Triage => "Customer Service",
            ResponderKind::Technical => "Technical Support",
            ResponderKind::Billing => "Billing Support",
            ResponderKind::Sales => "Sales Support",
        }
    }
}

impl fmt::Display for ResponderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current owner of a session. Exactly one owner is recorded at any
/// instant; ownership changes only through the transfer coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum Owner {
    Responder(ResponderKind),
    Operator(OperatorId),
    Unassigned,
}

impl Owner {
    pub fn is_operator(&self) -> bool {
        matches!(self, Owner::Operator(_))
    }

    /// Display label used in outbound envelopes and transfer notices.
    pub fn label(&self) -> String {
        match self {
            Owner::Responder(kind) => kind.label().to_string(),
            Owner::Operator(_) => "Human Support".to_string(),
            Owner::Unassigned => "Unassigned".to_string(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Responder(kind) => write!(f, "responder:{kind}"),
            Owner::Operator(id) => write!(f, "operator:{id}"),
            Owner::Unassigned => f.write_str("unassigned"),
        }
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    /// The session lost its human owner (operator disconnect) and waits for
    /// reassignment.
    WaitingForHuman,
    Closed,
}

/// One entry of a session's append-only transfer history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub from: Owner,
    pub to: Owner,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(from: Owner, to: Owner, reason: Option<String>) -> Self {
        Self {
            from,
            to,
            reason,
            occurred_at: Utc::now(),
        }
    }
}

/// Everything pushed to a transport is one of these tagged envelopes.
///
/// Collaborators match on the variant; no state is ever inferred from reply
/// text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Initial greeting when a customer transport attaches.
    Greeting { session_id: SessionId, body: String },
    /// A reply from the session's current owner to the customer.
    Reply {
        session_id: SessionId,
        sender: String,
        body: String,
    },
    /// Customer-visible notice that the session changed hands.
    TransferNotice {
        session_id: SessionId,
        to: String,
        notice: String,
    },
    /// First-class "no human agents available" signal.
    NoOperatorAvailable { session_id: SessionId, notice: String },
    /// Operator-side notification of a newly assigned escalation.
    EscalationAssigned {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        history: Vec<Message>,
        latest: String,
    },
    /// Operator-side relay of a customer message for an owned session.
    CustomerMessage { session_id: SessionId, body: String },
    /// Operator-side acknowledgment of a requested transfer back to AI.
    TransferConfirmation {
        session_id: SessionId,
        target: String,
        accepted: bool,
    },
    /// Operator-side confirmation of a successful connect.
    ConnectionConfirmed { operator_id: OperatorId },
    /// Operator-side notice that an owned session ended.
    SessionEnded { session_id: SessionId, notice: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_message_creation() {
        let customer = Message::customer("My invoice looks wrong");
        assert_eq!(customer.role, Role::Customer);
        assert!(customer.sender.is_none());

        let reply = Message::assistant("Let me check that for you", "Billing Support");
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.sender.as_deref(), Some("Billing Support"));

        let tool = Message::tool("{\"status\":\"ok\"}", "call_9");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn test_owner_display_and_label() {
        let ai = Owner::Responder(ResponderKind::Technical);
        assert_eq!(ai.to_string(), "responder:technical");
        assert_eq!(ai.label(), "Technical Support");

        let human = Owner::Operator(OperatorId::from("op-1"));
        assert_eq!(human.to_string(), "operator:op-1");
        assert!(human.is_operator());
    }

    #[test]
    fn test_owner_serialization_round_trip() {
        let owner = Owner::Operator(OperatorId::from("op-7"));
        let json = serde_json::to_string(&owner).unwrap();
        assert!(json.contains("\"kind\":\"Operator\""));
        let back: Owner = serde_json::from_str(&json).unwrap();
        assert_eq!(owner, back);
    }

    #[test]
    fn test_outbound_event_is_tagged() {
        let event = OutboundEvent::NoOperatorAvailable {
            session_id: SessionId::from("s-1"),
            notice: "No human agents are currently available.".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"NoOperatorAvailable\""));
    }

    #[test]
    fn test_transfer_record() {
        let record = TransferRecord::new(
            Owner::Responder(ResponderKind::Triage),
            Owner::Responder(ResponderKind::Technical),
            Some("keyword routing".to_string()),
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.from, Owner::Responder(ResponderKind::Triage));
        assert_eq!(back.reason.as_deref(), Some("keyword routing"));
    }

    #[test]
    fn test_session_id_generate_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.0.starts_with("session-"));
    }
}
