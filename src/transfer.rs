//! Transfer directives and the tools that request them
//!
//! A transfer is an ownership change of a session. Responders request one by
//! calling a transfer tool ([`TransferTool`]) that is advertised to the model
//! next to the plain tools but intercepted by the responder loop; it is
//! never executed through the tool router. The intercepted call becomes a
//! [`TransferRequest`] that the coordinator validates and applies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::items::{Message, ResponderKind};
use crate::tool::{Tool, ToolResult};

/// Where a transfer is headed: a named AI responder or a human operator
/// picked by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTarget {
    Responder(ResponderKind),
    Human,
}

impl TransferTarget {
    /// The tool name advertised to the model for this target.
    pub fn tool_name(&self) -> &'static str {
        match self {
            TransferTarget::Responder(ResponderKind::Triage) => "transfer_back_to_triage",
            TransferTarget::Responder(ResponderKind::Technical) => "transfer_to_technical",
            TransferTarget::Responder(ResponderKind::Billing) => "transfer_to_billing",
            TransferTarget::Responder(ResponderKind::Sales) => "transfer_to_sales",
            TransferTarget::Human => "escalate_to_human",
        }
    }

    /// Reverse mapping from an intercepted tool-call name.
    pub fn from_tool_name(name: &str) -> Option<Self> {
        match name {
            "transfer_back_to_triage" => Some(TransferTarget::Responder(ResponderKind::Triage)),
            "transfer_to_technical" => Some(TransferTarget::Responder(ResponderKind::Technical)),
            "transfer_to_billing" => Some(TransferTarget::Responder(ResponderKind::Billing)),
            "transfer_to_sales" => Some(TransferTarget::Responder(ResponderKind::Sales)),
            "escalate_to_human" => Some(TransferTarget::Human),
            _ => None,
        }
    }

    /// Customer-facing label of the receiving side.
    pub fn label(&self) -> &'static str {
        match self {
            TransferTarget::Responder(kind) => kind.label(),
            TransferTarget::Human => "Human Support",
        }
    }

    fn tool_description(&self) -> &'static str {
        match self {
            TransferTarget::Responder(ResponderKind::Triage) => {
                "Transfer back to triage when the topic is outside your expertise or for general routing."
            }
            TransferTarget::Responder(ResponderKind::Technical) => {
                "Transfer to technical support for hardware, software, network, installation, or troubleshooting issues."
            }
            TransferTarget::Responder(ResponderKind::Billing) => {
                "Transfer to billing support for payment, subscription, refund, invoice, or account billing issues."
            }
            TransferTarget::Responder(ResponderKind::Sales) => {
                "Transfer to sales for product information, purchasing, upgrades, or sales inquiries."
            }
            TransferTarget::Human => {
                "Escalate to a human agent for complex issues, complaints, or when the customer explicitly requests human assistance."
            }
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::Responder(kind) => write!(f, "responder:{kind}"),
            TransferTarget::Human => f.write_str("human"),
        }
    }
}

/// A validated-not-yet-applied request to move a session to a new owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub target: TransferTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Context snapshot taken when the request was raised; handed to the new
    /// owner (e.g. shown to an assigned operator).
    pub snapshot: Vec<Message>,
}

impl TransferRequest {
    pub fn new(target: TransferTarget, reason: Option<String>, snapshot: Vec<Message>) -> Self {
        Self {
            target,
            reason,
            snapshot,
        }
    }
}

/// The result a responder produces after processing one message.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Final text for the customer; tool invocations were already folded in.
    Reply(String),
    /// The responder wants to hand the session to someone else.
    Transfer(TransferRequest),
}

/// Adapter exposing a transfer target as a tool the model can call.
///
/// The responder loop intercepts calls to these by name; `execute` only runs
/// if something routes one by mistake, and answers with an inert ack.
#[derive(Debug, Clone)]
pub struct TransferTool {
    target: TransferTarget,
}

impl TransferTool {
    pub fn to(target: TransferTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> TransferTarget {
        self.target
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &str {
        self.target.tool_name()
    }

    fn description(&self) -> &str {
        self.target.tool_description()
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Reason for the transfer"
                }
            }
        })
    }

    async fn execute(&self, _arguments: Value) -> Result<ToolResult> {
        Ok(ToolResult::success(json!({ "transfer": true })))
    }
}

/// Build the advertised tool set for a responder's declared targets.
pub fn transfer_tools(targets: &[TransferTarget]) -> Vec<Arc<dyn Tool>> {
    targets
        .iter()
        .map(|t| Arc::new(TransferTool::to(*t)) as Arc<dyn Tool>)
        .collect()
}

/// Pull the optional reason string out of a transfer tool call's arguments.
pub fn reason_from_arguments(arguments: &Value) -> Option<String> {
    arguments
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_name_round_trip() {
        let targets = [
            TransferTarget::Responder(ResponderKind::Triage),
            TransferTarget::Responder(ResponderKind::Technical),
            TransferTarget::Responder(ResponderKind::Billing),
            TransferTarget::Responder(ResponderKind::Sales),
            TransferTarget::Human,
        ];
        for target in targets {
            assert_eq!(
                TransferTarget::from_tool_name(target.tool_name()),
                Some(target)
            );
        }
        assert_eq!(TransferTarget::from_tool_name("lookup_account"), None);
    }

    #[test]
    fn transfer_tools_advertise_reason_parameter() {
        let tools = transfer_tools(&[
            TransferTarget::Responder(ResponderKind::Technical),
            TransferTarget::Human,
        ]);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name(), "transfer_to_technical");
        assert_eq!(tools[1].name(), "escalate_to_human");
        let schema = tools[1].parameters_schema();
        assert!(schema["properties"]["reason"].is_object());
    }

    #[test]
    fn reason_extraction() {
        let args = json!({"reason": "customer asked for a person"});
        assert_eq!(
            reason_from_arguments(&args).as_deref(),
            Some("customer asked for a person")
        );
        assert_eq!(reason_from_arguments(&json!({})), None);
    }

    #[test]
    fn transfer_request_serialization() {
        let request = TransferRequest::new(
            TransferTarget::Human,
            Some("complaint".to_string()),
            vec![Message::customer("I want to speak to a person")],
        );
        let serialized = serde_json::to_string(&request).unwrap();
        let back: TransferRequest = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.target, TransferTarget::Human);
        assert_eq!(back.snapshot.len(), 1);
    }
}
