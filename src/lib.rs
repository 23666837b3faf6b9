//! # Helpline
//!
//! Routing core for live customer-support chat: many customer sessions, a
//! pool of specialized AI responders plus human operators, and atomic
//! ownership transfers between them that never drop or duplicate a message.
//!
//! ## Core Concepts
//!
//! - **Session**: one customer's conversation thread, owned exclusively by
//!   the [`SessionRegistry`]. Append-only history, one owner at a time.
//! - **Responder**: a uniform capability unit (`handle(context) -> Outcome`):
//!   the triage/technical/billing/sales specialists and the human relay.
//! - **Transfer**: an ownership change applied by the [`TransferCoordinator`];
//!   escalation is a transfer targeting a human operator.
//! - **Broker**: the [`ConnectionBroker`] maps live transports to identities
//!   and tracks operator availability deterministically.
//! - **Dispatcher**: the front door. One worker per session serializes that
//!   session's processing; independent sessions run in parallel.
//!
//! The web layer, prompt content, and the actual LLM call stay outside: the
//! core talks to them through [`Transport`] channels and the
//! [`InferenceProvider`] trait.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use helpline::{Dispatcher, ScriptedProvider, SessionId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A scripted provider stands in for the real model here.
//!     let provider = Arc::new(ScriptedProvider::new().with_reply("Hi! How can I help?"));
//!     let dispatcher = Dispatcher::new(provider);
//!
//!     let session = SessionId::from("customer-1");
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     dispatcher.customer_connect(&session, tx)?;
//!     dispatcher.submit_customer_message(&session, "My laptop won't boot")?;
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod items;
pub mod model;
pub mod registry;
pub mod responder;
pub mod tool;
pub mod transfer;

pub use broker::{Availability, ConnectionBroker, Transport};
pub use coordinator::{TransferCoordinator, TransferOutcome};
pub use dispatcher::{CoreConfig, Dispatcher, OperatorStatus, StatusReport};
pub use error::{HelplineError, Result};
pub use items::{
    Message, OperatorId, OutboundEvent, Owner, ResponderKind, Role, SessionId, SessionStatus,
    ToolCall, TransferRecord,
};
pub use model::{InferenceProvider, InferenceResponse, ScriptedProvider};
pub use registry::{Session, SessionRegistry};
pub use responder::{classify_intent, HumanRelay, Responder, ResponderPool, SessionContext};
pub use tool::{FunctionTool, Tool, ToolInvocation, ToolOutput, ToolResult, ToolRouter};
pub use transfer::{transfer_tools, Outcome, TransferRequest, TransferTarget, TransferTool};
