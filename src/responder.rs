//! Responder pool: the specialized AI responders and the human relay
//!
//! A [`Responder`] is one configured participant: a kind, instructions, an
//! allowed tool set, and the transfer targets it may hand a session to.
//! Responders are constructed once at startup and shared across sessions;
//! they carry no per-session state and are safe to invoke concurrently for
//! independent sessions. All session mutation happens outside them, through
//! the [`Outcome`] they return; responders never touch the registry or a
//! transport directly.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::broker::ConnectionBroker;
use crate::error::{HelplineError, Result};
use crate::items::{Message, OperatorId, OutboundEvent, ResponderKind, SessionId};
use crate::model::InferenceProvider;
use crate::tool::{self, Tool, ToolInvocation, ToolOutput, ToolRouter};
use crate::transfer::{
    self, reason_from_arguments, Outcome, TransferRequest, TransferTarget,
};

/// Fallback reply when inference or tooling fails past the retry budget.
/// Offers the human-escalation path rather than dead-ending the customer.
pub const APOLOGY_REPLY: &str = "I apologize, but I encountered an error processing your request. \
     Please try again, or ask to speak with a human agent and I'll connect you.";

/// Clarifying question triage falls back to when it cannot route with
/// confidence. The message is never silently dropped.
pub const CLARIFY_REPLY: &str = "I want to make sure I get you to the right team. Could you tell me a bit \
     more? For example, is this about a technical problem, a bill or payment, \
     or a purchase?";

/// Everything a responder sees when handling one message: the bounded recent
/// history (latest message included) and the latest customer text on its own
/// for intent classification.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub history: Vec<Message>,
    pub latest: String,
}

/// Configuration for a [`Responder`].
#[derive(Clone)]
pub struct ResponderConfig {
    /// Which specialist this is; also the customer-facing sender label.
    pub kind: ResponderKind,
    /// System instructions priming the model with the responder's persona.
    pub instructions: String,
    /// Plain tools this responder may execute.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Transfer targets this responder may hand a session to.
    pub targets: Vec<TransferTarget>,
    /// Upper bound on infer→tools→infer rounds for one message.
    pub max_tool_turns: usize,
    /// Minimum intent-classification score before triage routes without
    /// asking.
    pub clarify_threshold: f32,
}

/// One specialized AI responder.
pub struct Responder {
    config: ResponderConfig,
    router: ToolRouter,
    provider: Arc<dyn InferenceProvider>,
}

impl Responder {
    pub fn new(
        kind: ResponderKind,
        instructions: impl Into<String>,
        provider: Arc<dyn InferenceProvider>,
    ) -> Self {
        let config = ResponderConfig {
            kind,
            instructions: instructions.into(),
            tools: vec![],
            targets: vec![],
            max_tool_turns: 4,
            clarify_threshold: 1.0,
        };
        let router = ToolRouter::new(&config.tools);
        Self {
            config,
            router,
            provider,
        }
    }

    /// Adds a tool to the responder's allowed set.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.config.tools.push(tool);
        self.router = ToolRouter::new(&self.config.tools);
        self
    }

    /// Declares a transfer target.
    pub fn with_target(mut self, target: TransferTarget) -> Self {
        self.config.targets.push(target);
        self
    }

    pub fn with_max_tool_turns(mut self, max_tool_turns: usize) -> Self {
        self.config.max_tool_turns = max_tool_turns;
        self
    }

    pub fn with_clarify_threshold(mut self, threshold: f32) -> Self {
        self.config.clarify_threshold = threshold;
        self
    }

    pub fn kind(&self) -> ResponderKind {
        self.config.kind
    }

    /// Constructs the system prompt: instructions plus summaries of the
    /// available tools and transfer targets.
    pub fn system_prompt(&self) -> String {
        let mut content = self.config.instructions.clone();

        if !self.config.tools.is_empty() {
            content.push_str("\n\nYou have access to the following tools:\n");
            for tool in &self.config.tools {
                content.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
            }
        }

        if !self.config.targets.is_empty() {
            content.push_str("\n\nYou can transfer the conversation to:\n");
            for target in &self.config.targets {
                content.push_str(&format!("- {}: {}\n", target.tool_name(), target.label()));
            }
        }

        content
    }

    /// Process one customer message and produce an [`Outcome`].
    ///
    /// Inference and tool failures are recovered here: one retry each, then
    /// the apology fallback. This method never returns an error and never
    /// panics a session.
    pub async fn handle(&self, ctx: &SessionContext) -> Outcome {
        let system_prompt = self.system_prompt();
        let advertised: Vec<Arc<dyn Tool>> = self
            .config
            .tools
            .iter()
            .cloned()
            .chain(transfer::transfer_tools(&self.config.targets))
            .collect();

        let mut conversation = ctx.history.clone();
        let mut inference_failures = 0usize;
        let mut tool_turns = 0usize;

        loop {
            let response = match self
                .provider
                .infer(&system_prompt, conversation.clone(), advertised.clone())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    inference_failures += 1;
                    if inference_failures > 1 {
                        warn!(
                            responder = %self.config.kind,
                            session = %ctx.session_id,
                            error = %e,
                            "Inference failed twice, falling back to apology"
                        );
                        return Outcome::Reply(APOLOGY_REPLY.to_string());
                    }
                    warn!(
                        responder = %self.config.kind,
                        session = %ctx.session_id,
                        error = %e,
                        "Inference failed, retrying once"
                    );
                    continue;
                }
            };

            // A transfer tool call short-circuits the turn; it is never
            // routed through the tool stack.
            let transfer = response.tool_calls.iter().find_map(|call| {
                TransferTarget::from_tool_name(&call.name)
                    .map(|target| (target, reason_from_arguments(&call.arguments)))
            });
            if let Some((target, reason)) = transfer {
                info!(
                    responder = %self.config.kind,
                    session = %ctx.session_id,
                    target = %target,
                    "Transfer requested"
                );
                return Outcome::Transfer(TransferRequest::new(target, reason, conversation));
            }

            if response.has_tool_calls() {
                tool_turns += 1;
                if tool_turns > self.config.max_tool_turns {
                    warn!(
                        responder = %self.config.kind,
                        session = %ctx.session_id,
                        "Tool turn budget exhausted"
                    );
                    return Outcome::Reply(APOLOGY_REPLY.to_string());
                }

                conversation.push(Message::assistant_with_tool_calls(
                    response.content.clone().unwrap_or_default(),
                    self.config.kind.label(),
                    response.tool_calls.clone(),
                ));

                // Tool calls within a turn run concurrently; results fold
                // back in call order.
                let outputs = join_all(response.tool_calls.iter().map(|call| {
                    self.invoke_tool(ToolInvocation {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                }))
                .await;
                for (call, output) in response.tool_calls.iter().zip(outputs) {
                    let content = match &output.error {
                        Some(err) => format!("Error: {err}"),
                        None => output.result.to_string(),
                    };
                    conversation.push(Message::tool(content, &call.id));
                }
                // Fold the results back and let the model produce the reply.
                continue;
            }

            let content = response.content.filter(|c| !c.is_empty());

            // Triage default-routing: a plain reply with no transfer signal
            // still gets the message classified, and routes when confident.
            if self.config.kind == ResponderKind::Triage {
                if let Some((target, score)) = classify_intent(&ctx.latest) {
                    if score >= self.config.clarify_threshold {
                        debug!(
                            session = %ctx.session_id,
                            target = %target,
                            score,
                            "Triage routed by intent classification"
                        );
                        return Outcome::Transfer(TransferRequest::new(
                            target,
                            Some(format!("intent classification ({score:.1})")),
                            conversation,
                        ));
                    }
                }
                return Outcome::Reply(content.unwrap_or_else(|| CLARIFY_REPLY.to_string()));
            }

            return Outcome::Reply(content.unwrap_or_else(|| APOLOGY_REPLY.to_string()));
        }
    }

    /// Route one tool invocation, retrying once before folding the failure
    /// into the conversation as an error result.
    async fn invoke_tool(&self, invocation: ToolInvocation) -> ToolOutput {
        match self.router.clone().oneshot(invocation.clone()).await {
            Ok(output) => output,
            Err(first) => {
                warn!(tool = %invocation.name, error = %first, "Tool call failed, retrying once");
                match self.router.clone().oneshot(invocation.clone()).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(tool = %invocation.name, error = %e, "Tool call failed after retry");
                        ToolOutput {
                            id: invocation.id,
                            result: serde_json::Value::Null,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("kind", &self.config.kind)
            .field("tools", &self.config.tools.len())
            .field("targets", &self.config.targets.len())
            .finish()
    }
}

// =============================
// Intent classification
// =============================

const TECHNICAL_KEYWORDS: &[(&str, f32)] = &[
    ("boot", 1.0),
    ("crash", 1.0),
    ("bug", 1.0),
    ("install", 1.0),
    ("network", 1.0),
    ("wifi", 1.0),
    ("broken", 1.0),
    ("not working", 1.0),
    ("troubleshoot", 1.0),
    ("driver", 1.0),
    ("error", 0.5),
    ("slow", 0.5),
    ("screen", 0.5),
    ("laptop", 0.5),
    ("software", 0.5),
    ("hardware", 0.5),
    ("restart", 0.5),
    ("update", 0.5),
];

const BILLING_KEYWORDS: &[(&str, f32)] = &[
    ("refund", 1.0),
    ("invoice", 1.0),
    ("charged", 1.0),
    ("overcharged", 1.0),
    ("bill", 1.0),
    ("billing", 1.0),
    ("payment", 1.0),
    ("charge", 0.5),
    ("subscription", 0.5),
];

const SALES_KEYWORDS: &[(&str, f32)] = &[
    ("buy", 1.0),
    ("purchase", 1.0),
    ("pricing", 1.0),
    ("demo", 1.0),
    ("discount", 1.0),
    ("trial", 1.0),
    ("price", 0.5),
    ("upgrade", 0.5),
    ("plan", 0.5),
    ("product", 0.5),
];

const HUMAN_KEYWORDS: &[(&str, f32)] = &[
    ("human", 1.0),
    ("representative", 1.0),
    ("manager", 1.0),
    ("speak to someone", 1.0),
    ("real person", 1.0),
    ("agent", 0.5),
    ("person", 0.5),
];

fn score(text: &str, keywords: &[(&str, f32)]) -> f32 {
    keywords
        .iter()
        .filter(|(kw, _)| text.contains(kw))
        .map(|(_, w)| w)
        .sum()
}

/// Keyword intent classifier behind triage's default routing.
///
/// Returns the best-scoring target and its score, or `None` when nothing
/// matched or the top two categories tie (ambiguous: ask instead of guess).
pub fn classify_intent(text: &str) -> Option<(TransferTarget, f32)> {
    let lowered = text.to_lowercase();
    let mut scores = [
        (
            TransferTarget::Responder(ResponderKind::Technical),
            score(&lowered, TECHNICAL_KEYWORDS),
        ),
        (
            TransferTarget::Responder(ResponderKind::Billing),
            score(&lowered, BILLING_KEYWORDS),
        ),
        (
            TransferTarget::Responder(ResponderKind::Sales),
            score(&lowered, SALES_KEYWORDS),
        ),
        (TransferTarget::Human, score(&lowered, HUMAN_KEYWORDS)),
    ];
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (best, best_score) = scores[0];
    if best_score <= 0.0 || (scores[1].1 - best_score).abs() < f32::EPSILON {
        return None;
    }
    Some((best, best_score))
}

// =============================
// Human relay
// =============================

/// The human-responder adapter: relays a customer message to the owning
/// operator's transport. Mirrors the AI responders' position in the pool but
/// delegates the actual answering to a person.
pub struct HumanRelay {
    broker: Arc<ConnectionBroker>,
}

impl HumanRelay {
    pub fn new(broker: Arc<ConnectionBroker>) -> Self {
        Self { broker }
    }

    /// Forward the customer's message to the operator. Fails with
    /// `NotConnected` when the operator transport is gone; the coordinator
    /// owns the fallback.
    pub fn deliver(
        &self,
        operator: &OperatorId,
        session: &SessionId,
        body: &str,
    ) -> Result<()> {
        let transport = self.broker.route_operator(operator)?;
        transport
            .send(OutboundEvent::CustomerMessage {
                session_id: session.clone(),
                body: body.to_string(),
            })
            .map_err(|_| HelplineError::not_connected(operator))
    }
}

// =============================
// The pool
// =============================

/// All responders plus the human relay, shared by every session.
pub struct ResponderPool {
    responders: HashMap<ResponderKind, Arc<Responder>>,
    human: HumanRelay,
}

impl ResponderPool {
    /// The standard four-specialist roster.
    pub fn standard(
        provider: Arc<dyn InferenceProvider>,
        broker: Arc<ConnectionBroker>,
        max_tool_turns: usize,
        clarify_threshold: f32,
    ) -> Self {
        let triage = Responder::new(
            ResponderKind::Triage,
            "You are a customer service triage agent. You handle initial customer \
             requests and conversations transferred back from human agents. Greet \
             new customers briefly and professionally, listen carefully, and route \
             each request to the appropriate department: technical issues to \
             technical support, billing or payment issues to billing support, sales \
             inquiries to the sales team, and complex issues to a human agent. Ask \
             clarifying questions only when needed to route properly.",
            provider.clone(),
        )
        .with_tool(Arc::new(tool::lookup_account()))
        .with_target(TransferTarget::Responder(ResponderKind::Technical))
        .with_target(TransferTarget::Responder(ResponderKind::Billing))
        .with_target(TransferTarget::Responder(ResponderKind::Sales))
        .with_target(TransferTarget::Human)
        .with_max_tool_turns(max_tool_turns)
        .with_clarify_threshold(clarify_threshold);

        let technical = Responder::new(
            ResponderKind::Technical,
            "You are a technical support specialist. Help customers with hardware, \
             software, network, and system issues. Provide clear step-by-step \
             solutions and create support tickets for complex issues. If the issue \
             is outside technical scope or the customer asks for a person, transfer \
             appropriately.",
            provider.clone(),
        )
        .with_tool(Arc::new(tool::create_ticket()))
        .with_tool(Arc::new(tool::check_status()))
        .with_target(TransferTarget::Responder(ResponderKind::Triage))
        .with_target(TransferTarget::Human)
        .with_max_tool_turns(max_tool_turns);

        let billing = Responder::new(
            ResponderKind::Billing,
            "You are a billing support specialist. Help customers with payments, \
             subscriptions, refunds, and billing questions. For account-specific \
             details, recommend human verification for security. Create tickets for \
             complex billing issues.",
            provider.clone(),
        )
        .with_tool(Arc::new(tool::lookup_account()))
        .with_tool(Arc::new(tool::create_ticket()))
        .with_target(TransferTarget::Responder(ResponderKind::Triage))
        .with_target(TransferTarget::Human)
        .with_max_tool_turns(max_tool_turns);

        let sales = Responder::new(
            ResponderKind::Sales,
            "You are a sales support specialist. Help customers with product \
             information, features, pricing, and purchasing decisions. Be helpful \
             and informative without being pushy. Escalate complex sales inquiries \
             to a human representative.",
            provider,
        )
        .with_tool(Arc::new(tool::lookup_account()))
        .with_target(TransferTarget::Responder(ResponderKind::Triage))
        .with_target(TransferTarget::Human)
        .with_max_tool_turns(max_tool_turns);

        let mut responders = HashMap::new();
        for responder in [triage, technical, billing, sales] {
            responders.insert(responder.kind(), Arc::new(responder));
        }

        Self {
            responders,
            human: HumanRelay::new(broker),
        }
    }

    /// Replace or add a responder (custom rosters, test doubles).
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responders
            .insert(responder.kind(), Arc::new(responder));
        self
    }

    pub fn get(&self, kind: ResponderKind) -> Option<Arc<Responder>> {
        self.responders.get(&kind).cloned()
    }

    /// The human-responder adapter.
    pub fn human(&self) -> &HumanRelay {
        &self.human
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedProvider;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx(latest: &str) -> SessionContext {
        SessionContext {
            session_id: SessionId::from("s-test"),
            history: vec![Message::customer(latest)],
            latest: latest.to_string(),
        }
    }

    fn pool_with(provider: ScriptedProvider) -> ResponderPool {
        ResponderPool::standard(
            Arc::new(provider),
            Arc::new(ConnectionBroker::new()),
            4,
            1.0,
        )
    }

    #[test]
    fn classify_intent_scores_keywords() {
        let (target, score) = classify_intent("My laptop won't boot").unwrap();
        assert_eq!(target, TransferTarget::Responder(ResponderKind::Technical));
        assert!(score >= 1.0);

        let (target, _) = classify_intent("I was overcharged on my invoice").unwrap();
        assert_eq!(target, TransferTarget::Responder(ResponderKind::Billing));

        let (target, _) = classify_intent("I want to speak to someone, a real person").unwrap();
        assert_eq!(target, TransferTarget::Human);

        // Nothing matched.
        assert!(classify_intent("hello there").is_none());
        // Ambiguous tie stays unresolved.
        assert!(classify_intent("charge upgrade").is_none());
    }

    #[tokio::test]
    async fn triage_routes_confident_intent() {
        let provider = ScriptedProvider::new().with_reply("Happy to help with that!");
        let pool = pool_with(provider);
        let triage = pool.get(ResponderKind::Triage).unwrap();

        let outcome = triage.handle(&ctx("My laptop won't boot")).await;
        match outcome {
            Outcome::Transfer(request) => {
                assert_eq!(
                    request.target,
                    TransferTarget::Responder(ResponderKind::Technical)
                );
                assert!(request.reason.unwrap().contains("intent classification"));
            }
            Outcome::Reply(text) => panic!("expected transfer, got reply: {text}"),
        }
    }

    #[tokio::test]
    async fn triage_asks_when_unsure() {
        let provider = ScriptedProvider::new().with_reply("Could you tell me more?");
        let pool = pool_with(provider);
        let triage = pool.get(ResponderKind::Triage).unwrap();

        let outcome = triage.handle(&ctx("hi, I need some help")).await;
        match outcome {
            Outcome::Reply(text) => assert_eq!(text, "Could you tell me more?"),
            Outcome::Transfer(req) => panic!("expected clarifying reply, got {:?}", req.target),
        }
    }

    #[tokio::test]
    async fn transfer_tool_call_is_intercepted() {
        let provider = ScriptedProvider::new().with_tool_call(
            "escalate_to_human",
            json!({"reason": "customer demanded a manager"}),
        );
        let pool = pool_with(provider);
        let technical = pool.get(ResponderKind::Technical).unwrap();

        let outcome = technical.handle(&ctx("get me your manager")).await;
        match outcome {
            Outcome::Transfer(request) => {
                assert_eq!(request.target, TransferTarget::Human);
                assert_eq!(
                    request.reason.as_deref(),
                    Some("customer demanded a manager")
                );
                assert!(!request.snapshot.is_empty());
            }
            Outcome::Reply(text) => panic!("expected transfer, got reply: {text}"),
        }
    }

    #[tokio::test]
    async fn tool_results_fold_into_conversation() {
        let provider = ScriptedProvider::new()
            .with_tool_call("check_status", json!({"service": "vpn"}))
            .with_reply("The VPN service is operational; try reconnecting.");
        let pool = pool_with(provider);
        let technical = pool.get(ResponderKind::Technical).unwrap();

        let outcome = technical.handle(&ctx("is the vpn down?")).await;
        match outcome {
            Outcome::Reply(text) => {
                assert_eq!(text, "The VPN service is operational; try reconnecting.")
            }
            Outcome::Transfer(req) => panic!("expected reply, got {:?}", req.target),
        }
    }

    #[tokio::test]
    async fn inference_retries_once_then_replies() {
        let provider = ScriptedProvider::new()
            .with_failure("timeout")
            .with_reply("Back online, how can I help?");
        let pool = pool_with(provider);
        let sales = pool.get(ResponderKind::Sales).unwrap();

        let outcome = sales.handle(&ctx("tell me about your product")).await;
        match outcome {
            Outcome::Reply(text) => assert_eq!(text, "Back online, how can I help?"),
            Outcome::Transfer(req) => panic!("expected reply, got {:?}", req.target),
        }
    }

    #[tokio::test]
    async fn inference_double_failure_falls_back_to_apology() {
        let provider = ScriptedProvider::new()
            .with_failure("timeout")
            .with_failure("timeout again");
        let pool = pool_with(provider);
        let billing = pool.get(ResponderKind::Billing).unwrap();

        let outcome = billing.handle(&ctx("refund please")).await;
        match outcome {
            Outcome::Reply(text) => assert_eq!(text, APOLOGY_REPLY),
            Outcome::Transfer(req) => panic!("expected apology, got {:?}", req.target),
        }
    }

    #[tokio::test]
    async fn system_prompt_lists_tools_and_targets() {
        let pool = pool_with(ScriptedProvider::new());
        let triage = pool.get(ResponderKind::Triage).unwrap();
        let prompt = triage.system_prompt();
        assert!(prompt.contains("triage"));
        assert!(prompt.contains("lookup_account"));
        assert!(prompt.contains("escalate_to_human"));
    }

    #[tokio::test]
    async fn human_relay_reports_missing_operator() {
        let broker = Arc::new(ConnectionBroker::new());
        let relay = HumanRelay::new(broker);
        let err = relay
            .deliver(
                &OperatorId::from("op-gone"),
                &SessionId::from("s-1"),
                "hello?",
            )
            .unwrap_err();
        assert!(matches!(err, HelplineError::NotConnected { .. }));
    }
}
