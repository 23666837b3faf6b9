//! Inference provider abstraction
//!
//! The language-model call is an external collaborator: the core hands it the
//! conversation plus the advertised tool schemas and gets back text and/or
//! tool calls. Implementations live outside the crate; [`ScriptedProvider`]
//! is the deterministic stand-in used by tests and demos.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::Result;
use crate::items::{Message, ToolCall};
use crate::tool::Tool;

/// Response from one inference call.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl InferenceResponse {
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Trait for inference providers.
///
/// `infer` may fail with [`HelplineError::Inference`]; responders recover by
/// retrying once and then falling back to an apology reply; a provider
/// failure never crashes a session.
///
/// [`HelplineError::Inference`]: crate::error::HelplineError::Inference
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Generate a completion for the conversation, with the given tools
    /// advertised to the model. The system prompt travels separately from
    /// the history; it is per-responder and never stored in a session.
    async fn infer(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Result<InferenceResponse>;
}

/// Scripted provider returning queued responses in order.
///
/// Once the queue is exhausted it returns a fixed default reply, so a script
/// that under-counts turns degrades gracefully instead of hanging a test.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<InferenceResponse>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a plain text reply.
    pub fn with_reply(self, content: impl Into<String>) -> Self {
        self.push(Ok(InferenceResponse::reply(content)))
    }

    /// Queue a single tool call.
    pub fn with_tool_call(self, tool_name: impl Into<String>, arguments: Value) -> Self {
        let call = ToolCall {
            id: format!("call-{}", Uuid::new_v4()),
            name: tool_name.into(),
            arguments,
        };
        self.push(Ok(InferenceResponse::tool_calls(vec![call])))
    }

    /// Queue an inference failure, for exercising the retry/fallback path.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Err(crate::error::HelplineError::Inference {
            message: message.into(),
        }))
    }

    fn push(self, response: Result<InferenceResponse>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn infer(
        &self,
        _system_prompt: &str,
        _messages: Vec<Message>,
        _tools: Vec<Arc<dyn Tool>>,
    ) -> Result<InferenceResponse> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => Ok(InferenceResponse::reply(
                "Thanks for the details. Is there anything else I can help with?",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_provider_returns_in_order() {
        let provider = ScriptedProvider::new()
            .with_reply("First")
            .with_tool_call("lookup_account", serde_json::json!({"query": "order 12"}));

        let first = provider.infer("", vec![], vec![]).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("First"));
        assert!(!first.has_tool_calls());

        let second = provider.infer("", vec![], vec![]).await.unwrap();
        assert!(second.has_tool_calls());
        assert_eq!(second.tool_calls[0].name, "lookup_account");
    }

    #[tokio::test]
    async fn scripted_provider_defaults_when_exhausted() {
        let provider = ScriptedProvider::new();
        let response = provider.infer("", vec![], vec![]).await.unwrap();
        assert!(response.content.is_some());
        assert!(!response.has_tool_calls());
    }

    #[tokio::test]
    async fn scripted_provider_surfaces_failures() {
        let provider = ScriptedProvider::new().with_failure("model timeout");
        let err = provider.infer("", vec![], vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::HelplineError::Inference { .. }
        ));
    }
}
