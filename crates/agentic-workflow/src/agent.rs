//! Agent collaborator contract.
//!
//! The engine knows nothing about providers. An agent is anything that can
//! take new chat messages plus a conversation thread and eventually return an
//! [`AgentRunResponse`]; [`AgentExecutor`] turns one into a graph node.
//!
//! | Aspect | Agent | Executor |
//! |--------|-------|----------|
//! | Level | conversation | workflow node |
//! | Entry point | `run(messages, thread)` | `handle(message, ctx)` |
//! | State | `AgentThread` | checkpoint hooks |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::context::WorkflowContext;
use crate::executor::{Executor, Handler, HandlerRegistry};
use crate::types::{BuildError, ExecutorError, ExecutorId};

// ============================================================================
// CHAT TYPES
// ============================================================================

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == ChatRole::Assistant
    }
}

/// Conversation history carried between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentThread {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

impl AgentThread {
    pub fn new() -> Self {
        Self {
            id: format!("thread-{}", uuid::Uuid::new_v4()),
            messages: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, ChatMessage::system(prompt));
        self
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for AgentThread {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// AGENT RESPONSE
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDetails {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl UsageDetails {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// Complete result of one agent turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentRunResponse {
    /// Messages produced by this turn.
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl AgentRunResponse {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            usage: None,
            finish_reason: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageDetails) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    /// Content of the last assistant message.
    pub fn text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .map(|m| m.content.as_str())
    }
}

// ============================================================================
// AGENT
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// An awaitable conversational step. Implementations record the turn in
/// `thread`.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        messages: Vec<ChatMessage>,
        thread: &mut AgentThread,
    ) -> Result<AgentRunResponse, AgentError>;
}

/// Message that asks an [`AgentExecutor`] for a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub messages: Vec<ChatMessage>,
}

impl AgentRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(content)])
    }
}

// ============================================================================
// AGENT EXECUTOR
// ============================================================================

/// Runs an agent for each [`AgentRequest`] and sends its [`AgentRunResponse`]
/// downstream. The thread is checkpointed with the run.
pub struct AgentExecutor {
    id: ExecutorId,
    agent: Arc<dyn Agent>,
    thread: AgentThread,
    yield_responses: bool,
}

impl AgentExecutor {
    pub fn new(id: impl Into<ExecutorId>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: id.into(),
            agent,
            thread: AgentThread::new(),
            yield_responses: false,
        }
    }

    pub fn with_thread(mut self, thread: AgentThread) -> Self {
        self.thread = thread;
        self
    }

    /// Also yield every response as a workflow output.
    pub fn with_yield_responses(mut self, enabled: bool) -> Self {
        self.yield_responses = enabled;
        self
    }

    pub fn thread(&self) -> &AgentThread {
        &self.thread
    }
}

impl Executor for AgentExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<AgentRequest>()?.on::<String>()?;
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some(self.agent.name())
    }

    fn on_checkpoint_save(&self) -> Result<Option<serde_json::Value>, ExecutorError> {
        Ok(Some(serde_json::to_value(&self.thread)?))
    }

    fn on_checkpoint_restore(&mut self, state: serde_json::Value) -> Result<(), ExecutorError> {
        self.thread = serde_json::from_value(state)?;
        Ok(())
    }
}

#[async_trait]
impl Handler<AgentRequest> for AgentExecutor {
    async fn handle(&mut self, request: AgentRequest, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        let response = self
            .agent
            .run(request.messages, &mut self.thread)
            .await
            .map_err(|err| ExecutorError::new(self.id.clone(), format!("Agent '{}' failed: {err}", self.agent.name())))?;

        debug!(
            executor_id = %self.id,
            agent = self.agent.name(),
            thread_len = self.thread.len(),
            "Agent turn finished"
        );
        if self.yield_responses {
            ctx.yield_output(&response)?;
        }
        ctx.send_message(&response)
    }
}

#[async_trait]
impl Handler<String> for AgentExecutor {
    async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        Handler::<AgentRequest>::handle(self, AgentRequest::user(text), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::events::WorkflowEvent;

    /// Replies with the upper-cased last user message.
    struct Shouter;

    #[async_trait]
    impl Agent for Shouter {
        fn name(&self) -> &str {
            "shouter"
        }

        async fn run(
            &self,
            messages: Vec<ChatMessage>,
            thread: &mut AgentThread,
        ) -> Result<AgentRunResponse, AgentError> {
            let last = messages
                .last()
                .map(|m| m.content.to_uppercase())
                .ok_or_else(|| AgentError::InvalidInput("no messages".into()))?;
            thread.extend(messages);
            let reply = ChatMessage::assistant(last);
            thread.push(reply.clone());
            Ok(AgentRunResponse::new(vec![reply])
                .with_usage(UsageDetails {
                    input_tokens: 3,
                    output_tokens: 2,
                })
                .with_finish_reason(FinishReason::Stop))
        }
    }

    #[test]
    fn test_chat_types() {
        let thread = AgentThread::new().with_system_prompt("be loud");
        assert_eq!(thread.messages[0].role, ChatRole::System);
        assert!(thread.id.starts_with("thread-"));
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
        assert_eq!(UsageDetails { input_tokens: 4, output_tokens: 6 }.total(), 10);
    }

    #[test]
    fn test_response_text_is_last_assistant_message() {
        let response = AgentRunResponse::new(vec![
            ChatMessage::assistant("first"),
            ChatMessage::user("ignored"),
            ChatMessage::assistant("second"),
        ]);
        assert_eq!(response.text(), Some("second"));
        assert_eq!(AgentRunResponse::default().text(), None);
    }

    #[tokio::test]
    async fn test_agent_executor_in_workflow() {
        let mut workflow = WorkflowBuilder::new("agent")
            .add_executor(AgentExecutor::new("shout", Arc::new(Shouter)).with_yield_responses(true))
            .set_start_executor("shout")
            .build()
            .unwrap();

        let result = workflow.run(&AgentRequest::user("hello")).await.unwrap();
        let responses = result.outputs_as::<AgentRunResponse>();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].text(), Some("HELLO"));
        assert_eq!(responses[0].finish_reason, Some(FinishReason::Stop));

        let plain = workflow.run(&"again".to_string()).await.unwrap();
        assert_eq!(plain.outputs_as::<AgentRunResponse>()[0].text(), Some("AGAIN"));
    }

    #[tokio::test]
    async fn test_agent_failure_is_an_executor_failure() {
        let mut workflow = WorkflowBuilder::new("agent")
            .add_executor(AgentExecutor::new("shout", Arc::new(Shouter)))
            .set_start_executor("shout")
            .build()
            .unwrap();

        let result = workflow.run(&AgentRequest::new(Vec::new())).await.unwrap();
        assert!(result.is_failed());
        assert!(result.events.iter().any(|e| matches!(
            e,
            WorkflowEvent::ExecutorFailed { error, .. } if error.contains("no messages")
        )));
    }

    #[test]
    fn test_thread_checkpoint_hooks() {
        let mut thread = AgentThread::new();
        thread.push(ChatMessage::user("remember me"));
        let executor = AgentExecutor::new("shout", Arc::new(Shouter)).with_thread(thread.clone());

        let saved = executor.on_checkpoint_save().unwrap().unwrap();
        let mut restored = AgentExecutor::new("shout", Arc::new(Shouter));
        restored.on_checkpoint_restore(saved).unwrap();
        assert_eq!(restored.thread(), &thread);
    }
}
