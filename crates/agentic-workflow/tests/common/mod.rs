//! Executors shared by the scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dasein_agentic_workflow::{
    BuildError, Executor, ExecutorError, ExecutorId, Handler, HandlerRegistry, RequestResponse,
    WorkflowContext,
};
use serde::{Deserialize, Serialize};

/// Applies a string function, optionally yielding the result, and forwards it.
pub struct Text {
    id: ExecutorId,
    op: fn(&str) -> String,
    yields: bool,
}

impl Text {
    pub fn new(id: &str, op: fn(&str) -> String) -> Self {
        Self {
            id: ExecutorId::new(id),
            op,
            yields: true,
        }
    }

    pub fn silent(id: &str, op: fn(&str) -> String) -> Self {
        Self {
            yields: false,
            ..Self::new(id, op)
        }
    }
}

impl Executor for Text {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<String>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<String> for Text {
    async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        let out = (self.op)(&text);
        if self.yields {
            ctx.yield_output(&out)?;
        }
        ctx.send_message(&out)
    }
}

/// Completes the run with the text it receives.
pub struct Done {
    id: ExecutorId,
}

impl Done {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Done {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<String>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<String> for Done {
    async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.complete(&text)
    }
}

/// Yields whatever number it receives, tagged with its own id.
pub struct Tap {
    id: ExecutorId,
}

impl Tap {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Tap {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<i64>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<i64> for Tap {
    async fn handle(&mut self, n: i64, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.yield_output(&format!("{}:{n}", self.id))
    }
}

/// Sends its number onward unchanged.
pub struct Relay {
    id: ExecutorId,
}

impl Relay {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Relay {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<i64>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<i64> for Relay {
    async fn handle(&mut self, n: i64, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.send_message(&n)
    }
}

// ============================================================================
// STATEFUL LOOP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub text: String,
    pub round: u32,
}

/// Records every tick it sees. Loops until `rounds`, then sends the history.
pub struct Accumulator {
    id: ExecutorId,
    rounds: u32,
    seen: Vec<String>,
}

impl Accumulator {
    pub fn new(id: &str, rounds: u32) -> Self {
        Self {
            id: ExecutorId::new(id),
            rounds,
            seen: Vec::new(),
        }
    }
}

impl Executor for Accumulator {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<Tick>()?;
        Ok(())
    }

    fn on_checkpoint_save(&self) -> Result<Option<serde_json::Value>, ExecutorError> {
        Ok(Some(serde_json::to_value(&self.seen)?))
    }

    fn on_checkpoint_restore(&mut self, state: serde_json::Value) -> Result<(), ExecutorError> {
        self.seen = serde_json::from_value(state)?;
        Ok(())
    }
}

#[async_trait]
impl Handler<Tick> for Accumulator {
    async fn handle(&mut self, tick: Tick, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        self.seen.push(format!("{}{}", tick.text, tick.round));
        ctx.yield_output(&(self.seen.len() as u64))?;
        if tick.round < self.rounds {
            ctx.send_message(&Tick {
                text: tick.text,
                round: tick.round + 1,
            })
        } else {
            ctx.send_message(&self.seen.join(","))
        }
    }
}

/// Turns the input text into the first tick.
pub struct Seed {
    id: ExecutorId,
}

impl Seed {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Seed {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<String>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<String> for Seed {
    async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.send_message(&Tick { text, round: 0 })
    }
}

/// Passes ticks back to the accumulator.
pub struct Bounce {
    id: ExecutorId,
}

impl Bounce {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Bounce {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers.on::<Tick>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<Tick> for Bounce {
    async fn handle(&mut self, tick: Tick, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.send_message(&tick)
    }
}

// ============================================================================
// HUMAN IN THE LOOP
// ============================================================================

/// Asks whether its input may proceed, then completes with the answer.
pub struct Approver {
    id: ExecutorId,
}

impl Approver {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExecutorId::new(id),
        }
    }
}

impl Executor for Approver {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
        handlers
            .on::<String>()?
            .on::<RequestResponse<String, bool>>()?;
        Ok(())
    }
}

#[async_trait]
impl Handler<String> for Approver {
    async fn handle(&mut self, text: String, ctx: &mut WorkflowContext) -> Result<(), ExecutorError> {
        ctx.request_info::<String, bool>(&text)?;
        Ok(())
    }
}

#[async_trait]
impl Handler<RequestResponse<String, bool>> for Approver {
    async fn handle(
        &mut self,
        response: RequestResponse<String, bool>,
        ctx: &mut WorkflowContext,
    ) -> Result<(), ExecutorError> {
        let verdict = if response.data { "yes" } else { "no" };
        ctx.yield_output(&format!("{}={verdict}", self.id))?;
        ctx.send_message(&format!("{}: {verdict}", response.original_request))
    }
}

pub fn upper(s: &str) -> String {
    s.to_uppercase()
}

pub fn reverse(s: &str) -> String {
    s.chars().rev().collect()
}

pub fn lower(s: &str) -> String {
    s.to_lowercase()
}

pub fn same(s: &str) -> String {
    s.to_string()
}
