//! Message routing between supersteps.
//!
//! Resolves each emitted message against the sender's edge groups and the
//! payload type accepted by each candidate target. Fan-in joins are buffered
//! here, one slot per declared source.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::builder::WorkflowGraph;
use crate::edge::{Case, EdgeGroup};
use crate::events::WorkflowEvent;
use crate::message::{Message, Payload};
use crate::types::ExecutorId;

/// Messages queued per target executor.
pub(crate) type Inbox = BTreeMap<ExecutorId, Vec<Message>>;

/// Buffered fan-in inputs: `group id → source → payload`.
pub(crate) type FanInBuffers = BTreeMap<String, BTreeMap<ExecutorId, Payload>>;

#[derive(Debug, Default)]
pub(crate) struct Router {
    buffers: FanInBuffers,
}

impl Router {
    pub(crate) fn with_buffers(buffers: FanInBuffers) -> Self {
        Self { buffers }
    }

    pub(crate) fn buffers(&self) -> &FanInBuffers {
        &self.buffers
    }

    /// Warnings for join groups still holding partial input.
    pub(crate) fn stranded(&self) -> Vec<WorkflowEvent> {
        self.buffers
            .iter()
            .filter_map(|(group_id, buffer)| {
                let first = buffer.keys().next()?;
                let received: Vec<&str> = buffer.keys().map(ExecutorId::as_str).collect();
                let message = format!(
                    "Run ended before fan-in group '{group_id}' filled; inputs from [{}] discarded",
                    received.join(", ")
                );
                warn!(group = %group_id, "{message}");
                Some(warning(first, message))
            })
            .collect()
    }

    /// Route one message into `inbox`. Returns warnings for dropped messages.
    pub(crate) fn route(
        &mut self,
        graph: &WorkflowGraph,
        message: Message,
        inbox: &mut Inbox,
    ) -> Vec<WorkflowEvent> {
        let source = message.source_id.clone();
        let target = message.target_id.clone();
        let tag = message.payload.type_tag.clone();
        let mut warnings = Vec::new();

        let groups = graph.groups_from(&source);
        if groups.is_empty() {
            if let Some(target) = &target {
                warnings.push(warning(
                    &source,
                    format!("'{source}' has no outgoing edges; message to '{target}' dropped"),
                ));
            } else {
                debug!(executor_id = %source, type_tag = %tag, "Message has no outgoing edges");
            }
            return warnings;
        }

        let wanted = |candidate: &ExecutorId| target.as_ref().map_or(true, |t| t == candidate);
        let mut connected = target.is_none();
        let mut candidates = 0usize;
        let mut accepted = 0usize;

        for group in groups {
            match group {
                EdgeGroup::Single(edge) => {
                    if !wanted(&edge.target) {
                        continue;
                    }
                    connected = true;
                    if !edge.should_activate(&message.payload) {
                        continue;
                    }
                    candidates += 1;
                    if graph.accepts(&edge.target, &tag) {
                        accepted += 1;
                        deliver(inbox, &edge.target, &message, message.payload.clone());
                    }
                }
                EdgeGroup::FanOut {
                    targets, selection, ..
                } => {
                    let chosen = match selection {
                        Some(select) => select(&message.payload, targets),
                        None => targets.clone(),
                    };
                    for member in targets.iter().filter(|t| chosen.contains(t)) {
                        if !wanted(member) {
                            continue;
                        }
                        connected = true;
                        candidates += 1;
                        if graph.accepts(member, &tag) {
                            accepted += 1;
                            deliver(inbox, member, &message, message.payload.clone());
                        }
                    }
                    if target.as_ref().map_or(false, |t| targets.contains(t)) {
                        connected = true;
                    }
                }
                EdgeGroup::SwitchCase { cases, .. } => {
                    if let Some(t) = &target {
                        if !cases.iter().any(|case| case.target() == t) {
                            continue;
                        }
                        connected = true;
                    }
                    let Some(case) = select_case(cases, &message.payload) else {
                        warnings.push(warning(
                            &source,
                            format!("No switch case matched '{tag}' from '{source}' and no default is declared"),
                        ));
                        continue;
                    };
                    if let Some(t) = target.as_ref().filter(|t| *t != case.target()) {
                        warnings.push(warning(
                            &source,
                            format!(
                                "Switch case of '{source}' selected '{}', not '{t}'; message dropped",
                                case.target()
                            ),
                        ));
                        continue;
                    }
                    candidates += 1;
                    if graph.accepts(case.target(), &tag) {
                        accepted += 1;
                        deliver(inbox, case.target(), &message, message.payload.clone());
                    }
                }
                EdgeGroup::FanIn {
                    sources,
                    target: join,
                } => {
                    if !wanted(join) {
                        continue;
                    }
                    connected = true;
                    candidates += 1;
                    accepted += 1;
                    let group_id = group.id();
                    let buffer = self.buffers.entry(group_id.clone()).or_default();
                    if buffer.insert(source.clone(), message.payload.clone()).is_some() {
                        debug!(group = %group_id, executor_id = %source, "Fan-in input overwritten");
                    }
                    if sources.iter().all(|s| buffer.contains_key(s)) {
                        let mut buffer = self.buffers.remove(&group_id).unwrap_or_default();
                        let items: Vec<Payload> =
                            sources.iter().filter_map(|s| buffer.remove(s)).collect();
                        let batch = Payload::batch(items);
                        if graph.accepts(join, &batch.type_tag) {
                            debug!(group = %group_id, target = %join, "Fan-in join fired");
                            deliver(inbox, join, &message, batch);
                        } else {
                            warnings.push(warning(
                                &source,
                                format!(
                                    "Fan-in target '{join}' has no handler for '{}'; batch dropped",
                                    batch.type_tag
                                ),
                            ));
                        }
                    }
                }
            }
        }

        if let Some(t) = &target {
            if !connected {
                warnings.push(warning(
                    &source,
                    format!("'{t}' is not connected to '{source}'; message dropped"),
                ));
            }
        }
        if candidates > 0 && accepted == 0 {
            warnings.push(warning(
                &source,
                format!("No target of '{source}' handles '{tag}'; message dropped"),
            ));
        }

        for event in &warnings {
            if let WorkflowEvent::RoutingWarning { message, .. } = event {
                warn!(executor_id = %source, "{message}");
            }
        }
        warnings
    }
}

/// First matching case in declaration order, else the default.
fn select_case<'a>(cases: &'a [Case], payload: &Payload) -> Option<&'a Case> {
    cases
        .iter()
        .find(|case| match case {
            Case::Match { condition, .. } => condition.evaluate(payload),
            Case::Default { .. } => false,
        })
        .or_else(|| cases.iter().find(|case| case.is_default()))
}

fn deliver(inbox: &mut Inbox, target: &ExecutorId, original: &Message, payload: Payload) {
    inbox.entry(target.clone()).or_default().push(Message::new(
        payload,
        original.source_id.clone(),
        original.target_id.clone(),
    ));
}

fn warning(source: &ExecutorId, message: String) -> WorkflowEvent {
    WorkflowEvent::RoutingWarning {
        source_id: source.clone(),
        message,
    }
}

// ============================================================================
// TESTS
// ============================================================================
