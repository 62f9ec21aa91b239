//! Edge Types - Connections between executors in the workflow graph.
//!
//! ```text
//! 1. Direct        A ───────────────────▶ B
//! 2. Conditional   A ─── if(cond) ──────▶ B
//! 3. Switch-Case   A ─── match ────┬────▶ B (case 1)
//!                                  ├────▶ C (case 2)
//!                                  └────▶ D (default)
//! 4. Fan-Out       A ──────────────┬────▶ B
//!                                  ├────▶ C (same superstep)
//!                                  └────▶ D
//! 5. Fan-In        A ───┐
//!                  B ───┼──────────────▶ D (join, fires once all arrived)
//!                  C ───┘
//! 6. Loop          B ─── back edge ─────▶ A
//! ```
//!
//! Edges are grouped: every routing decision is made by one [`EdgeGroup`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::message::Payload;
use crate::types::ExecutorId;

// ============================================================================
// EDGE KIND
// ============================================================================

/// The kind of a single edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Direct,
    Conditional,
    FanOutMember,
    FanInMember,
    SwitchCase,
    DefaultCase,
    Loop,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Direct => "direct",
            EdgeKind::Conditional => "conditional",
            EdgeKind::FanOutMember => "fan_out_member",
            EdgeKind::FanInMember => "fan_in_member",
            EdgeKind::SwitchCase => "switch_case",
            EdgeKind::DefaultCase => "default_case",
            EdgeKind::Loop => "loop",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// EDGE CONDITION
// ============================================================================

/// A pure predicate over an outgoing payload.
pub type ConditionFn = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// Picks the fan-out targets a payload should reach.
pub type SelectionFn = Arc<dyn Fn(&Payload, &[ExecutorId]) -> Vec<ExecutorId> + Send + Sync>;

/// Condition attached to a conditional, switch-case or loop edge.
#[derive(Clone)]
pub struct EdgeCondition {
    name: Option<String>,
    predicate: ConditionFn,
}

impl EdgeCondition {
    /// Condition over the raw payload.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        Self {
            name: None,
            predicate: Arc::new(predicate),
        }
    }

    /// Condition over a typed message. Payloads of any other type never match.
    pub fn when<T, F>(predicate: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(move |payload: &Payload| {
            payload
                .decode::<T>()
                .map(|value| predicate(&value))
                .unwrap_or(false)
        })
    }

    /// Matches every payload of type `T`.
    pub fn is_type<T: 'static>() -> Self {
        Self::new(|payload: &Payload| payload.is::<T>())
    }

    /// Label shown in visualizations.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn evaluate(&self, payload: &Payload) -> bool {
        (self.predicate)(payload)
    }
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// EDGE
// ============================================================================

/// A single `(source, target, kind, condition?)` edge.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: ExecutorId,
    pub target: ExecutorId,
    pub kind: EdgeKind,
    pub condition: Option<EdgeCondition>,
}

impl Edge {
    pub fn direct(source: impl Into<ExecutorId>, target: impl Into<ExecutorId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Direct,
            condition: None,
        }
    }

    pub fn conditional(
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Conditional,
            condition: Some(condition),
        }
    }

    pub fn looping(
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        condition: Option<EdgeCondition>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Loop,
            condition,
        }
    }

    /// `source→target`.
    pub fn id(&self) -> String {
        format!("{}→{}", self.source, self.target)
    }

    /// Whether a payload may travel along this edge.
    pub fn should_activate(&self, payload: &Payload) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition.evaluate(payload))
    }
}

// ============================================================================
// SWITCH CASES
// ============================================================================

/// One arm of a switch-case group.
#[derive(Debug, Clone)]
pub enum Case {
    /// Fires when the condition holds and no earlier case fired.
    Match {
        condition: EdgeCondition,
        target: ExecutorId,
    },
    /// Fires when no case matched.
    Default { target: ExecutorId },
}

impl Case {
    pub fn when(condition: EdgeCondition, target: impl Into<ExecutorId>) -> Self {
        Case::Match {
            condition,
            target: target.into(),
        }
    }

    pub fn fallback(target: impl Into<ExecutorId>) -> Self {
        Case::Default {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &ExecutorId {
        match self {
            Case::Match { target, .. } | Case::Default { target } => target,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Case::Default { .. })
    }
}

// ============================================================================
// EDGE GROUP
// ============================================================================

/// A unit of routing: one decision per outgoing message.
#[derive(Clone)]
pub enum EdgeGroup {
    /// Direct, conditional or loop edge.
    Single(Edge),
    /// Broadcast to every target, or to the subset a selection picks.
    FanOut {
        source: ExecutorId,
        targets: Vec<ExecutorId>,
        selection: Option<SelectionFn>,
    },
    /// Join: buffers one payload per source, fires once all have arrived.
    FanIn {
        sources: Vec<ExecutorId>,
        target: ExecutorId,
    },
    /// First matching case wins, otherwise the default.
    SwitchCase { source: ExecutorId, cases: Vec<Case> },
}

impl EdgeGroup {
    /// Stable identifier, also used to key fan-in buffers in checkpoints.
    pub fn id(&self) -> String {
        match self {
            EdgeGroup::Single(edge) => edge.id(),
            EdgeGroup::FanOut {
                source, targets, ..
            } => format!("fan_out:{}→[{}]", source, join_ids(targets)),
            EdgeGroup::FanIn { sources, target } => {
                format!("fan_in:[{}]→{}", join_ids(sources), target)
            }
            EdgeGroup::SwitchCase { source, cases } => {
                let targets: Vec<ExecutorId> = cases.iter().map(|c| c.target().clone()).collect();
                format!("switch:{}→[{}]", source, join_ids(&targets))
            }
        }
    }

    pub fn sources(&self) -> Vec<&ExecutorId> {
        match self {
            EdgeGroup::Single(edge) => vec![&edge.source],
            EdgeGroup::FanOut { source, .. } | EdgeGroup::SwitchCase { source, .. } => {
                vec![source]
            }
            EdgeGroup::FanIn { sources, .. } => sources.iter().collect(),
        }
    }

    pub fn targets(&self) -> Vec<&ExecutorId> {
        match self {
            EdgeGroup::Single(edge) => vec![&edge.target],
            EdgeGroup::FanOut { targets, .. } => targets.iter().collect(),
            EdgeGroup::FanIn { target, .. } => vec![target],
            EdgeGroup::SwitchCase { cases, .. } => cases.iter().map(Case::target).collect(),
        }
    }

    pub fn is_from(&self, executor_id: &ExecutorId) -> bool {
        self.sources().contains(&executor_id)
    }

    pub fn is_to(&self, executor_id: &ExecutorId) -> bool {
        self.targets().contains(&executor_id)
    }

    /// Flatten into individual edges with their kinds.
    pub fn edges(&self) -> Vec<Edge> {
        match self {
            EdgeGroup::Single(edge) => vec![edge.clone()],
            EdgeGroup::FanOut {
                source, targets, ..
            } => targets
                .iter()
                .map(|target| Edge {
                    source: source.clone(),
                    target: target.clone(),
                    kind: EdgeKind::FanOutMember,
                    condition: None,
                })
                .collect(),
            EdgeGroup::FanIn { sources, target } => sources
                .iter()
                .map(|source| Edge {
                    source: source.clone(),
                    target: target.clone(),
                    kind: EdgeKind::FanInMember,
                    condition: None,
                })
                .collect(),
            EdgeGroup::SwitchCase { source, cases } => cases
                .iter()
                .map(|case| match case {
                    Case::Match { condition, target } => Edge {
                        source: source.clone(),
                        target: target.clone(),
                        kind: EdgeKind::SwitchCase,
                        condition: Some(condition.clone()),
                    },
                    Case::Default { target } => Edge {
                        source: source.clone(),
                        target: target.clone(),
                        kind: EdgeKind::DefaultCase,
                        condition: None,
                    },
                })
                .collect(),
        }
    }
}

impl fmt::Debug for EdgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeGroup::Single(edge) => f.debug_tuple("Single").field(edge).finish(),
            EdgeGroup::FanOut {
                source,
                targets,
                selection,
            } => f
                .debug_struct("FanOut")
                .field("source", source)
                .field("targets", targets)
                .field("has_selection", &selection.is_some())
                .finish(),
            EdgeGroup::FanIn { sources, target } => f
                .debug_struct("FanIn")
                .field("sources", sources)
                .field("target", target)
                .finish(),
            EdgeGroup::SwitchCase { source, cases } => f
                .debug_struct("SwitchCase")
                .field("source", source)
                .field("cases", cases)
                .finish(),
        }
    }
}

fn join_ids(ids: &[ExecutorId]) -> String {
    ids.iter()
        .map(ExecutorId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: i64) -> Payload {
        Payload::new(&n).unwrap()
    }

    #[test]
    fn test_direct_edge_always_activates() {
        let edge = Edge::direct("a", "b");
        assert_eq!(edge.kind, EdgeKind::Direct);
        assert_eq!(edge.id(), "a→b");
        assert!(edge.should_activate(&payload(1)));
    }

    #[test]
    fn test_conditional_edge() {
        let edge = Edge::conditional("a", "b", EdgeCondition::when(|n: &i64| *n > 10));
        assert!(edge.should_activate(&payload(11)));
        assert!(!edge.should_activate(&payload(3)));
    }

    #[test]
    fn test_typed_condition_rejects_other_types() {
        let condition = EdgeCondition::when(|_: &i64| true);
        let text = Payload::new(&"hello".to_string()).unwrap();
        assert!(!condition.evaluate(&text));
        assert!(EdgeCondition::is_type::<String>().evaluate(&text));
    }

    #[test]
    fn test_condition_name() {
        let condition = EdgeCondition::when(|n: &i64| *n > 0).named("positive");
        assert_eq!(condition.name(), Some("positive"));
    }

    #[test]
    fn test_switch_group_flattening() {
        let group = EdgeGroup::SwitchCase {
            source: ExecutorId::new("router"),
            cases: vec![
                Case::when(EdgeCondition::when(|n: &i64| *n < 0), "neg"),
                Case::fallback("other"),
            ],
        };
        let edges = group.edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].kind, EdgeKind::SwitchCase);
        assert_eq!(edges[1].kind, EdgeKind::DefaultCase);
        assert!(group.is_from(&ExecutorId::new("router")));
        assert!(group.is_to(&ExecutorId::new("other")));
        assert_eq!(group.id(), "switch:router→[neg,other]");
    }

    #[test]
    fn test_fan_in_group() {
        let group = EdgeGroup::FanIn {
            sources: vec![ExecutorId::new("a"), ExecutorId::new("b")],
            target: ExecutorId::new("join"),
        };
        assert_eq!(group.sources().len(), 2);
        assert_eq!(group.targets(), vec![&ExecutorId::new("join")]);
        assert!(group
            .edges()
            .iter()
            .all(|edge| edge.kind == EdgeKind::FanInMember));
        assert_eq!(group.id(), "fan_in:[a,b]→join");
    }

    #[test]
    fn test_loop_edge() {
        let edge = Edge::looping("check", "work", Some(EdgeCondition::when(|n: &i64| *n < 5)));
        assert_eq!(edge.kind, EdgeKind::Loop);
        assert!(edge.should_activate(&payload(4)));
        assert!(!edge.should_activate(&payload(5)));
    }

    #[test]
    fn test_edge_kind_display() {
        assert_eq!(EdgeKind::FanOutMember.to_string(), "fan_out_member");
        assert_eq!(EdgeKind::DefaultCase.to_string(), "default_case");
    }
}
