//! WorkflowBuilder - Fluent API for constructing workflow graphs.
//!
//! # Example
//!
//! ```rust,ignore
//! let workflow = WorkflowBuilder::new("text-pipeline")
//!     .add_executor(Upper::new("upper"))
//!     .add_executor(Reverse::new("reverse"))
//!     .add_executor(Lower::new("lower"))
//!     .set_start_executor("upper")
//!     .add_edge("upper", "reverse")
//!     .add_edge("reverse", "lower")
//!     .build()?;
//! ```
//!
//! Registration errors (duplicate handlers, duplicate ids) are recorded as
//! they happen and returned by [`WorkflowBuilder::build`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::checkpoint::CheckpointStorage;
use crate::context::{InMemoryStateBackend, SharedStateBackend};
use crate::edge::{Case, Edge, EdgeCondition, EdgeGroup, EdgeKind};
use crate::executor::{Executor, ExecutorNode, RegisteredExecutor};
use crate::message::Payload;
use crate::sub_workflow::WorkflowExecutor;
use crate::types::{BuildError, ExecutorId, TypeTag, WorkflowId};
use crate::workflow::{Workflow, WorkflowConfig};

// ============================================================================
// NODE SLOTS
// ============================================================================

/// Creates a fresh node instance.
pub(crate) type NodeFactory =
    Arc<dyn Fn() -> Result<Box<dyn ExecutorNode>, BuildError> + Send + Sync>;

/// A live node plus, for factory-registered executors, how to recreate it.
pub(crate) struct NodeSlot {
    pub node: Box<dyn ExecutorNode>,
    pub factory: Option<NodeFactory>,
}

impl NodeSlot {
    /// Replace the node with a fresh instance if a factory exists, otherwise
    /// clear what the node tracks for the previous run.
    pub(crate) fn reset(&mut self) -> Result<(), BuildError> {
        match &self.factory {
            Some(factory) => self.node = factory()?,
            None => self.node.clear_run_state(),
        }
        Ok(())
    }
}

// ============================================================================
// WORKFLOW GRAPH
// ============================================================================

/// What the graph knows about one executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorInfo {
    /// Handled message types, in declaration order.
    pub input_types: Vec<TypeTag>,
    /// Whether a catch-all handler is registered.
    pub accepts_any: bool,
    pub description: Option<String>,
    /// Whether the node wraps a nested workflow.
    pub sub_workflow: bool,
}

/// Immutable topology produced by [`WorkflowBuilder::build`].
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub id: WorkflowId,
    pub name: Option<String>,
    pub start: ExecutorId,
    executors: BTreeMap<ExecutorId, ExecutorInfo>,
    groups: Vec<EdgeGroup>,
    by_source: HashMap<ExecutorId, Vec<usize>>,
}

impl WorkflowGraph {
    fn new(
        id: WorkflowId,
        name: Option<String>,
        start: ExecutorId,
        executors: BTreeMap<ExecutorId, ExecutorInfo>,
        groups: Vec<EdgeGroup>,
    ) -> Self {
        let mut by_source: HashMap<ExecutorId, Vec<usize>> = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for source in group.sources() {
                by_source.entry(source.clone()).or_default().push(index);
            }
        }
        Self {
            id,
            name,
            start,
            executors,
            groups,
            by_source,
        }
    }

    pub fn start_executor(&self) -> &ExecutorId {
        &self.start
    }

    pub fn has_executor(&self, id: &ExecutorId) -> bool {
        self.executors.contains_key(id)
    }

    pub fn executor(&self, id: &ExecutorId) -> Option<&ExecutorInfo> {
        self.executors.get(id)
    }

    /// Executors in id order.
    pub fn executors(&self) -> impl Iterator<Item = (&ExecutorId, &ExecutorInfo)> {
        self.executors.iter()
    }

    /// Edge groups in declaration order.
    pub fn edge_groups(&self) -> &[EdgeGroup] {
        &self.groups
    }

    /// Edge groups a message from `source` is routed through, in declaration order.
    pub fn groups_from(&self, source: &ExecutorId) -> Vec<&EdgeGroup> {
        self.by_source
            .get(source)
            .map(|indices| indices.iter().map(|&i| &self.groups[i]).collect())
            .unwrap_or_default()
    }

    /// Every individual edge.
    pub fn edges(&self) -> Vec<Edge> {
        self.groups.iter().flat_map(EdgeGroup::edges).collect()
    }

    pub fn successors(&self, id: &ExecutorId) -> Vec<&ExecutorId> {
        let mut seen = HashSet::new();
        self.groups_from(id)
            .into_iter()
            .flat_map(EdgeGroup::targets)
            .filter(|target| seen.insert(*target))
            .collect()
    }

    pub fn predecessors(&self, id: &ExecutorId) -> Vec<&ExecutorId> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .filter(|group| group.is_to(id))
            .flat_map(EdgeGroup::sources)
            .filter(|source| seen.insert(*source))
            .collect()
    }

    pub fn is_terminal(&self, id: &ExecutorId) -> bool {
        self.groups_from(id).is_empty()
    }

    /// Whether `id` has a handler for `type_tag`.
    pub fn accepts(&self, id: &ExecutorId, type_tag: &TypeTag) -> bool {
        self.executors
            .get(id)
            .map_or(false, |info| {
                info.accepts_any || info.input_types.contains(type_tag)
            })
    }

    /// Canonical description of the topology, stored in checkpoints.
    pub fn signature(&self) -> String {
        let executors: Vec<&str> = self.executors.keys().map(ExecutorId::as_str).collect();
        let mut groups: Vec<String> = self.groups.iter().map(EdgeGroup::id).collect();
        groups.sort();
        format!(
            "{}|start={}|executors={}|edges={}",
            self.id,
            self.start,
            executors.join(","),
            groups.join(";")
        )
    }
}

// ============================================================================
// WORKFLOW BUILDER
// ============================================================================

/// Builder for constructing workflows with a fluent API.
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: Option<String>,
    start: Option<ExecutorId>,
    nodes: BTreeMap<ExecutorId, NodeSlot>,
    groups: Vec<EdgeGroup>,
    errors: Vec<BuildError>,
    config: WorkflowConfig,
    checkpoint_storage: Option<Arc<dyn CheckpointStorage>>,
    state_backend: Option<Arc<dyn SharedStateBackend>>,
}

impl WorkflowBuilder {
    /// Create a new workflow builder.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: None,
            start: None,
            nodes: BTreeMap::new(),
            groups: Vec::new(),
            errors: Vec::new(),
            config: WorkflowConfig::default(),
            checkpoint_storage: None,
            state_backend: None,
        }
    }

    /// Set a human-readable name for the workflow.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    // ========================================================================
    // EXECUTOR METHODS
    // ========================================================================

    /// Add a shared executor instance. Its state persists across runs.
    pub fn add_executor<E: Executor>(mut self, executor: E) -> Self {
        match RegisteredExecutor::new(executor) {
            Ok(node) => self.insert_node(Box::new(node), None),
            Err(err) => self.errors.push(err),
        }
        self
    }

    /// Add an executor created fresh for every run and every restore.
    pub fn add_executor_factory<E, F>(mut self, id: impl Into<ExecutorId>, make: F) -> Self
    where
        E: Executor,
        F: Fn() -> E + Send + Sync + 'static,
    {
        let expected = id.into();
        let factory_id = expected.clone();
        let factory: NodeFactory = Arc::new(move || {
            let node = RegisteredExecutor::new(make())?;
            if node.id() != &factory_id {
                return Err(BuildError::FactoryMismatch {
                    expected: factory_id.clone(),
                    found: node.id().clone(),
                });
            }
            Ok(Box::new(node) as Box<dyn ExecutorNode>)
        });

        match factory() {
            Ok(node) => self.insert_node(node, Some(factory)),
            Err(err) => self.errors.push(err),
        }
        self
    }

    /// Embed a nested workflow as a single executor.
    pub fn add_workflow_executor(mut self, executor: WorkflowExecutor) -> Self {
        self.insert_node(Box::new(executor), None);
        self
    }

    fn insert_node(&mut self, node: Box<dyn ExecutorNode>, factory: Option<NodeFactory>) {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            self.errors.push(BuildError::DuplicateExecutor(id));
            return;
        }
        self.nodes.insert(id, NodeSlot { node, factory });
    }

    /// Set the executor that receives the run input.
    pub fn set_start_executor(mut self, executor_id: impl Into<ExecutorId>) -> Self {
        let requested = executor_id.into();
        match &self.start {
            Some(existing) if existing != &requested => {
                self.errors.push(BuildError::ConflictingStart {
                    existing: existing.clone(),
                    requested,
                });
            }
            _ => self.start = Some(requested),
        }
        self
    }

    // ========================================================================
    // EDGE METHODS
    // ========================================================================

    /// Add a direct edge between two executors.
    pub fn add_edge(self, source: impl Into<ExecutorId>, target: impl Into<ExecutorId>) -> Self {
        self.add_group(EdgeGroup::Single(Edge::direct(source, target)))
    }

    /// Add an edge that only carries payloads matching `condition`.
    pub fn add_conditional_edge(
        self,
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        condition: EdgeCondition,
    ) -> Self {
        self.add_group(EdgeGroup::Single(Edge::conditional(
            source, target, condition,
        )))
    }

    /// Broadcast every message from `source` to all targets.
    pub fn add_fan_out_edges<I, T>(self, source: impl Into<ExecutorId>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
    {
        self.add_group(EdgeGroup::FanOut {
            source: source.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            selection: None,
        })
    }

    /// Fan-out where `selection` picks the targets for each message.
    pub fn add_fan_out_edges_with_selection<I, T, F>(
        self,
        source: impl Into<ExecutorId>,
        targets: I,
        selection: F,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
        F: Fn(&Payload, &[ExecutorId]) -> Vec<ExecutorId> + Send + Sync + 'static,
    {
        self.add_group(EdgeGroup::FanOut {
            source: source.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            selection: Some(Arc::new(selection)),
        })
    }

    /// Join: `target` fires once every source has delivered.
    pub fn add_fan_in_edges<I, S>(self, sources: I, target: impl Into<ExecutorId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        self.add_group(EdgeGroup::FanIn {
            sources: sources.into_iter().map(Into::into).collect(),
            target: target.into(),
        })
    }

    /// Route each message to the first matching case, else the default.
    pub fn add_switch_case_edge_group(
        self,
        source: impl Into<ExecutorId>,
        cases: Vec<Case>,
    ) -> Self {
        self.add_group(EdgeGroup::SwitchCase {
            source: source.into(),
            cases,
        })
    }

    /// Add a back edge `from → to`. Bound loops with `max_supersteps` or
    /// `max_stall_supersteps`.
    pub fn add_loop(
        self,
        from: impl Into<ExecutorId>,
        to: impl Into<ExecutorId>,
        condition: Option<EdgeCondition>,
    ) -> Self {
        self.add_group(EdgeGroup::Single(Edge::looping(from, to, condition)))
    }

    fn add_group(mut self, group: EdgeGroup) -> Self {
        self.groups.push(group);
        self
    }

    // ========================================================================
    // RUNTIME SETTINGS
    // ========================================================================

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_checkpoint_storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.checkpoint_storage = Some(storage);
        self
    }

    pub fn with_state_backend(mut self, backend: Arc<dyn SharedStateBackend>) -> Self {
        self.state_backend = Some(backend);
        self
    }

    // ========================================================================
    // BUILD & VALIDATION
    // ========================================================================

    /// Non-fatal lint of the topology as declared so far.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();

        if let Err(err) = self.check_structure() {
            report.add_error(err.to_string());
            return report;
        }
        let Some(start) = &self.start else {
            return report;
        };

        let reachable = compute_reachable(start, &self.groups);
        for id in self.nodes.keys() {
            if !reachable.contains(id) {
                report.add_warning(format!("Executor '{id}' is unreachable from start '{start}'"));
            }
        }

        if let Some(cycle) = detect_cycle(self.nodes.keys(), &self.groups) {
            report.add_warning(format!(
                "Cycle without a loop edge: {} (bound it with max_supersteps or declare it with add_loop)",
                cycle
                    .iter()
                    .map(ExecutorId::as_str)
                    .collect::<Vec<_>>()
                    .join(" → ")
            ));
        }

        report
    }

    /// Build the workflow.
    ///
    /// # Errors
    ///
    /// Returns the first registration error, or the first structural problem:
    /// missing or unknown start, unknown edge endpoints, malformed fan-in,
    /// fan-out or switch-case groups, duplicate edges.
    pub fn build(self) -> Result<Workflow, BuildError> {
        if let Some(err) = self.errors.first() {
            return Err(err.clone());
        }
        let start = self.check_structure()?;

        let executors = self
            .nodes
            .iter()
            .map(|(id, slot)| {
                let info = ExecutorInfo {
                    input_types: slot.node.input_types(),
                    accepts_any: slot.node.accepts_any(),
                    description: slot.node.description().map(str::to_string),
                    sub_workflow: slot.node.is_sub_workflow(),
                };
                (id.clone(), info)
            })
            .collect();

        let graph = WorkflowGraph::new(self.id, self.name, start, executors, self.groups);
        let state_backend = self
            .state_backend
            .unwrap_or_else(|| Arc::new(InMemoryStateBackend::new()));

        Ok(Workflow::from_parts(
            graph,
            self.nodes,
            self.config,
            state_backend,
            self.checkpoint_storage,
        ))
    }

    fn check_structure(&self) -> Result<ExecutorId, BuildError> {
        let start = self.start.clone().ok_or(BuildError::MissingStart)?;
        self.require_known(&start, "start executor")?;

        let mut seen_groups = HashSet::new();
        for group in &self.groups {
            let group_id = group.id();
            if !seen_groups.insert(group_id.clone()) {
                return Err(BuildError::DuplicateEdge(group_id));
            }
            for endpoint in group.sources().into_iter().chain(group.targets()) {
                self.require_known(endpoint, &format!("edge '{group_id}'"))?;
            }

            match group {
                EdgeGroup::FanOut {
                    source, targets, ..
                } if targets.is_empty() => {
                    return Err(BuildError::EmptyFanOut {
                        source_id: source.clone(),
                    });
                }
                EdgeGroup::FanIn { sources, target } => self.check_fan_in(sources, target)?,
                EdgeGroup::SwitchCase { source, cases } => {
                    if cases.is_empty() {
                        return Err(BuildError::EmptySwitch {
                            source_id: source.clone(),
                        });
                    }
                    if cases.iter().filter(|case| case.is_default()).count() > 1 {
                        return Err(BuildError::MultipleDefaults {
                            source_id: source.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(start)
    }

    fn check_fan_in(&self, sources: &[ExecutorId], target: &ExecutorId) -> Result<(), BuildError> {
        if sources.is_empty() {
            return Err(BuildError::EmptyFanIn {
                target: target.clone(),
            });
        }
        let mut seen = HashSet::new();
        for source in sources {
            if !seen.insert(source) {
                return Err(BuildError::DuplicateFanInSource {
                    target: target.clone(),
                    source_id: source.clone(),
                });
            }
        }

        // A member must reach the join only through the join.
        for group in &self.groups {
            let conflicting = match group {
                EdgeGroup::Single(edge) => {
                    edge.target == *target && sources.contains(&edge.source)
                }
                EdgeGroup::FanOut {
                    source, targets, ..
                } => targets.contains(target) && sources.contains(source),
                _ => false,
            };
            if conflicting {
                let source_id = group.sources()[0].clone();
                return Err(BuildError::FanInConflict {
                    target: target.clone(),
                    source_id,
                });
            }
        }
        Ok(())
    }

    fn require_known(&self, id: &ExecutorId, context: &str) -> Result<(), BuildError> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(BuildError::UnknownExecutor {
                executor_id: id.clone(),
                context: context.to_string(),
            })
        }
    }
}

/// Compute all executors reachable from a given start point.
fn compute_reachable(start: &ExecutorId, groups: &[EdgeGroup]) -> HashSet<ExecutorId> {
    let mut reachable = HashSet::new();
    let mut queue = vec![start.clone()];

    while let Some(current) = queue.pop() {
        if !reachable.insert(current.clone()) {
            continue;
        }
        for group in groups.iter().filter(|g| g.is_from(&current)) {
            for target in group.targets() {
                if !reachable.contains(target) {
                    queue.push(target.clone());
                }
            }
        }
    }

    reachable
}

// ============================================================================
// VALIDATION HELPERS
// ============================================================================

/// Validation result for workflow graphs.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Problems that make `build()` fail.
    pub errors: Vec<String>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Find a cycle that uses no loop edges. Returns the path if one exists.
fn detect_cycle<'a>(
    executors: impl Iterator<Item = &'a ExecutorId>,
    groups: &[EdgeGroup],
) -> Option<Vec<ExecutorId>> {
    let mut successors: HashMap<ExecutorId, Vec<ExecutorId>> = HashMap::new();
    for edge in groups.iter().flat_map(EdgeGroup::edges) {
        if edge.kind != EdgeKind::Loop {
            successors.entry(edge.source).or_default().push(edge.target);
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for executor_id in executors {
        if detect_cycle_util(
            &successors,
            executor_id,
            &mut visited,
            &mut rec_stack,
            &mut path,
        ) {
            return Some(path);
        }
    }

    None
}

fn detect_cycle_util(
    successors: &HashMap<ExecutorId, Vec<ExecutorId>>,
    node: &ExecutorId,
    visited: &mut HashSet<ExecutorId>,
    rec_stack: &mut HashSet<ExecutorId>,
    path: &mut Vec<ExecutorId>,
) -> bool {
    if rec_stack.contains(node) {
        path.push(node.clone());
        return true;
    }

    if visited.contains(node) {
        return false;
    }

    visited.insert(node.clone());
    rec_stack.insert(node.clone());
    path.push(node.clone());

    if let Some(next) = successors.get(node) {
        for successor in next {
            if detect_cycle_util(successors, successor, visited, rec_stack, path) {
                return true;
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    false
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowContext;
    use crate::executor::{Handler, HandlerRegistry};
    use crate::types::ExecutorError;
    use async_trait::async_trait;

    struct Echo {
        id: ExecutorId,
    }

    impl Echo {
        fn new(id: &str) -> Self {
            Self {
                id: ExecutorId::new(id),
            }
        }
    }

    impl Executor for Echo {
        fn id(&self) -> &ExecutorId {
            &self.id
        }

        fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
            handlers.on::<String>()?.on_batch::<String>()?;
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<String> for Echo {
        async fn handle(
            &mut self,
            message: String,
            ctx: &mut WorkflowContext,
        ) -> Result<(), ExecutorError> {
            ctx.send_message(&message)
        }
    }

    #[async_trait]
    impl Handler<Vec<String>> for Echo {
        async fn handle(
            &mut self,
            messages: Vec<String>,
            ctx: &mut WorkflowContext,
        ) -> Result<(), ExecutorError> {
            ctx.yield_output(&messages.join(","))
        }
    }

    struct Twice {
        id: ExecutorId,
    }

    impl Executor for Twice {
        fn id(&self) -> &ExecutorId {
            &self.id
        }

        fn register(handlers: &mut HandlerRegistry<Self>) -> Result<(), BuildError> {
            handlers.on::<String>()?;
            handlers.on::<String>()?;
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<String> for Twice {
        async fn handle(
            &mut self,
            _message: String,
            _ctx: &mut WorkflowContext,
        ) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn echoes(builder: WorkflowBuilder, ids: &[&str]) -> WorkflowBuilder {
        ids.iter()
            .fold(builder, |builder, id| builder.add_executor(Echo::new(id)))
    }

    #[test]
    fn test_simple_linear_workflow() {
        let workflow = echoes(WorkflowBuilder::new("test-wf"), &["a", "b", "c"])
            .name("Test Workflow")
            .set_start_executor("a")
            .add_edge("a", "b")
            .add_edge("b", "c")
            .build()
            .unwrap();

        let graph = workflow.graph();
        assert_eq!(graph.id.as_str(), "test-wf");
        assert_eq!(graph.name, Some("Test Workflow".to_string()));
        assert_eq!(graph.start_executor().as_str(), "a");
        assert!(graph.is_terminal(&ExecutorId::new("c")));
        assert_eq!(
            graph.successors(&ExecutorId::new("a")),
            vec![&ExecutorId::new("b")]
        );
        assert!(graph.accepts(&ExecutorId::new("b"), &TypeTag::of::<String>()));
        assert!(!graph.accepts(&ExecutorId::new("b"), &TypeTag::of::<u32>()));
    }

    #[test]
    fn test_missing_start() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "b"])
            .add_edge("a", "b")
            .build()
            .err()
            .unwrap();
        assert_eq!(err, BuildError::MissingStart);
    }

    #[test]
    fn test_conflicting_start() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "b"])
            .set_start_executor("a")
            .set_start_executor("b")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::ConflictingStart { .. }));
    }

    #[test]
    fn test_unknown_edge_target() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a"])
            .set_start_executor("a")
            .add_edge("a", "ghost")
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::UnknownExecutor { ref executor_id, .. } if executor_id.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_handler_surfaces_at_build() {
        let err = WorkflowBuilder::new("wf")
            .add_executor(Twice {
                id: ExecutorId::new("twice"),
            })
            .set_start_executor("twice")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::DuplicateHandler { .. }));
    }

    #[test]
    fn test_duplicate_executor() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "a"])
            .set_start_executor("a")
            .build()
            .err()
            .unwrap();
        assert_eq!(err, BuildError::DuplicateExecutor(ExecutorId::new("a")));
    }

    #[test]
    fn test_switch_with_two_defaults_rejected() {
        let err = echoes(WorkflowBuilder::new("wf"), &["router", "x", "y"])
            .set_start_executor("router")
            .add_switch_case_edge_group(
                "router",
                vec![Case::fallback("x"), Case::fallback("y")],
            )
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err,
            BuildError::MultipleDefaults {
                source_id: ExecutorId::new("router")
            }
        );
    }

    #[test]
    fn test_empty_groups_rejected() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "b"])
            .set_start_executor("a")
            .add_fan_in_edges(Vec::<String>::new(), "b")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::EmptyFanIn { .. }));

        let err = echoes(WorkflowBuilder::new("wf"), &["a"])
            .set_start_executor("a")
            .add_switch_case_edge_group("a", vec![])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::EmptySwitch { .. }));
    }

    #[test]
    fn test_fan_in_conflict_with_direct_edge() {
        let err = echoes(WorkflowBuilder::new("wf"), &["split", "a", "b", "join"])
            .set_start_executor("split")
            .add_fan_out_edges("split", ["a", "b"])
            .add_fan_in_edges(["a", "b"], "join")
            .add_edge("a", "join")
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err,
            BuildError::FanInConflict {
                target: ExecutorId::new("join"),
                source_id: ExecutorId::new("a"),
            }
        );
    }

    #[test]
    fn test_duplicate_fan_in_source() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "join"])
            .set_start_executor("a")
            .add_fan_in_edges(["a", "a"], "join")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::DuplicateFanInSource { .. }));
    }

    #[test]
    fn test_duplicate_edge() {
        let err = echoes(WorkflowBuilder::new("wf"), &["a", "b"])
            .set_start_executor("a")
            .add_edge("a", "b")
            .add_edge("a", "b")
            .build()
            .err()
            .unwrap();
        assert_eq!(err, BuildError::DuplicateEdge("a→b".to_string()));
    }

    #[test]
    fn test_validation_warns_on_unreachable_and_cycles() {
        let builder = echoes(WorkflowBuilder::new("wf"), &["a", "b", "c", "orphan"])
            .set_start_executor("a")
            .add_edge("a", "b")
            .add_edge("b", "c")
            .add_edge("c", "a");

        let report = builder.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("orphan")));
        assert!(report.warnings.iter().any(|w| w.contains("Cycle")));
    }

    #[test]
    fn test_loop_edges_are_not_reported_as_cycles() {
        let report = echoes(WorkflowBuilder::new("wf"), &["work", "check"])
            .set_start_executor("work")
            .add_edge("work", "check")
            .add_loop("check", "work", None)
            .validate();
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validate_reports_structural_errors() {
        let report = echoes(WorkflowBuilder::new("wf"), &["a"])
            .set_start_executor("a")
            .add_edge("a", "missing")
            .validate();
        assert!(!report.is_valid());
    }

    #[test]
    fn test_signature_is_order_independent() {
        let one = echoes(WorkflowBuilder::new("wf"), &["a", "b", "c"])
            .set_start_executor("a")
            .add_edge("a", "b")
            .add_edge("a", "c")
            .build()
            .unwrap();
        let two = echoes(WorkflowBuilder::new("wf"), &["c", "b", "a"])
            .set_start_executor("a")
            .add_edge("a", "c")
            .add_edge("a", "b")
            .build()
            .unwrap();
        assert_eq!(one.graph().signature(), two.graph().signature());

        let three = echoes(WorkflowBuilder::new("wf"), &["a", "b", "c"])
            .set_start_executor("a")
            .add_edge("a", "b")
            .add_edge("b", "c")
            .build()
            .unwrap();
        assert_ne!(one.graph().signature(), three.graph().signature());
    }

    #[test]
    fn test_predecessors_through_fan_in() {
        let workflow = echoes(WorkflowBuilder::new("wf"), &["split", "a", "b", "join"])
            .set_start_executor("split")
            .add_fan_out_edges("split", ["a", "b"])
            .add_fan_in_edges(["a", "b"], "join")
            .build()
            .unwrap();
        let graph = workflow.graph();
        assert_eq!(graph.predecessors(&ExecutorId::new("join")).len(), 2);
        assert!(graph.accepts(&ExecutorId::new("join"), &TypeTag::batch_of::<String>()));
    }
}
