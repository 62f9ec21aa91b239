//! Graphviz export of a built graph.
//!
//! Conditional and switch-case edges are dashed and labelled with their
//! condition name, loop edges are bold, and every fan-in group is drawn
//! through a synthetic join node.

use crate::builder::WorkflowGraph;
use crate::edge::{Case, Edge, EdgeGroup, EdgeKind};
use crate::types::ExecutorId;

/// Renders a [`WorkflowGraph`] as a DOT digraph.
pub struct WorkflowViz<'a> {
    graph: &'a WorkflowGraph,
}

impl<'a> WorkflowViz<'a> {
    pub fn new(graph: &'a WorkflowGraph) -> Self {
        Self { graph }
    }

    pub fn to_dot(&self) -> String {
        let title = self
            .graph
            .name
            .clone()
            .unwrap_or_else(|| self.graph.id.to_string());

        let mut out = String::new();
        out.push_str(&format!("digraph \"{}\" {{\n", escape(&title)));
        out.push_str("  rankdir=TD;\n");
        out.push_str("  node [shape=box, style=rounded];\n\n");

        for (id, info) in self.graph.executors() {
            let mut attrs = Vec::new();
            if *id == self.graph.start {
                attrs.push("style=\"rounded,filled\"".to_string());
                attrs.push("fillcolor=lightgreen".to_string());
            }
            if info.sub_workflow {
                attrs.push("shape=box3d".to_string());
                attrs.push("color=steelblue".to_string());
            }
            if let Some(description) = &info.description {
                attrs.push(format!("tooltip=\"{}\"", escape(description)));
            }
            out.push_str(&format!("  {}{};\n", node(id), attr_list(&attrs)));
        }

        let mut first_edge = true;
        for group in self.graph.edge_groups() {
            if first_edge {
                out.push('\n');
                first_edge = false;
            }
            match group {
                EdgeGroup::FanIn { sources, target } => {
                    let join = format!("fan_in::{}", group.id());
                    out.push_str(&format!(
                        "  \"{}\" [shape=ellipse, style=filled, fillcolor=lightgoldenrod, label=\"fan-in\"];\n",
                        escape(&join)
                    ));
                    for source in sources {
                        out.push_str(&format!("  {} -> \"{}\";\n", node(source), escape(&join)));
                    }
                    out.push_str(&format!("  \"{}\" -> {};\n", escape(&join), node(target)));
                }
                EdgeGroup::SwitchCase { source, cases } => {
                    for case in cases {
                        let label = match case {
                            Case::Match { condition, .. } => {
                                condition.name().unwrap_or("case").to_string()
                            }
                            Case::Default { .. } => "default".to_string(),
                        };
                        out.push_str(&format!(
                            "  {} -> {} [style=dashed, label=\"{}\"];\n",
                            node(source),
                            node(case.target()),
                            escape(&label)
                        ));
                    }
                }
                _ => {
                    for edge in group.edges() {
                        out.push_str(&format!("  {}\n", edge_line(&edge)));
                    }
                }
            }
        }

        out.push_str("}\n");
        out
    }
}

fn edge_line(edge: &Edge) -> String {
    let mut attrs = Vec::new();
    match edge.kind {
        EdgeKind::Conditional => {
            attrs.push("style=dashed".to_string());
            let label = edge
                .condition
                .as_ref()
                .and_then(|c| c.name())
                .unwrap_or("condition");
            attrs.push(format!("label=\"{}\"", escape(label)));
        }
        EdgeKind::Loop => {
            attrs.push("style=bold".to_string());
            let label = edge
                .condition
                .as_ref()
                .and_then(|c| c.name())
                .unwrap_or("loop");
            attrs.push(format!("label=\"{}\"", escape(label)));
        }
        _ => {}
    }
    format!("{} -> {}{};", node(&edge.source), node(&edge.target), attr_list(&attrs))
}

fn node(id: &ExecutorId) -> String {
    format!("\"{}\"", escape(id.as_str()))
}

fn attr_list(attrs: &[String]) -> String {
    if attrs.is_empty() {
        String::new()
    } else {
        format!(" [{}]", attrs.join(", "))
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
