//! Graph rendering for documentation and debugging
//!
//! Two formats are supported:
//! - **Mermaid** - flowcharts for markdown (the default)
//! - **DOT** - Graphviz input
//!
//! Node shapes follow the node kind: steps are rectangles, join barriers are
//! rounded, dispatch nodes are parallelograms and nodes that route on a
//! conditional edge are diamonds. Conditional edges are dashed and labelled.
//! The cycle fallback, if any, is drawn with a thick border.
//!
//! ```rust
//! use flowgraph_core::{MergePolicy, PartialState, StateGraph, StateSchema, END, START};
//! use flowgraph_core::visualization::{visualize, VisualizationOptions};
//!
//! let mut graph = StateGraph::new(StateSchema::new().field("draft", MergePolicy::Overwrite));
//! graph.add_node("draft", ["draft"], |_| Box::pin(async { Ok(PartialState::new()) }));
//! graph.add_edge(START, "draft").add_edge("draft", END);
//! let compiled = graph.compile().unwrap();
//!
//! let mermaid = visualize(compiled.graph(), &VisualizationOptions::mermaid());
//! assert!(mermaid.contains("START --> draft"));
//! ```

use crate::graph::{Edge, Graph, NodeKind, END, START};

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisualizationFormat {
    #[default]
    Mermaid,
    Dot,
}

/// Visualization options
#[derive(Debug, Clone, Default)]
pub struct VisualizationOptions {
    pub format: VisualizationFormat,
    /// Show each node's declared writes under its name
    pub include_details: bool,
    pub title: Option<String>,
}

impl VisualizationOptions {
    pub fn mermaid() -> Self {
        Self::default()
    }

    pub fn dot() -> Self {
        Self {
            format: VisualizationFormat::Dot,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_details(mut self) -> Self {
        self.include_details = true;
        self
    }
}

/// Render a graph in the requested format
pub fn visualize(graph: &Graph, options: &VisualizationOptions) -> String {
    match options.format {
        VisualizationFormat::Mermaid => visualize_mermaid(graph, options),
        VisualizationFormat::Dot => visualize_dot(graph, options),
    }
}

/// Escaped node label, with declared writes on a second line when requested
fn node_label(graph: &Graph, name: &str, options: &VisualizationOptions, escape: fn(&str) -> String, newline: &str) -> String {
    match graph.node(name) {
        Some(node) if options.include_details && !node.writes.is_empty() => {
            let writes: Vec<&str> = node.writes.iter().map(String::as_str).collect();
            format!("{}{newline}writes: {}", escape(name), escape(&writes.join(", ")))
        }
        _ => escape(name),
    }
}

fn is_router(graph: &Graph, name: &str) -> bool {
    graph
        .outgoing(name)
        .iter()
        .any(|edge| matches!(edge, Edge::Conditional { .. }))
}

fn visualize_mermaid(graph: &Graph, options: &VisualizationOptions) -> String {
    let mut output = String::new();
    if let Some(title) = &options.title {
        output.push_str(&format!("---\ntitle: {}\n---\n", escape_mermaid(title)));
    }
    output.push_str("flowchart TD\n");
    output.push_str(&format!("    {}((START))\n", sanitize_id(START)));
    output.push_str(&format!("    {}((END))\n", sanitize_id(END)));

    for (name, node) in &graph.nodes {
        let label = node_label(graph, name, options, escape_mermaid, "<br/>");
        let id = sanitize_id(name);
        let shape = match &node.kind {
            NodeKind::Join(_) => format!("{id}([\"{label}\"])"),
            NodeKind::Dispatch(_) => format!("{id}[/\"{label}\"/]"),
            NodeKind::Step(_) if is_router(graph, name) => format!("{id}{{\"{label}\"}}"),
            NodeKind::Step(_) => format!("{id}[\"{label}\"]"),
        };
        output.push_str(&format!("    {shape}\n"));
    }

    for (from, edges) in &graph.edges {
        for edge in edges {
            match edge {
                Edge::Direct(to) => {
                    output.push_str(&format!("    {} --> {}\n", sanitize_id(from), sanitize_id(to)));
                }
                Edge::Conditional { labels, .. } => {
                    for (label, to) in labels {
                        output.push_str(&format!(
                            "    {} -. {} .-> {}\n",
                            sanitize_id(from),
                            escape_mermaid(label),
                            sanitize_id(to)
                        ));
                    }
                }
            }
        }
    }

    if let Some(fallback) = &graph.cycle_fallback {
        output.push_str(&format!("    style {} stroke-width:3px\n", sanitize_id(fallback)));
    }
    output
}

fn visualize_dot(graph: &Graph, options: &VisualizationOptions) -> String {
    let mut output = String::from("digraph G {\n    rankdir=TB;\n    node [shape=box, style=rounded];\n");
    if let Some(title) = &options.title {
        output.push_str(&format!("    labelloc=\"t\";\n    label=\"{}\";\n", escape_dot(title)));
    }
    output.push_str(&format!("    \"{START}\" [shape=circle, label=\"START\"];\n"));
    output.push_str(&format!("    \"{END}\" [shape=doublecircle, label=\"END\"];\n"));

    for (name, node) in &graph.nodes {
        let shape = match &node.kind {
            NodeKind::Join(_) => "oval",
            NodeKind::Dispatch(_) => "parallelogram",
            NodeKind::Step(_) if is_router(graph, name) => "diamond",
            NodeKind::Step(_) => "box",
        };
        let label = node_label(graph, name, options, escape_dot, "\\n");
        output.push_str(&format!("    \"{}\" [shape={shape}, label=\"{label}\"];\n", escape_dot(name)));
    }

    for (from, edges) in &graph.edges {
        for edge in edges {
            match edge {
                Edge::Direct(to) => {
                    output.push_str(&format!("    \"{}\" -> \"{}\";\n", escape_dot(from), escape_dot(to)));
                }
                Edge::Conditional { labels, .. } => {
                    for (label, to) in labels {
                        output.push_str(&format!(
                            "    \"{}\" -> \"{}\" [label=\"{}\", style=dashed];\n",
                            escape_dot(from),
                            escape_dot(to),
                            escape_dot(label)
                        ));
                    }
                }
            }
        }
    }
    output.push_str("}\n");
    output
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_mermaid(s: &str) -> String {
    s.replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Mermaid ids must be plain identifiers, and lowercase `end` is a keyword
fn sanitize_id(s: &str) -> String {
    match s {
        START => "START".to_string(),
        END => "END".to_string(),
        _ => s.replace(['-', '.', ' '], "_"),
    }
}
