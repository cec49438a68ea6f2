//! Output report generation (spec.md §6): the top-level JSON object
//! written to `-o<outfile>`.

use serde::Serialize;
use serde_json::Value as Json;

use crate::error::CharmError;
use crate::graph::Graph;
use crate::state::FailureKind;
use crate::value::ValueTable;
use crate::witness::Macrostep;

#[derive(Serialize)]
pub struct NodeSummary {
    pub idx: u32,
    pub component: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub transitions: Vec<TransitionGroup>,
}

#[derive(Serialize)]
pub struct TransitionGroup {
    pub print_log: Vec<String>,
    pub dst: Vec<u32>,
}

#[derive(Serialize)]
pub struct Report {
    pub issue: String,
    pub hvm: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<std::collections::HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macrosteps: Option<Vec<Macrostep>>,
}

pub fn issue_tag(kind: &FailureKind) -> String {
    match kind {
        FailureKind::Safety => "Safety violation".to_string(),
        FailureKind::Invariant { pc } => format!("Invariant violation at pc {pc}"),
        FailureKind::Termination => "Non-terminating execution".to_string(),
        FailureKind::Busywait => "Active busy waiting".to_string(),
        FailureKind::Behavior => "Behavior violation".to_string(),
        FailureKind::Race { pc_a, pc_b, .. } => format!("Data race between pc {pc_a} and pc {pc_b}"),
    }
}

pub fn build_success(graph: &Graph, values: &ValueTable, node_count: usize, profile: Vec<u64>, hvm: Json) -> Report {
    let mut nodes = Vec::with_capacity(node_count);
    for id in 0..node_count as u32 {
        let (component, is_final) = graph.with_node(id, |n| (n.component, n.is_final));
        let fwd_edges = graph.fwd_edges(id);
        let mut groups: std::collections::HashMap<Vec<String>, Vec<u32>> = std::collections::HashMap::new();
        for e in fwd_edges {
            let (dst, print_log) = graph.with_edge(e, |edge| (edge.dst, edge.print_log.clone()));
            let symbols: Vec<String> = print_log.iter().map(|h| values.display(*h)).collect();
            groups.entry(symbols).or_default().push(dst);
        }
        let transitions = groups
            .into_iter()
            .map(|(print_log, dst)| TransitionGroup { print_log, dst })
            .collect();
        let kind = if id == 0 {
            "initial"
        } else if is_final {
            "terminal"
        } else {
            "normal"
        };
        nodes.push(NodeSummary { idx: id, component, kind: kind.to_string(), transitions });
    }

    Report {
        issue: "No issues".to_string(),
        hvm,
        symbols: Some(std::collections::HashMap::new()),
        nodes: Some(nodes),
        profile: Some(profile),
        macrosteps: None,
    }
}

pub fn build_failure(issue: String, macrosteps: Vec<Macrostep>, hvm: Json) -> Report {
    Report {
        issue,
        hvm,
        symbols: None,
        nodes: None,
        profile: None,
        macrosteps: Some(macrosteps),
    }
}

pub fn write(path: &str, report: &Report) -> Result<(), CharmError> {
    let text = serde_json::to_string_pretty(report).expect("Report serializes to JSON infallibly");
    std::fs::write(path, text).map_err(|source| CharmError::Output { path: path.to_string(), source })
}
