//! Flow graph model and execution-order resolution.
//!
//! The graph model is a single linear chain: exactly one node without an
//! inbound edge, at most one outbound edge per node (the last declared edge
//! wins), every node reachable from the start.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowPacketError, Result};

/// One request node of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Unique node id.
    pub id: String,
    /// Fully-qualified request message name.
    pub message_name: String,
    /// Route identifier sent with the request.
    pub route: u32,
    /// Request field dictionary.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
}

/// Resolve the execution order of a node chain.
pub fn resolve_order(nodes: &[FlowNode], edges: &[FlowEdge]) -> Result<Vec<String>> {
    if nodes.is_empty() {
        return Err(FlowPacketError::EmptyFlow);
    }

    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut out_edge: HashMap<&str, &str> = HashMap::new();
    for e in edges {
        out_edge.insert(e.source.as_str(), e.target.as_str());
        *in_degree.entry(e.target.as_str()).or_insert(0) += 1;
    }

    let starts: Vec<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    if starts.is_empty() {
        return Err(FlowPacketError::NoStartNode);
    }
    if starts.len() > 1 {
        return Err(FlowPacketError::MultipleStartNodes(
            starts.into_iter().map(String::from).collect(),
        ));
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut visited = HashSet::new();
    let mut current = Some(starts[0]);
    while let Some(id) = current {
        if !visited.insert(id) {
            return Err(FlowPacketError::CycleDetected(id.to_string()));
        }
        order.push(id.to_string());
        current = out_edge.get(id).copied();
    }

    if order.len() != nodes.len() {
        return Err(FlowPacketError::DisconnectedGraph {
            resolved: order.len(),
            total: nodes.len(),
        });
    }

    Ok(order)
}
