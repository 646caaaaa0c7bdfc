//! Node/edge view of the knowledge base (`graph.json`).

use serde::{Deserialize, Serialize};

use novelkb_shared::RelationDirection;

use crate::KnowledgeBase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub mentions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub directed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Evidence count.
    pub weight: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn from_kb(kb: &KnowledgeBase) -> Self {
        let nodes = kb
            .characters
            .iter()
            .map(|c| GraphNode {
                id: c.name.clone(),
                node_type: c.entity_type.clone(),
                mentions: c.mentions.len(),
            })
            .collect();

        let edges = kb
            .relations
            .iter()
            .map(|r| GraphEdge {
                source: r.from.clone(),
                target: r.to.clone(),
                edge_type: r.relation_type.clone(),
                directed: r.direction == RelationDirection::Directed,
                status: r.status.clone(),
                confidence: r.confidence,
                weight: r.evidence.len(),
            })
            .collect();

        Self { nodes, edges }
    }
}
