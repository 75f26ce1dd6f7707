pub mod events;
pub mod graph;
pub mod history;
pub mod request;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A user-authored graph of agent nodes. Only `id`, `node_type` and the edge
/// topology matter for execution; `data` is the editor's opaque config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Flow {
    /// Load a flow from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read flow file: {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let flow: Flow = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse flow YAML: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse flow JSON: {}", path.display()))?
        };
        Ok(flow)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Node {
    pub fn is_agent(&self) -> bool {
        self.node_type.is_agent()
    }
}

/// The agent key without the editor's uniqueness suffix.
///
/// The editor appends `_` plus six lowercase alphanumerics to agent ids
/// (`warren_buffett_x7k2p9`). Ids without that shape are returned as-is; a
/// bare suffix (`_x7k2p9`) leaves an empty key.
pub fn base_agent_key(unique_id: &str) -> &str {
    match unique_id.rsplit_once('_') {
        Some((base, suffix))
            if suffix.len() == 6
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) =>
        {
            base
        }
        _ => unique_id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    Agent,
    DecisionMaker,
    DataSource,
    Output,
    #[serde(other)]
    Other,
}

impl NodeType {
    pub fn is_agent(self) -> bool {
        matches!(self, NodeType::Agent | NodeType::DecisionMaker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            id: id.to_string(),
            node_type,
            position: Position::default(),
            data: serde_json::Value::Null,
        }
    }

    pub fn agent(id: &str) -> Node {
        node(id, NodeType::Agent)
    }

    pub fn edge(source: &str, target: &str) -> Edge {
        Edge {
            id: format!("{source}->{target}"),
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}
