// The editor-side workflow document: nodes, their declared inputs, positional widget values, and the link table.
// This is read once and never mutated; compile() turns it into a Prompt.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Usually an integer in the document, but kept as an opaque string.
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    #[serde(
        default,
        rename = "widgets_values",
        deserialize_with = "widget_values_or_empty"
    )]
    pub widget_values: Vec<Value>,
}

/// A declared input. If `link` is set the value comes from another node;
/// otherwise a `widget` marker means it takes the next positional widget value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub link: Option<i64>,
    /// Present (even as null) means the slot is widget-bound.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub widget: Option<Value>,
}

impl InputSlot {
    pub fn is_widget(&self) -> bool {
        self.widget.is_some()
    }
}

/// One row of the link table. The document stores these as
/// `[link_id, source_node, source_slot, target_node, target_slot, type]`;
/// only the first three positions matter here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct Link {
    pub id: i64,
    pub source_node: String,
    pub source_slot: u32,
}

impl TryFrom<Vec<Value>> for Link {
    type Error = String;

    fn try_from(row: Vec<Value>) -> std::result::Result<Self, Self::Error> {
        if row.len() < 3 {
            return Err(format!("link row has {} fields, need at least 3", row.len()));
        }
        let id = row[0]
            .as_i64()
            .ok_or_else(|| format!("link id {} is not an integer", row[0]))?;
        let source_node = value_as_id(&row[1])
            .ok_or_else(|| format!("link {} has an invalid source node {}", id, row[1]))?;
        let source_slot = row[2]
            .as_u64()
            .and_then(|slot| u32::try_from(slot).ok())
            .ok_or_else(|| format!("link {} has an invalid source slot {}", id, row[2]))?;
        Ok(Link {
            id,
            source_node,
            source_slot,
        })
    }
}

impl From<Link> for Vec<Value> {
    fn from(link: Link) -> Self {
        vec![
            Value::from(link.id),
            Value::from(link.source_node),
            Value::from(link.source_slot),
        ]
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_as_id(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("node id {} is not a number or string", value)))
}

// Some nodes store null, or an object keyed by widget name, instead of a list.
// Neither can be consumed positionally, so both count as "no widget values".
fn widget_values_or_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Value>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => Ok(values),
        _ => Ok(Vec::new()),
    }
}

impl WorkflowGraph {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Reads a workflow document saved by the graph editor.
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowGraph> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let graph = WorkflowGraph::from_json(&text)
        .with_context(|| format!("failed to parse workflow {}", path.display()))?;
    debug!(
        "Loaded workflow {} ({} nodes, {} links)",
        path.display(),
        graph.nodes.len(),
        graph.links.len()
    );
    Ok(graph)
}
