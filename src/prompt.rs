// The flattened execution request: node id -> {inputs, class_type}.
// This is what the mutators rewrite and what the server's /prompt endpoint accepts.
//
// Node order is insertion order, so "the second KSampler" means the second one compile() emitted.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// Node kinds the mutators know how to handle.
/// Anything else still passes through compile() and serde untouched; it just has no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Sampler,
    TextEncoder,
    EmptyLatent,
    CheckpointLoader,
    LoraLoader,
    SaveImage,
}

impl NodeKind {
    pub const ALL: [NodeKind; 6] = [
        NodeKind::Sampler,
        NodeKind::TextEncoder,
        NodeKind::EmptyLatent,
        NodeKind::CheckpointLoader,
        NodeKind::LoraLoader,
        NodeKind::SaveImage,
    ];

    pub fn class_type(self) -> &'static str {
        match self {
            NodeKind::Sampler => "KSampler",
            NodeKind::TextEncoder => "CLIPTextEncode",
            NodeKind::EmptyLatent => "EmptyLatentImage",
            NodeKind::CheckpointLoader => "CheckpointLoaderSimple",
            NodeKind::LoraLoader => "LoraLoader",
            NodeKind::SaveImage => "SaveImage",
        }
    }

    pub fn from_class_type(class_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.class_type() == class_type)
    }

    /// Reads a `clip` input that a LoRA splice has to retarget.
    pub fn consumes_clip(self) -> bool {
        matches!(self, NodeKind::TextEncoder)
    }

    /// Exposes MODEL on output 0 and CLIP on output 1.
    pub fn provides_model_and_clip(self) -> bool {
        matches!(self, NodeKind::CheckpointLoader | NodeKind::LoraLoader)
    }
}

/// `[source_node_id, output_slot]` in the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub node_id: String,
    pub slot: u32,
}

impl NodeRef {
    pub fn new(node_id: impl Into<String>, slot: u32) -> Self {
        Self {
            node_id: node_id.into(),
            slot,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let [id, slot] = value.as_array()?.as_slice() else {
            return None;
        };
        let node_id = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
            _ => return None,
        };
        let slot = u32::try_from(slot.as_u64()?).ok()?;
        Some(Self { node_id, slot })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Literal(Value),
    Reference(NodeRef),
}

impl InputValue {
    pub fn as_reference(&self) -> Option<&NodeRef> {
        match self {
            InputValue::Reference(r) => Some(r),
            InputValue::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            InputValue::Literal(v) => Some(v),
            InputValue::Reference(_) => None,
        }
    }
}

// A two-element [id, slot] array is always read back as a reference. Literal widget values
// never take that shape in practice.
impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        match NodeRef::from_value(&value) {
            Some(r) => InputValue::Reference(r),
            None => InputValue::Literal(value),
        }
    }
}

impl From<NodeRef> for InputValue {
    fn from(r: NodeRef) -> Self {
        InputValue::Reference(r)
    }
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            InputValue::Literal(v) => v.serialize(serializer),
            InputValue::Reference(r) => (&r.node_id, r.slot).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(InputValue::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptNode {
    #[serde(default)]
    inputs: IndexMap<String, InputValue>,
    // Fixed at construction; mutators only ever touch inputs.
    class_type: String,
}

impl PromptNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            inputs: IndexMap::new(),
            class_type: class_type.into(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn class_type(&self) -> &str {
        &self.class_type
    }

    pub fn kind(&self) -> Option<NodeKind> {
        NodeKind::from_class_type(&self.class_type)
    }

    pub fn inputs(&self) -> &IndexMap<String, InputValue> {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut IndexMap<String, InputValue> {
        &mut self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputValue> {
        self.inputs.get(name)
    }

    pub fn reference(&self, name: &str) -> Option<&NodeRef> {
        self.inputs.get(name).and_then(InputValue::as_reference)
    }

    pub fn literal(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(InputValue::as_literal)
    }

    pub fn set_literal(&mut self, name: &str, value: impl Into<Value>) {
        self.inputs
            .insert(name.to_owned(), InputValue::Literal(value.into()));
    }

    pub fn set_reference(&mut self, name: &str, target: NodeRef) {
        self.inputs
            .insert(name.to_owned(), InputValue::Reference(target));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prompt {
    nodes: IndexMap<String, PromptNode>,
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&PromptNode> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut PromptNode> {
        self.nodes.get_mut(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PromptNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut PromptNode)> {
        self.nodes.iter_mut().map(|(id, node)| (id.as_str(), node))
    }

    pub(crate) fn insert(&mut self, node_id: String, node: PromptNode) {
        self.nodes.insert(node_id, node);
    }

    /// Adds a node under a freshly allocated id and returns that id.
    pub fn add_node(&mut self, node: PromptNode) -> String {
        let node_id = self.next_node_id();
        self.nodes.insert(node_id.clone(), node);
        node_id
    }

    /// Ids of every node with the given class_type, in prompt order.
    pub fn find_by_type(&self, class_type: &str) -> Vec<&str> {
        self.iter()
            .filter(|(_, node)| node.class_type() == class_type)
            .map(|(id, _)| id)
            .collect()
    }

    /// Id of the `index`-th node with the given class_type.
    pub fn locate(&self, class_type: &str, index: usize) -> Result<String> {
        let matches = self.find_by_type(class_type);
        if matches.is_empty() {
            return Err(WorkflowError::NotFound {
                class_type: class_type.to_owned(),
            });
        }
        matches
            .get(index)
            .map(|id| (*id).to_owned())
            .ok_or_else(|| WorkflowError::IndexOutOfRange {
                class_type: class_type.to_owned(),
                index,
                count: matches.len(),
            })
    }

    pub fn locate_kind(&self, kind: NodeKind, index: usize) -> Result<String> {
        self.locate(kind.class_type(), index)
    }

    /// Looks up a caller-supplied id and checks that it is the expected kind of node.
    pub fn node_of_kind_mut(&mut self, node_id: &str, kind: NodeKind) -> Result<&mut PromptNode> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WorkflowError::UnknownNodeId(node_id.to_owned()))?;
        if node.kind() != Some(kind) {
            return Err(WorkflowError::WrongNodeType {
                node_id: node_id.to_owned(),
                expected: kind.class_type().to_owned(),
                actual: node.class_type().to_owned(),
            });
        }
        Ok(node)
    }

    /// Largest all-digit node id with leading zeros stripped, or None if there is none.
    /// Ids are compared as decimal strings, so any length works.
    pub fn max_numeric_id(&self) -> Option<&str> {
        self.nodes
            .keys()
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .map(|id| match id.trim_start_matches('0') {
                "" => "0",
                digits => digits,
            })
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
    }

    pub fn next_node_id(&self) -> String {
        increment_decimal(self.max_numeric_id().unwrap_or("0"))
    }

    /// True if following references from `from` eventually reaches `to`.
    /// A node reaches itself.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                stack.extend(
                    node.inputs
                        .values()
                        .filter_map(InputValue::as_reference)
                        .map(|r| r.node_id.as_str()),
                );
            }
        }
        false
    }

    /// Removes reference inputs whose source node isn't in the prompt.
    /// Returns the dropped (node id, input name) pairs.
    pub(crate) fn drop_dangling_references(&mut self) -> Vec<(String, String)> {
        let known: HashSet<String> = self.nodes.keys().cloned().collect();
        let mut dropped = Vec::new();
        for (node_id, node) in self.nodes.iter_mut() {
            node.inputs.retain(|name, value| match value {
                InputValue::Reference(r) if !known.contains(&r.node_id) => {
                    dropped.push((node_id.clone(), name.clone()));
                    false
                }
                _ => true,
            });
        }
        dropped
    }

    pub fn to_json(&self) -> Value {
        // Serializing string keys and JSON values can't fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// `digits` plus one, for an all-digit string of any length.
fn increment_decimal(digits: &str) -> String {
    let mut out: Vec<char> = digits.chars().collect();
    for c in out.iter_mut().rev() {
        if *c == '9' {
            *c = '0';
        } else {
            *c = char::from(*c as u8 + 1);
            return out.into_iter().collect();
        }
    }
    out.insert(0, '1');
    out.into_iter().collect()
}
