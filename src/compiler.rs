// Flattens an editor graph into a Prompt.
//
// Each declared input either follows a link (-> reference) or takes the next positional widget value
// (-> literal). Mismatches in authored graphs are common and harmless, so they are dropped rather than
// reported: a link id missing from the link table, widget slots with no value left, and references to
// nodes that never made it into the prompt.

use std::{borrow::Cow, collections::HashMap};

use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::Value;

use crate::{
    graph::{GraphNode, Link, WorkflowGraph},
    prompt::{InputValue, NodeKind, NodeRef, Prompt, PromptNode},
};

pub fn compile(graph: &WorkflowGraph) -> Prompt {
    let links: HashMap<i64, &Link> = graph.links.iter().map(|l| (l.id, l)).collect();
    let mut prompt = Prompt::new();

    for node in &graph.nodes {
        let inputs = compile_inputs(node, &links);
        debug!(
            "Compiled node {} ({}) with {} inputs",
            node.id,
            node.node_type,
            inputs.len()
        );
        let mut compiled = PromptNode::new(node.node_type.clone());
        *compiled.inputs_mut() = inputs;
        prompt.insert(node.id.clone(), compiled);
    }

    for (node_id, input) in prompt.drop_dangling_references() {
        warn!("Dropped input {node_id}.{input}: its source node is not in the workflow");
    }
    prompt
}

fn compile_inputs(node: &GraphNode, links: &HashMap<i64, &Link>) -> IndexMap<String, InputValue> {
    let widget_values = effective_widget_values(node);
    let mut inputs = IndexMap::new();
    let mut cursor = 0;

    for slot in &node.inputs {
        let Some(name) = slot.name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };

        if let Some(link_id) = slot.link {
            match links.get(&link_id) {
                Some(link) => {
                    let source = NodeRef::new(link.source_node.clone(), link.source_slot);
                    inputs.insert(name.to_owned(), InputValue::Reference(source));
                }
                None => warn!(
                    "Node {} input {:?} points at missing link {}; leaving it unset",
                    node.id, name, link_id
                ),
            }
            continue;
        }

        if slot.is_widget() {
            cursor = take_widget(&mut inputs, name, &widget_values, cursor);
        }
    }

    if cursor < widget_values.len() {
        debug!(
            "Node {} has {} unconsumed widget values",
            node.id,
            widget_values.len() - cursor
        );
    }
    inputs
}

// Writes the widget value at `cursor` (if there is one) and returns the advanced cursor.
fn take_widget(
    inputs: &mut IndexMap<String, InputValue>,
    name: &str,
    widget_values: &[Value],
    cursor: usize,
) -> usize {
    match widget_values.get(cursor) {
        Some(value) => {
            inputs.insert(name.to_owned(), InputValue::Literal(value.clone()));
            cursor + 1
        }
        None => {
            debug!("No widget value left for {name:?}");
            cursor
        }
    }
}

/// The editor saves the sampler's UI-only "control_after_generate" choice ("fixed", "randomize", ...)
/// straight after the seed. It is recognised only by this exact shape: a sampler node, one more
/// widget value than widget inputs, at least two values, and a string in second position.
fn effective_widget_values(node: &GraphNode) -> Cow<'_, [Value]> {
    let values = &node.widget_values;
    if !has_seed_control_value(node) {
        return Cow::Borrowed(values);
    }
    debug!("Skipping control_after_generate value {} on node {}", values[1], node.id);
    let mut trimmed = Vec::with_capacity(values.len() - 1);
    trimmed.push(values[0].clone());
    trimmed.extend_from_slice(&values[2..]);
    Cow::Owned(trimmed)
}

fn has_seed_control_value(node: &GraphNode) -> bool {
    let values = &node.widget_values;
    let widget_inputs = node.inputs.iter().filter(|s| s.is_widget()).count();
    NodeKind::from_class_type(&node.node_type) == Some(NodeKind::Sampler)
        && values.len() == widget_inputs + 1
        && values.len() >= 2
        && values[1].is_string()
}
