// LoRA chain surgery.
//
// A splice inserts a LoraLoader between some model/clip source (the base) and its consumers:
//
//   before:  base --model--> sampler        base --clip--> text encoders
//   after:   base --> lora --model--> sampler      lora --clip--> text encoders
//
// The base is never removed. Only the sampler's model input and text encoders whose clip pointed at
// the base are moved; anything else still reading from the base keeps doing so.

use log::{debug, info, warn};

use crate::{
    error::{Result, WorkflowError},
    mutators::LoraSpec,
    prompt::{NodeKind, NodeRef, Prompt, PromptNode},
};

const MODEL_OUTPUT: u32 = 0;
const CLIP_OUTPUT: u32 = 1;

fn sampler_model_source(prompt: &Prompt, sampler_id: &str) -> Result<String> {
    prompt
        .get(sampler_id)
        .and_then(|sampler| sampler.reference("model"))
        .map(|r| r.node_id.clone())
        .ok_or_else(|| WorkflowError::UnlinkedInput {
            node_id: sampler_id.to_owned(),
            input: "model".to_owned(),
        })
}

/// Inserts a new LoraLoader fed by `base_node_id` (default: the sampler's current model source)
/// and makes it the sampler's model source. Returns the new node's id.
pub fn splice_lora(
    prompt: &mut Prompt,
    lora: &LoraSpec,
    base_node_id: Option<&str>,
    sampler_index: usize,
) -> Result<String> {
    let sampler_id = prompt.locate_kind(NodeKind::Sampler, sampler_index)?;
    let base = match base_node_id {
        Some(id) if prompt.contains(id) => id.to_owned(),
        Some(id) => return Err(WorkflowError::UnknownNodeId(id.to_owned())),
        None => sampler_model_source(prompt, &sampler_id)?,
    };
    if prompt.reaches(&base, &sampler_id) {
        return Err(WorkflowError::WouldCreateCycle {
            node_id: sampler_id,
            base,
        });
    }

    if !prompt.get(&base).and_then(PromptNode::kind).map_or(false, NodeKind::provides_model_and_clip) {
        warn!("LoRA base {base} is not a checkpoint or LoRA loader; assuming model/clip on outputs 0/1");
    }

    let mut node = PromptNode::new(NodeKind::LoraLoader.class_type())
        .with_input("model", NodeRef::new(base.clone(), MODEL_OUTPUT))
        .with_input("clip", NodeRef::new(base.clone(), CLIP_OUTPUT));
    lora.write_to(&mut node);
    let new_id = prompt.add_node(node);

    if let Some(sampler) = prompt.get_mut(&sampler_id) {
        sampler.set_reference("model", NodeRef::new(new_id.clone(), MODEL_OUTPUT));
    }

    let mut retargeted = 0;
    for (node_id, node) in prompt.iter_mut() {
        if !node.kind().map_or(false, NodeKind::consumes_clip) {
            continue;
        }
        let Some(clip) = node.reference("clip").filter(|r| r.node_id == base) else {
            continue;
        };
        let slot = clip.slot;
        node.set_reference("clip", NodeRef::new(new_id.clone(), slot));
        debug!("Moved clip input of {node_id} from {base} to {new_id}");
        retargeted += 1;
    }

    info!(
        "Spliced LoRA {} as node {new_id} after {base} (sampler {sampler_id}, {retargeted} clip consumers)",
        lora.lora_name
    );
    Ok(new_id)
}

/// Applies `loras` as a chain in order: base -> loras[0] -> loras[1] -> ... -> sampler.
///
/// If the sampler already reads from a LoraLoader, the first entry is written onto that node
/// instead of adding a new one. Returns the ids of the chain, first to last.
pub fn apply_lora_sequence(prompt: &mut Prompt, loras: &[LoraSpec], sampler_index: usize) -> Result<Vec<String>> {
    let Some((first, rest)) = loras.split_first() else {
        return Ok(Vec::new());
    };

    let sampler_id = prompt.locate_kind(NodeKind::Sampler, sampler_index)?;
    let base = sampler_model_source(prompt, &sampler_id)?;

    let mut chain = Vec::with_capacity(loras.len());
    let base_is_lora = prompt.get(&base).and_then(PromptNode::kind) == Some(NodeKind::LoraLoader);
    let mut current = if base_is_lora {
        if let Some(node) = prompt.get_mut(&base) {
            first.write_to(node);
        }
        debug!("Reused LoRA loader {base} for {}", first.lora_name);
        base
    } else {
        splice_lora(prompt, first, Some(&base), sampler_index)?
    };
    chain.push(current.clone());

    for lora in rest {
        current = splice_lora(prompt, lora, Some(&current), sampler_index)?;
        chain.push(current.clone());
    }
    Ok(chain)
}
