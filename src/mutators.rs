// Typed setters for the well-known node kinds.
//
// All of them are sparse patches: a field left as None keeps whatever the workflow already had.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Result, WorkflowError},
    prompt::{NodeKind, Prompt, PromptNode},
};

/// Which conditioning input of the sampler a piece of prompt text feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Positive,
    Negative,
}

impl Role {
    pub fn input_name(self) -> &'static str {
        match self {
            Role::Positive => "positive",
            Role::Negative => "negative",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.input_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoise: Option<f64>,
}

impl SamplerParams {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentSize {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

impl LatentSize {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A LoRA selection. Strengths left unset keep the node's current (or the server's default) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    pub lora_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength_model: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength_clip: Option<f64>,
}

impl LoraSpec {
    pub fn new(lora_name: impl Into<String>) -> Self {
        Self {
            lora_name: lora_name.into(),
            strength_model: None,
            strength_clip: None,
        }
    }

    pub fn with_strengths(mut self, strength_model: f64, strength_clip: f64) -> Self {
        self.strength_model = Some(strength_model);
        self.strength_clip = Some(strength_clip);
        self
    }

    pub(crate) fn write_to(&self, node: &mut PromptNode) {
        node.set_literal("lora_name", self.lora_name.clone());
        patch(node, "strength_model", self.strength_model);
        patch(node, "strength_clip", self.strength_clip);
    }
}

fn patch<T: Into<Value>>(node: &mut PromptNode, name: &str, value: Option<T>) {
    if let Some(value) = value {
        node.set_literal(name, value);
    }
}

// locate() only returns ids that exist, so the lookup can't miss.
fn located_mut(prompt: &mut Prompt, kind: NodeKind, index: usize) -> Result<(String, &mut PromptNode)> {
    let node_id = prompt.locate_kind(kind, index)?;
    let node = prompt
        .get_mut(&node_id)
        .ok_or_else(|| WorkflowError::UnknownNodeId(node_id.clone()))?;
    Ok((node_id, node))
}

/// Overwrites the `text` of a specific text-encoder node.
pub fn set_clip_text(prompt: &mut Prompt, node_id: &str, text: &str) -> Result<()> {
    let node = prompt.node_of_kind_mut(node_id, NodeKind::TextEncoder)?;
    node.set_literal("text", text);
    debug!("Set text of node {node_id} ({} chars)", text.len());
    Ok(())
}

/// Sets the text feeding a sampler's positive or negative conditioning.
/// The encoder is found by following the sampler's live reference, never by assuming an id.
pub fn set_prompt_text(prompt: &mut Prompt, role: Role, text: &str, sampler_index: usize) -> Result<()> {
    let sampler_id = prompt.locate_kind(NodeKind::Sampler, sampler_index)?;
    let target = prompt
        .get(&sampler_id)
        .and_then(|sampler| sampler.reference(role.input_name()))
        .map(|r| r.node_id.clone())
        .ok_or_else(|| WorkflowError::UnlinkedInput {
            node_id: sampler_id.clone(),
            input: role.input_name().to_owned(),
        })?;
    debug!("Sampler {sampler_id} takes its {role} prompt from node {target}");
    set_clip_text(prompt, &target, text)
}

pub fn set_positive_prompt(prompt: &mut Prompt, text: &str, sampler_index: usize) -> Result<()> {
    set_prompt_text(prompt, Role::Positive, text, sampler_index)
}

pub fn set_negative_prompt(prompt: &mut Prompt, text: &str, sampler_index: usize) -> Result<()> {
    set_prompt_text(prompt, Role::Negative, text, sampler_index)
}

pub fn set_sampler_params(prompt: &mut Prompt, sampler_index: usize, params: &SamplerParams) -> Result<()> {
    let (node_id, node) = located_mut(prompt, NodeKind::Sampler, sampler_index)?;
    patch(node, "seed", params.seed);
    patch(node, "steps", params.steps);
    patch(node, "cfg", params.cfg);
    patch(node, "sampler_name", params.sampler_name.clone());
    patch(node, "scheduler", params.scheduler.clone());
    patch(node, "denoise", params.denoise);
    debug!("Patched sampler {node_id}: {params:?}");
    Ok(())
}

pub fn set_latent_size(prompt: &mut Prompt, latent_index: usize, size: &LatentSize) -> Result<()> {
    let (node_id, node) = located_mut(prompt, NodeKind::EmptyLatent, latent_index)?;
    patch(node, "width", size.width);
    patch(node, "height", size.height);
    patch(node, "batch_size", size.batch_size);
    debug!("Patched latent {node_id}: {size:?}");
    Ok(())
}

pub fn set_checkpoint(prompt: &mut Prompt, checkpoint_index: usize, ckpt_name: &str) -> Result<()> {
    let (node_id, node) = located_mut(prompt, NodeKind::CheckpointLoader, checkpoint_index)?;
    node.set_literal("ckpt_name", ckpt_name);
    debug!("Checkpoint {node_id} now loads {ckpt_name}");
    Ok(())
}

/// Patches an existing LoRA loader in place. Use `lora::splice_lora` to add one.
pub fn set_lora(prompt: &mut Prompt, lora_index: usize, lora: &LoraSpec) -> Result<()> {
    let (node_id, node) = located_mut(prompt, NodeKind::LoraLoader, lora_index)?;
    lora.write_to(node);
    debug!("LoRA loader {node_id} now loads {}", lora.lora_name);
    Ok(())
}

pub fn set_output_prefix(prompt: &mut Prompt, save_index: usize, prefix: &str) -> Result<()> {
    let (node_id, node) = located_mut(prompt, NodeKind::SaveImage, save_index)?;
    node.set_literal("filename_prefix", prefix);
    debug!("Save node {node_id} writes {prefix}*");
    Ok(())
}
