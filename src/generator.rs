// These types describe one generation request: a workflow plus the overrides to apply to it.
// build_prompt() turns them into a Prompt; generate() also submits it and collects the results.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    client::{extract_images, ComfyClient, ImageRef, WaitOptions},
    compiler::compile,
    error,
    graph::WorkflowGraph,
    lora::apply_lora_sequence,
    mutators::{
        set_checkpoint, set_latent_size, set_lora, set_negative_prompt, set_output_prefix,
        set_positive_prompt, set_sampler_params, LatentSize, LoraSpec, SamplerParams,
    },
    prompt::Prompt,
};

/// Everything is optional; unset fields leave the workflow's own values alone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative: Option<String>,
    #[serde(flatten)]
    pub sampler: SamplerParams,
    #[serde(flatten)]
    pub latent: LatentSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ckpt_name: Option<String>,
    /// Patches the workflow's existing LoRA loader. Ignored when `loras` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraSpec>,
    /// Rebuilds the LoRA chain in this order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loras: Option<Vec<LoraSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_prefix: Option<String>,
}

impl GenerationRequest {
    /// Applies the overrides to the first sampler/latent/checkpoint/save node.
    pub fn apply(&self, prompt: &mut Prompt) -> error::Result<()> {
        if let Some(text) = &self.positive {
            set_positive_prompt(prompt, text, 0)?;
        }
        if let Some(text) = &self.negative {
            set_negative_prompt(prompt, text, 0)?;
        }
        if !self.sampler.is_empty() {
            set_sampler_params(prompt, 0, &self.sampler)?;
        }
        if !self.latent.is_empty() {
            set_latent_size(prompt, 0, &self.latent)?;
        }
        if let Some(ckpt_name) = &self.ckpt_name {
            set_checkpoint(prompt, 0, ckpt_name)?;
        }
        if let Some(loras) = &self.loras {
            let chain = apply_lora_sequence(prompt, loras, 0)?;
            debug!("LoRA chain: {:?}", chain);
        } else if let Some(lora) = &self.lora {
            set_lora(prompt, 0, lora)?;
        }
        if let Some(prefix) = &self.output_prefix {
            set_output_prefix(prompt, 0, prefix)?;
        }
        Ok(())
    }
}

pub fn build_prompt(graph: &WorkflowGraph, request: &GenerationRequest) -> error::Result<Prompt> {
    let mut prompt = compile(graph);
    request.apply(&mut prompt)?;
    Ok(prompt)
}

#[derive(Debug)]
pub struct GenerationOutcome {
    pub prompt_id: String,
    /// Empty when the caller didn't wait.
    pub images: Vec<ImageRef>,
    pub history: Option<Value>,
}

/// Builds the prompt, queues it, and (unless `wait` is None) waits for the produced images.
pub async fn generate(
    client: &ComfyClient,
    graph: &WorkflowGraph,
    request: &GenerationRequest,
    wait: Option<WaitOptions>,
) -> Result<GenerationOutcome> {
    let prompt = build_prompt(graph, request).context("Failed to build prompt")?;
    let prompt_id = client.queue_prompt(&prompt).await.context("Failed to queue prompt")?;

    let Some(wait) = wait else {
        return Ok(GenerationOutcome {
            prompt_id,
            images: Vec::new(),
            history: None,
        });
    };

    let history = client.wait_for_prompt(&prompt_id, wait).await?;
    let images = extract_images(&history, &prompt_id);
    info!("Prompt {} produced {} images", prompt_id, images.len());
    Ok(GenerationOutcome {
        prompt_id,
        images,
        history: Some(history),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::WorkflowError, prompt::NodeRef};
    use serde_json::json;

    fn testgraph() -> WorkflowGraph {
        WorkflowGraph::from_json(include_str!("../testdata/workflow.json")).unwrap()
    }

    #[test_log::test]
    fn test_empty_request_is_plain_compile() {
        let graph = testgraph();
        assert_eq!(build_prompt(&graph, &GenerationRequest::default()).unwrap(), compile(&graph));
    }

    #[test_log::test]
    fn test_full_request() {
        let request = GenerationRequest {
            positive: Some("a lighthouse in fog".to_string()),
            negative: Some("people".to_string()),
            sampler: SamplerParams {
                seed: Some(2784119),
                steps: Some(50),
                ..Default::default()
            },
            latent: LatentSize {
                width: Some(832),
                ..Default::default()
            },
            ckpt_name: Some("other.safetensors".to_string()),
            lora: Some(LoraSpec::new("ignored.safetensors")),
            loras: Some(vec![
                LoraSpec::new("first.safetensors").with_strengths(0.7, 0.7),
                LoraSpec::new("second.safetensors"),
            ]),
            output_prefix: Some("fog".to_string()),
        };
        let prompt = build_prompt(&testgraph(), &request).unwrap();

        assert_eq!(prompt.get("6").unwrap().literal("text"), Some(&json!("a lighthouse in fog")));
        assert_eq!(prompt.get("7").unwrap().literal("text"), Some(&json!("people")));
        let sampler = prompt.get("3").unwrap();
        assert_eq!(sampler.literal("seed"), Some(&json!(2784119)));
        assert_eq!(sampler.literal("cfg"), Some(&json!(8)));
        // The workflow's LoRA node was reused for the first entry; the second was spliced after it.
        assert_eq!(sampler.reference("model"), Some(&NodeRef::new("11", 0)));
        assert_eq!(prompt.get("10").unwrap().literal("lora_name"), Some(&json!("first.safetensors")));
        assert_eq!(prompt.get("11").unwrap().literal("lora_name"), Some(&json!("second.safetensors")));
        assert_eq!(prompt.get("5").unwrap().literal("width"), Some(&json!(832)));
        assert_eq!(prompt.get("5").unwrap().literal("height"), Some(&json!(1024)));
        assert_eq!(prompt.get("4").unwrap().literal("ckpt_name"), Some(&json!("other.safetensors")));
        assert_eq!(prompt.get("9").unwrap().literal("filename_prefix"), Some(&json!("fog")));
    }

    #[test_log::test]
    fn test_single_lora_patches_in_place() {
        let request = GenerationRequest {
            lora: Some(LoraSpec::new("other_style.safetensors")),
            ..Default::default()
        };
        let prompt = build_prompt(&testgraph(), &request).unwrap();
        assert_eq!(prompt.len(), 9);
        let lora = prompt.get("10").unwrap();
        assert_eq!(lora.literal("lora_name"), Some(&json!("other_style.safetensors")));
        assert_eq!(lora.literal("strength_model"), Some(&json!(0.8)));
    }

    #[test]
    fn test_request_errors_surface() {
        let graph: WorkflowGraph = serde_json::from_value(json!({"nodes": [], "links": []})).unwrap();
        let request = GenerationRequest {
            output_prefix: Some("x".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_prompt(&graph, &request),
            Err(WorkflowError::NotFound {
                class_type: "SaveImage".to_string()
            })
        );
    }

    #[test]
    fn test_request_from_toml() {
        let request: GenerationRequest = toml::from_str(
            r#"
            positive = "fox"
            seed = 7
            width = 1024
            [[loras]]
            lora_name = "a.safetensors"
            strength_model = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(request.sampler.seed, Some(7));
        assert_eq!(request.latent.width, Some(1024));
        assert_eq!(request.loras.unwrap()[0].strength_clip, None);
    }
}
