// Batch jobs: one workflow, one request template, many scenes.
//
// Scene i (1-based) gets "{base_prompt}, {text}" as its positive prompt, seed_base + i as its seed,
// and "{output_prefix}_{i:03}" as its output prefix. Images land in output_dir, each with an optional
// caption file, and a JSON manifest records what was produced.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    client::{ComfyClient, ImageRef, WaitOptions},
    generator::{generate, GenerationRequest},
    graph::WorkflowGraph,
    utils,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Falls back to the configured default workflow.
    #[serde(default)]
    pub workflow: Option<String>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub base_prompt: String,
    /// Applied to every scene before the per-scene fields.
    #[serde(default)]
    pub request: GenerationRequest,
    #[serde(default)]
    pub seed_base: Option<u64>,
    pub output_prefix: String,
    #[serde(default = "default_write_captions")]
    pub write_captions: bool,
    #[serde(default = "default_manifest")]
    pub manifest: String,
    pub scenes: Vec<Scene>,
}

fn default_write_captions() -> bool {
    true
}

fn default_manifest() -> String {
    "manifest.json".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedImage {
    pub path: PathBuf,
    pub blake3: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub scene_index: usize,
    pub scene_kind: String,
    pub prompt_id: String,
    pub positive: String,
    pub negative: Option<String>,
    pub images: Vec<SavedImage>,
}

impl BatchJob {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch job {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse batch job {}", path.display()))
    }

    pub fn positive_for(&self, scene: &Scene) -> String {
        [self.base_prompt.trim(), scene.text.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The full request for scene `index` (1-based).
    pub fn scene_request(&self, index: usize, scene: &Scene) -> GenerationRequest {
        let mut request = self.request.clone();
        request.positive = Some(self.positive_for(scene));
        if let Some(seed_base) = self.seed_base {
            // Seeds span the whole u64 range; wrap instead of overflowing.
            request.sampler.seed = Some(seed_base.wrapping_add(index as u64));
        }
        request.output_prefix = Some(format!("{}_{:03}", self.output_prefix, index));
        request
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest)
    }
}

/// Downloads `images` into `dir`. With a caption, also writes `<image>.txt` next to each one.
pub async fn save_images(
    client: &ComfyClient,
    images: &[ImageRef],
    dir: &Path,
    caption: Option<&str>,
) -> Result<Vec<SavedImage>> {
    let downloads = try_join_all(images.iter().map(|image| client.download_image(image))).await?;
    let mut saved = Vec::with_capacity(images.len());
    for (image, data) in images.iter().zip(downloads) {
        let Some(filename) = utils::safe_filename(&image.filename) else {
            bail!("server returned an unusable filename {:?}", image.filename);
        };
        let target = dir.join(filename);
        utils::write_atomic(&target, &data)?;
        if let Some(caption) = caption {
            utils::write_atomic(&target.with_extension("txt"), caption.as_bytes())?;
        }
        saved.push(SavedImage {
            path: target,
            blake3: utils::hash(&data),
        });
    }
    Ok(saved)
}

pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    let text = serde_json::to_string_pretty(entries).context("failed to serialize manifest")?;
    utils::write_atomic(path, text.as_bytes())
}

/// Runs every scene in order. The manifest is rewritten after each scene, so an interrupted
/// run still records what finished.
pub async fn run_batch(
    client: &ComfyClient,
    graph: &WorkflowGraph,
    job: &BatchJob,
    wait: WaitOptions,
) -> Result<Vec<ManifestEntry>> {
    std::fs::create_dir_all(&job.output_dir)
        .with_context(|| format!("failed to create {}", job.output_dir.display()))?;

    let mut manifest = Vec::with_capacity(job.scenes.len());
    for (index, scene) in (1..).zip(&job.scenes) {
        let request = job.scene_request(index, scene);
        let positive = request.positive.clone().unwrap_or_default();
        info!("Scene {}/{} ({}): {}", index, job.scenes.len(), scene.kind, positive);

        let outcome = generate(client, graph, &request, Some(wait))
            .await
            .with_context(|| format!("scene {} failed", index))?;
        if outcome.images.is_empty() {
            bail!("no images returned for scene {}", index);
        }
        let caption = job.write_captions.then_some(positive.as_str());
        let images = save_images(client, &outcome.images, &job.output_dir, caption).await?;

        manifest.push(ManifestEntry {
            scene_index: index,
            scene_kind: scene.kind.clone(),
            prompt_id: outcome.prompt_id,
            positive,
            negative: request.negative.clone(),
            images,
        });
        write_manifest(&job.manifest_path(), &manifest)?;
    }
    info!("Batch finished: {} scenes in {}", manifest.len(), job.output_dir.display());
    Ok(manifest)
}
