//! Client-side toolkit for a node-graph image generation server.
//!
//! Load an editor workflow ([`graph`]), flatten it into an execution request ([`compiler`]),
//! rewrite node parameters ([`mutators`], [`lora`]), and run it ([`client`], [`generator`], [`batch`]).

pub mod batch;
pub mod client;
pub mod compiler;
pub mod config;
pub mod error;
pub mod generator;
pub mod graph;
pub mod lora;
pub mod mutators;
pub mod prompt;
pub mod utils;

pub use client::{ComfyClient, ImageRef, PromptTimeout, WaitOptions};
pub use compiler::compile;
pub use error::WorkflowError;
pub use generator::{build_prompt, generate, GenerationOutcome, GenerationRequest};
pub use graph::{load_workflow, WorkflowGraph};
pub use lora::{apply_lora_sequence, splice_lora};
pub use mutators::{LatentSize, LoraSpec, Role, SamplerParams};
pub use prompt::{InputValue, NodeKind, NodeRef, Prompt, PromptNode};
