use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};

use comfy_sdk::{
    batch::{self, BatchJob},
    build_prompt, compile,
    config::{self, Config},
    generate, load_workflow, utils, ComfyClient, GenerationRequest, LatentSize, LoraSpec, SamplerParams,
};

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long = "config", short, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    pub config_path: PathBuf,
    /// Server URL; overrides the config file and COMFY_URL.
    #[arg(long, global = true)]
    pub url: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the execution request for a workflow, without any overrides.
    Compile {
        workflow: Option<PathBuf>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Apply overrides to a workflow, run it, and download the images.
    Generate(GenerateArgs),
    /// Run every scene of a batch job file.
    Batch { job: PathBuf },
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long, short)]
    workflow: Option<PathBuf>,
    #[arg(long, short)]
    positive: Option<String>,
    #[arg(long, short)]
    negative: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    cfg: Option<f64>,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(long)]
    scheduler: Option<String>,
    #[arg(long)]
    denoise: Option<f64>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    batch_size: Option<u32>,
    #[arg(long)]
    ckpt: Option<String>,
    /// NAME[:MODEL_STRENGTH[:CLIP_STRENGTH]]; repeat to build a chain.
    #[arg(long = "lora", value_parser = parse_lora)]
    loras: Vec<LoraSpec>,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long, default_value = "generated")]
    output_dir: PathBuf,
    /// Queue the prompt and exit without waiting.
    #[arg(long)]
    no_wait: bool,
    /// Print the prompt instead of submitting it.
    #[arg(long)]
    dry_run: bool,
}

impl GenerateArgs {
    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            positive: self.positive.clone(),
            negative: self.negative.clone(),
            sampler: SamplerParams {
                seed: self.seed,
                steps: self.steps,
                cfg: self.cfg,
                sampler_name: self.sampler.clone(),
                scheduler: self.scheduler.clone(),
                denoise: self.denoise,
            },
            latent: LatentSize {
                width: self.width,
                height: self.height,
                batch_size: self.batch_size,
            },
            ckpt_name: self.ckpt.clone(),
            lora: None,
            loras: (!self.loras.is_empty()).then(|| self.loras.clone()),
            output_prefix: self.prefix.clone(),
        }
    }
}

fn parse_lora(value: &str) -> Result<LoraSpec, String> {
    let mut parts = value.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or("LoRA name is empty")?;
    let mut strength = |what: &str| -> Result<Option<f64>, String> {
        parts
            .next()
            .map(|s| s.parse::<f64>().map_err(|_| format!("{what} strength must be a number, got {s:?}")))
            .transpose()
    };
    let strength_model = strength("model")?;
    // A single strength applies to both.
    let strength_clip = strength("clip")?.or(strength_model);
    Ok(LoraSpec {
        lora_name: name.to_owned(),
        strength_model,
        strength_clip,
    })
}

fn unreachable_hint(config: &Config) -> String {
    format!(
        "is the server running at {}? Start it or set {}",
        config.server.base_url,
        config::URL_ENV_VAR
    )
}

async fn run(args: CommandLineFlags, config: Config) -> Result<()> {
    match args.command {
        Command::Compile { workflow, output } => {
            let workflow = workflow.unwrap_or_else(|| config.default_workflow.clone().into());
            let prompt = compile(&load_workflow(&workflow)?);
            let text = serde_json::to_string_pretty(&prompt).context("failed to serialize prompt")?;
            match output {
                Some(path) => utils::write_atomic(&path, text.as_bytes())?,
                None => println!("{}", text),
            }
        }
        Command::Generate(opts) => {
            let workflow = opts
                .workflow
                .clone()
                .unwrap_or_else(|| config.default_workflow.clone().into());
            let graph = load_workflow(&workflow)?;
            let request = opts.request();
            debug!("Request: {:?}", request);
            if opts.dry_run {
                let prompt = build_prompt(&graph, &request)?;
                println!("{}", serde_json::to_string_pretty(&prompt)?);
                return Ok(());
            }

            let client = ComfyClient::from_config(&config.server)?;
            let wait = (!opts.no_wait).then(|| config.server.wait_options());
            let outcome = generate(&client, &graph, &request, wait)
                .await
                .with_context(|| unreachable_hint(&config))?;
            if opts.no_wait {
                println!("{}", outcome.prompt_id);
                return Ok(());
            }
            anyhow::ensure!(!outcome.images.is_empty(), "No images returned");
            std::fs::create_dir_all(&opts.output_dir)
                .with_context(|| format!("failed to create {}", opts.output_dir.display()))?;
            let saved = batch::save_images(&client, &outcome.images, &opts.output_dir, None).await?;
            for image in saved {
                println!("{}", image.path.display());
            }
        }
        Command::Batch { job } => {
            let job = BatchJob::load(&job)?;
            let workflow = job.workflow.clone().unwrap_or_else(|| config.default_workflow.clone());
            let graph = load_workflow(&workflow)?;
            let client = ComfyClient::from_config(&config.server)?;
            let manifest = batch::run_batch(&client, &graph, &job, config.server.wait_options())
                .await
                .with_context(|| unreachable_hint(&config))?;
            info!("Generated {} scenes", manifest.len());
            println!("{}", job.manifest_path().display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let mut config = Config::load(&args.config_path).context("failed to initialize config")?;
    if let Some(url) = &args.url {
        config.apply_url_override(url);
    }
    debug!("Loaded config: {:?}", config);

    run(args, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lora() {
        assert_eq!(parse_lora("a.safetensors").unwrap(), LoraSpec::new("a.safetensors"));
        assert_eq!(
            parse_lora("a.safetensors:0.7").unwrap(),
            LoraSpec::new("a.safetensors").with_strengths(0.7, 0.7)
        );
        assert_eq!(
            parse_lora("a.safetensors:1:0.5").unwrap(),
            LoraSpec::new("a.safetensors").with_strengths(1.0, 0.5)
        );
        assert!(parse_lora(":1").is_err());
        assert!(parse_lora("a.safetensors:strong").is_err());
    }

    #[test]
    fn test_generate_flags() {
        let args = CommandLineFlags::parse_from([
            "comfy-sdk",
            "generate",
            "--positive",
            "fox",
            "--seed",
            "7",
            "--lora",
            "a.safetensors:0.5",
            "--lora",
            "b.safetensors",
            "--dry-run",
        ]);
        let Command::Generate(opts) = args.command else {
            panic!("expected generate");
        };
        let request = opts.request();
        assert_eq!(request.positive.as_deref(), Some("fox"));
        assert_eq!(request.sampler.seed, Some(7));
        assert!(request.latent.is_empty());
        assert_eq!(request.loras.unwrap().len(), 2);
        assert!(opts.dry_run);
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let args = CommandLineFlags::parse_from(["comfy-sdk", "compile", "--config", "studio.toml"]);
        assert_eq!(args.config_path, PathBuf::from("studio.toml"));
        let args = CommandLineFlags::parse_from(["comfy-sdk", "-c", "studio.toml", "batch", "job.toml"]);
        assert_eq!(args.config_path, PathBuf::from("studio.toml"));
        let args = CommandLineFlags::parse_from(["comfy-sdk", "compile"]);
        assert_eq!(args.config_path, PathBuf::from(config::DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_clap_definition() {
        use clap::CommandFactory;
        CommandLineFlags::command().debug_assert();
    }
}
