use std::{
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::prelude::*;
use log::{debug, error, info};
use serde_json::{Map, Value};

use crate::{
    builder::PipelineBuilder,
    config::read_config,
    generator::{expected_steps, relay_messages, ComfyClient, GenerationEvent},
    params::validate_params,
};

#[macro_use]
mod flow_generator;
mod builder;
mod config;
mod generator;
mod messages;
mod modules;
mod params;
mod utils;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long, short, default_value = "config.toml")]
    pub config_path: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the generation workflow for a params file.
    Build {
        /// JSON params file, or - for stdin.
        params: PathBuf,
    },
    /// Print the ControlNet preprocessor preview workflow, or {} when there's no reference image.
    Preview { params: PathBuf },
    /// Run a params file on the engine and save the result.
    Generate {
        params: PathBuf,
        /// Print relay messages as JSON lines instead of logging progress.
        #[arg(long)]
        json_events: bool,
        /// Run the preprocessor preview instead of a full generation.
        #[arg(long)]
        preview: bool,
    },
    /// List the sampler and scheduler names the engine knows.
    Samplers,
    /// Stop whatever the engine is running.
    Interrupt,
}

fn read_params(path: &Path) -> Result<Map<String, Value>> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read params from stdin")?;
        text
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    match serde_json::from_str::<Value>(&text).with_context(|| format!("failed to parse {}", path.display()))? {
        Value::Object(map) => Ok(map),
        other => bail!("params must be a JSON object, got {}", other),
    }
}

/// Builds stay deterministic; the random seed is chosen here, before the build.
fn fill_seed(raw: &mut Map<String, Value>) {
    if raw.get("random_seed").map_or(true, Value::is_null) {
        let seed = rand::random::<u32>();
        info!("Using random seed {}", seed);
        raw.insert("random_seed".to_string(), seed.into());
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn generate(config: &config::FlowConfig, mut raw: Map<String, Value>, json_events: bool, preview: bool) -> Result<()> {
    let builder = PipelineBuilder::new();
    let (workflow, steps) = if preview {
        let workflow = builder
            .build_preview(&raw)?
            .context("nothing to preview: no controlnet_ref_image_filename")?;
        (workflow, 0)
    } else {
        fill_seed(&mut raw);
        (builder.build(&raw)?, expected_steps(&validate_params(&raw)))
    };

    let client = ComfyClient::new(config.backend.clone());
    let mut events = Box::pin(client.generate(&workflow, steps));
    while let Some(event) = events.next().await {
        if json_events {
            for message in relay_messages(&event) {
                println!("{}", message);
            }
        }
        match event {
            GenerationEvent::Queued(prompt_id) => info!("Queued as {}", prompt_id),
            GenerationEvent::Progress { step, total } => info!("Step {}/{}", step, total),
            GenerationEvent::Preview { kind, image, .. } => debug!("{:?} preview, {} bytes", kind, image.bytes.len()),
            GenerationEvent::Completed(images) => {
                let paths = utils::save_images(&config.output.directory, &images)?;
                for path in paths {
                    info!("Saved {}", path.display());
                    if !json_events {
                        println!("{}", path.display());
                    }
                }
            }
            GenerationEvent::Error(e) => return Err(e.context("generation failed")),
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

    let config = read_config(&args.config_path).context("failed to initialize config")?;
    debug!("Loaded config: {:?}", config);

    match args.command {
        Command::Build { params } => {
            let workflow = PipelineBuilder::new().build(&read_params(&params)?)?;
            print_json(&workflow.to_json())
        }
        Command::Preview { params } => {
            let workflow = PipelineBuilder::new().build_preview(&read_params(&params)?)?;
            print_json(&workflow.map(|w| w.to_json()).unwrap_or_else(|| Value::Object(Map::new())))
        }
        Command::Generate { params, json_events, preview } => {
            generate(&config, read_params(&params)?, json_events, preview).await
        }
        Command::Samplers => {
            let (samplers, schedulers) = ComfyClient::new(config.backend).samplers().await?;
            println!("samplers: {}", samplers.join(", "));
            println!("schedulers: {}", schedulers.join(", "));
            Ok(())
        }
        Command::Interrupt => {
            ComfyClient::new(config.backend).interrupt().await?;
            info!("Interrupted");
            Ok(())
        }
    }
}
