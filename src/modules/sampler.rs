use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow},
    params::Params,
};

/// Main sampling pass: canvas, latent, steps/cfg holder, KSampler and decode. Always runs.
pub struct Sampler;

impl Module for Sampler {
    fn name(&self) -> &'static str {
        "Sampler"
    }

    fn should_run(&self, _params: &Params) -> bool {
        true
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let sampler_name = params.str_or("sampler_name", "euler_ancestral");
        let scheduler = params.str_or("scheduler", "normal");
        let steps = params.i64_or("steps", 20);
        let model = flow.read(Channel::Model)?;
        let positive = flow.read(Channel::Positive)?;
        let negative = flow.read(Channel::Negative)?;
        let vae = flow.read(Channel::Vae)?;

        // The canvas node flips width/height for landscape and carries the hi-res multiplier along.
        let (canvas, _) = flow.add_node(
            "CanvasCreatorAdvanced",
            inputs! {
                "Width" => params.i64_or("width", 512),
                "Height" => params.i64_or("height", 512),
                "Batch" => params.i64_or("batch_size", 1),
                "Landscape" => params.bool_or("api_image_landscape", false),
                "HiResMultiplier" => params.f64_or("hf_scale", 1.5),
            },
            Some("Create Canvas"),
        )?;

        let latent = match flow.peek(Channel::Latent) {
            Some(latent) => latent,
            None => {
                let (_, latent) = flow.add_node(
                    "EmptyLatentImage",
                    inputs! {
                        "width" => canvas.output(0),
                        "height" => canvas.output(1),
                        "batch_size" => canvas.output(2),
                    },
                    Some("Empty Latent"),
                )?;
                flow.write(Channel::Latent, latent);
                latent
            }
        };

        // Everything downstream that wants steps or cfg points here.
        let (steps_cfg, _) = flow.add_node(
            "StepsAndCfg",
            inputs! {
                "steps" => steps,
                "cfg" => params.f64_or("cfg", 7.0),
            },
            Some("Steps & CFG"),
        )?;
        flow.write(Channel::StepsCfg, steps_cfg.output(0));

        let (_, sampled) = flow.add_node(
            "KSampler",
            inputs! {
                "model" => model,
                "positive" => positive,
                "negative" => negative,
                "latent_image" => latent,
                "seed" => params.value_or("random_seed", (-1i64).into()),
                "steps" => steps_cfg.output(0),
                "cfg" => steps_cfg.output(1),
                "sampler_name" => sampler_name,
                "scheduler" => scheduler,
                "denoise" => params.f64_or("denoise", 1.0),
            },
            Some("KSampler (Main)"),
        )?;
        let (_, pixels) = flow.add_node(
            "VAEDecode",
            inputs! {
                "samples" => sampled,
                "vae" => vae,
            },
            Some("VAE Decode"),
        )?;
        flow.write(Channel::Pixels, pixels);
        debug!("KSampler {}/{}, {} steps", sampler_name, scheduler, steps);
        Ok(())
    }
}
