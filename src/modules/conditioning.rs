// Prompt encoding and image-derived conditioning.

use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow},
    params::Params,
};

/// Encodes the positive and negative prompts. Always runs.
///
/// Only the positive prompt goes through the clip-skip node; the negative prompt is encoded with
/// the untruncated clip channel. Tests pin this down, so changing it is a visible decision.
pub struct Conditioning;

impl Module for Conditioning {
    fn name(&self) -> &'static str {
        "Conditioning"
    }

    fn should_run(&self, _params: &Params) -> bool {
        true
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let clipskip = params.i64_or("clipskip", -2);
        let clip = flow.read(Channel::Clip)?;

        let (_, skipped) = flow.add_node(
            "CLIPSetLastLayer",
            inputs! {
                "clip" => clip,
                "stop_at_clip_layer" => clipskip,
            },
            Some(format!("CLIP Skip ({})", clipskip).as_str()),
        )?;
        let (_, positive) = flow.add_node(
            "CLIPTextEncode",
            inputs! {
                "text" => params.str_or("positive_prompt", ""),
                "clip" => skipped,
            },
            Some("Positive Prompt"),
        )?;
        let (_, negative) = flow.add_node(
            "CLIPTextEncode",
            inputs! {
                "text" => params.str_or("negative_prompt", ""),
                "clip" => clip,
            },
            Some("Negative Prompt"),
        )?;
        flow.write(Channel::Positive, positive);
        flow.write(Channel::Negative, negative);
        debug!("Encoded prompts with clipskip {}", clipskip);
        Ok(())
    }
}

/// Folds a reference image into the positive conditioning through a CLIP vision encoder,
/// and seeds the latent channel with the same image.
pub struct ClipVision;

impl Module for ClipVision {
    fn name(&self) -> &'static str {
        "ClipVision"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("clipvision_enabled")
            && params.str("clipvision_ref_image_filename").is_some()
            && params.str("clipvision_model_name").is_some()
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let strength = params.f64_or("clipvision_strength", 1.0);
        let positive = flow.read(Channel::Positive)?;
        let vae = flow.read(Channel::Vae)?;

        let (_, image) = flow.add_node(
            "LoadImage",
            inputs! { "image" => params.str_or("clipvision_ref_image_filename", "") },
            Some("CV Load Ref Image"),
        )?;
        let (_, vision_model) = flow.add_node(
            "CLIPVisionLoader",
            inputs! { "clip_name" => params.str_or("clipvision_model_name", "") },
            Some("Load CLIP Vision"),
        )?;
        let (_, encoded) = flow.add_node(
            "CLIPVisionEncode",
            inputs! {
                "clip_vision" => vision_model,
                "image" => image,
                "crop" => "center",
            },
            Some("CLIP Vision Encode"),
        )?;
        let (_, unclip) = flow.add_node(
            "unCLIPConditioning",
            inputs! {
                "conditioning" => positive,
                "clip_vision_output" => encoded,
                "strength" => strength,
                "noise_augmentation" => 0.0,
            },
            Some("unCLIP Conditioning"),
        )?;
        flow.write(Channel::Positive, unclip);

        // The sampler sees a seeded latent and won't create an empty one.
        let (_, latent) = flow.add_node(
            "VAEEncode",
            inputs! {
                "pixels" => image,
                "vae" => vae,
            },
            Some("VAE Encode (CV Ref)"),
        )?;
        flow.write(Channel::Latent, latent);
        debug!("Added CLIP vision at strength {}", strength);
        Ok(())
    }
}
