use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow},
    params::Params,
};

const TILE_SIZE: i64 = 512;
const TILE_OVERLAP: i64 = 64;

/// Upscale model file name as the engine lists it.
fn upscaler_file(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with(".pth") || lower.ends_with(".safetensors") {
        name.to_owned()
    } else {
        format!("{}.pth", name)
    }
}

/// Second pass: upscale the decoded image, re-sample it at partial denoise, optionally
/// transfer the colors of the first pass back onto the result.
pub struct HiresFix;

impl Module for HiresFix {
    fn name(&self) -> &'static str {
        "HiresFix"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("hf_enable")
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let scale = params.f64_or("hf_scale", 1.5);
        let upscaler = upscaler_file(params.str_or("hf_upscaler", "RealESRGAN_x4.pth"));
        let color_transfer = params.str_or("hf_colortransfer", "none");
        let temporal_size = params.i64_or("hf_temporal_size", 64);
        let temporal_overlap = params.i64_or("hf_temporal_overlap", 8);
        let sampler_name = params
            .str("hf_sampler")
            .unwrap_or_else(|| params.str_or("sampler_name", "euler_ancestral"));
        let scheduler = params
            .str("hf_scheduler")
            .unwrap_or_else(|| params.str_or("scheduler", "normal"));

        let first_pass = flow.read(Channel::Pixels)?;
        let model = flow.read(Channel::Model)?;
        let positive = flow.read(Channel::Positive)?;
        let negative = flow.read(Channel::Negative)?;
        let vae = flow.read(Channel::Vae)?;

        let (_, upscale_model) = flow.add_node(
            "UpscaleModelLoader",
            inputs! { "model_name" => upscaler.as_str() },
            Some("HF: Load Upscaler"),
        )?;
        let (_, upscaled) = flow.add_node(
            "UpscaleImageByModelThenResize",
            inputs! {
                "upscale_model" => upscale_model,
                "image" => first_pass,
                "resize_scale" => scale,
                "resize_method" => "nearest",
            },
            Some("HF: Upscale"),
        )?;
        let (_, latent) = flow.add_node(
            "VAEEncodeTiled",
            inputs! {
                "pixels" => upscaled,
                "vae" => vae,
                "tile_size" => TILE_SIZE,
                "overlap" => TILE_OVERLAP,
                "temporal_size" => temporal_size,
                "temporal_overlap" => temporal_overlap,
            },
            Some("HF: VAE Encode Tiled"),
        )?;
        // Same model and conditioning the first pass sampled with, including merges and LoRAs.
        let (_, sampled) = flow.add_node(
            "KSampler",
            inputs! {
                "model" => model,
                "positive" => positive,
                "negative" => negative,
                "latent_image" => latent,
                "seed" => params.value_or("random_seed", (-1i64).into()),
                "steps" => params.i64_or("hf_steps", 15),
                "cfg" => params.f64_or("hf_cfg", 7.0),
                "sampler_name" => sampler_name,
                "scheduler" => scheduler,
                "denoise" => params.f64_or("hf_denoising_strength", 0.4),
            },
            Some("HF: KSampler"),
        )?;
        let (_, mut pixels) = flow.add_node(
            "VAEDecodeTiled",
            inputs! {
                "samples" => sampled,
                "vae" => vae,
                "tile_size" => TILE_SIZE,
                "overlap" => TILE_OVERLAP,
                "temporal_size" => temporal_size,
                "temporal_overlap" => temporal_overlap,
            },
            Some("HF: VAE Decode Tiled"),
        )?;

        if color_transfer != "none" {
            let (_, corrected) = flow.add_node(
                "ImageColorTransferMira",
                inputs! {
                    "src_image" => pixels,
                    "ref_image" => first_pass,
                    "method" => color_transfer,
                },
                Some(format!("HF: Color Transfer ({})", color_transfer).as_str()),
            )?;
            pixels = corrected;
        }
        flow.write(Channel::Pixels, pixels);
        debug!("Upscaled {}x with {}", scale, upscaler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{build_from, link, lit};
    use serde_json::json;

    #[test]
    fn test_upscaler_file() {
        assert_eq!(upscaler_file("RealESRGAN_x4"), "RealESRGAN_x4.pth");
        assert_eq!(upscaler_file("4x-UltraSharp.PTH"), "4x-UltraSharp.PTH");
        assert_eq!(upscaler_file("foo.safetensors"), "foo.safetensors");
    }

    #[test]
    fn test_disabled_output_reads_main_decode() {
        let workflow = build_from(json!({ "hf_scale": 2.0 }));
        for class_type in ["UpscaleModelLoader", "VAEEncodeTiled", "VAEDecodeTiled", "ImageColorTransferMira"] {
            assert_eq!(workflow.nodes_of_type(class_type).count(), 0, "{}", class_type);
        }
        let (decode_id, _) = workflow.nodes_of_type("VAEDecode").next().unwrap();
        let saver = workflow.node(workflow.output_node().unwrap()).unwrap();
        assert_eq!(link(saver, "images"), Some(decode_id.output(0)));
    }

    #[test]
    fn test_enabled_chain() {
        let workflow = build_from(json!({
            "hf_enable": true,
            "hf_upscaler": "RealESRGAN_x4",
            "hf_steps": 10,
            "hf_sampler": "dpmpp_2m",
            "hf_scheduler": "",
            "scheduler": "karras",
            "hf_colortransfer": "mkl",
            "loras_enabled": true,
            "loras_config": [{ "name": "A", "strength": 0.5 }],
        }));
        let (_, loader) = workflow.nodes_of_type("UpscaleModelLoader").next().unwrap();
        assert_eq!(lit(loader, "model_name"), Some(&json!("RealESRGAN_x4.pth")));

        let samplers: Vec<_> = workflow.nodes_of_type("KSampler").collect();
        assert_eq!(samplers.len(), 2);
        let (main, hires) = (samplers[0].1, samplers[1].1);
        // Same current model and conditioning as the first pass.
        let (lora_id, _) = workflow.nodes_of_type("LoraLoader").next().unwrap();
        assert_eq!(link(hires, "model"), Some(lora_id.output(0)));
        assert_eq!(link(hires, "positive"), link(main, "positive"));
        assert_eq!(link(hires, "negative"), link(main, "negative"));
        assert_eq!(lit(hires, "steps"), Some(&json!(10)));
        assert_eq!(lit(hires, "sampler_name"), Some(&json!("dpmpp_2m")));
        assert_eq!(lit(hires, "scheduler"), Some(&json!("karras")));
        assert_eq!(lit(hires, "denoise"), Some(&json!(0.4)));

        let (decode_id, _) = workflow.nodes_of_type("VAEDecode").next().unwrap();
        let (tiled_id, _) = workflow.nodes_of_type("VAEDecodeTiled").next().unwrap();
        let (transfer_id, transfer) = workflow.nodes_of_type("ImageColorTransferMira").next().unwrap();
        assert_eq!(link(transfer, "src_image"), Some(tiled_id.output(0)));
        assert_eq!(link(transfer, "ref_image"), Some(decode_id.output(0)));
        let saver = workflow.node(workflow.output_node().unwrap()).unwrap();
        assert_eq!(link(saver, "images"), Some(transfer_id.output(0)));
    }

    #[test]
    fn test_no_color_transfer_by_default() {
        let workflow = build_from(json!({ "hf_enable": true }));
        assert_eq!(workflow.nodes_of_type("ImageColorTransferMira").count(), 0);
        let (tiled_id, _) = workflow.nodes_of_type("VAEDecodeTiled").next().unwrap();
        let saver = workflow.node(workflow.output_node().unwrap()).unwrap();
        assert_eq!(link(saver, "images"), Some(tiled_id.output(0)));
    }
}
