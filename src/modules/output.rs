use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow, OUTPUT_TITLE},
    params::Params,
};

/// The image saver: final pixels plus everything needed to record how they were made. Always runs.
pub struct Output;

impl Module for Output {
    fn name(&self) -> &'static str {
        "Output"
    }

    fn should_run(&self, _params: &Params) -> bool {
        true
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let filename = params.str_or("output_filename_format", "%time_%seed");
        let path = params.str_or("output_path_format", "%date");
        let sampler_name = params
            .str("sampler_name_main_pass_for_saver")
            .unwrap_or_else(|| params.str_or("sampler_name", "euler_ancestral"));
        let scheduler = params
            .str("scheduler_main_pass_for_saver")
            .unwrap_or_else(|| params.str_or("scheduler", "normal"));
        let pixels = flow.read(Channel::Pixels)?;
        let steps_cfg = flow.read(Channel::StepsCfg)?;
        let model_name = flow.read(Channel::ModelName)?;
        let cfg = flow.output(steps_cfg.node, 1)?;

        let (saver, _) = flow.add_node(
            "Image Saver",
            inputs! {
                "images" => pixels,
                "filename" => filename,
                "path" => path,
                "extension" => "png",
                "steps" => steps_cfg,
                "cfg" => cfg,
                "modelname" => model_name,
                "sampler_name" => sampler_name,
                "scheduler" => scheduler,
                "positive" => params.str_or("positive_prompt", ""),
                "negative" => params.str_or("negative_prompt", ""),
                "seed_value" => params.value_or("random_seed", (-1i64).into()),
                "width" => params.i64_or("width", 512),
                "height" => params.i64_or("height", 512),
                "lossless_webp" => true,
                "quality_jpeg_or_webp" => 100i64,
                "optimize_png" => false,
                "counter" => 0i64,
                "denoise" => 1.0,
                "clip_skip" => params.i64_or("clipskip", -2),
                "time_format" => "%Y-%m-%d-%H%M%S",
                "save_workflow_as_json" => false,
                "embed_workflow" => true,
                "additional_hashes" => "",
                "download_civitai_data" => true,
                "easy_remix" => true,
            },
            Some(OUTPUT_TITLE),
        )?;
        flow.set_output_node(saver);
        debug!("Saving to {}/{}", path, filename);
        Ok(())
    }
}
