use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow},
    params::Params,
};

/// Loads the main checkpoint. Always runs.
pub struct Loader;

impl Module for Loader {
    fn name(&self) -> &'static str {
        "Loader"
    }

    fn should_run(&self, _params: &Params) -> bool {
        true
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let model_name = params.str_or("model_name", "default");
        // This loader variant also outputs the model name as a string, for the saver's metadata.
        let (ckpt, _) = flow.add_node(
            "Checkpoint Loader with Name (Image Saver)",
            inputs! { "ckpt_name" => model_name },
            Some("Load Checkpoint"),
        )?;
        flow.write(Channel::Model, ckpt.output(0));
        flow.write(Channel::Clip, ckpt.output(1));
        flow.write(Channel::Vae, ckpt.output(2));
        flow.write(Channel::ModelName, ckpt.output(3));
        debug!("Loaded checkpoint {}", model_name);
        Ok(())
    }
}
