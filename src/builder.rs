// Turns a parameter map into a workflow by running the module pipeline over one fresh Flow.

use anyhow::{Context, Result};
use log::{debug, info};
use serde_json::{Map, Value};

use crate::{
    flow_generator::{Flow, Workflow, PREVIEW_TITLE},
    modules::{self, Module},
    params::{validate_params, Params},
};

pub struct PipelineBuilder {
    modules: Vec<Box<dyn Module>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::with_modules(modules::default_modules())
    }

    /// A builder over a custom module list. The list is run as given; ordering mistakes surface
    /// as channel errors during `build`.
    pub fn with_modules(modules: Vec<Box<dyn Module>>) -> Self {
        Self { modules }
    }

    /// Builds the full generation workflow.
    /// Fails only when a module reads a channel nothing has written yet.
    pub fn build(&self, raw: &Map<String, Value>) -> Result<Workflow> {
        let params = validate_params(raw);
        let mut flow = Flow::new();
        for module in self.modules.iter() {
            if module.should_run(&params) {
                debug!("Running {}", module.name());
                module
                    .build(&mut flow, &params)
                    .with_context(|| format!("{} failed to build", module.name()))?;
            } else {
                debug!("Skipping {}", module.name());
            }
        }
        let workflow = flow.finish();
        info!(
            "Built workflow: {} modules, {} nodes, output node {}, fingerprint {}",
            self.modules.len(),
            workflow.len(),
            workflow.output_node().map_or_else(|| "none".to_string(), |id| id.to_string()),
            workflow.fingerprint()
        );
        Ok(workflow)
    }

    /// Builds the preprocessor-preview workflow: load the ControlNet reference image, run the
    /// enabled preprocessors, preview the result. Returns None when there is no reference image.
    pub fn build_preview(&self, raw: &Map<String, Value>) -> Result<Option<Workflow>> {
        build_preview(&validate_params(raw))
    }
}

fn build_preview(params: &Params) -> Result<Option<Workflow>> {
    let Some(image_file) = params.str("controlnet_ref_image_filename") else {
        info!("No reference image, nothing to preview");
        return Ok(None);
    };
    let mut flow = Flow::new();
    let (_, image) = flow.add_node(
        "LoadImage",
        inputs! { "image" => image_file },
        Some("Load Ref Image (Preview)"),
    )?;
    let image = modules::preprocess(&mut flow, params, image, "Preview")?;
    let (preview, _) = flow.add_node("PreviewImage", inputs! { "images" => image }, Some(PREVIEW_TITLE))?;
    flow.set_preview_node(preview);

    let workflow = flow.finish();
    info!("Built preview workflow: {} nodes", workflow.len());
    Ok(Some(workflow))
}
