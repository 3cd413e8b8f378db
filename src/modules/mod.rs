// Pipeline modules.
//
// Each module is one stage of the generation graph. The builder asks every module, in a fixed order,
// whether it applies to the request and, if so, lets it append nodes and move channel frontiers.
// A module may assume every channel written by the modules before it; nothing else.

use anyhow::Result;

use crate::{flow_generator::Flow, params::Params};

mod conditioning;
mod controlnet;
mod hires;
mod loader;
mod model;
mod output;
mod sampler;

pub use conditioning::{ClipVision, Conditioning};
pub use controlnet::{preprocess, ControlNet};
pub use hires::HiresFix;
pub use loader::Loader;
pub use model::{LoraStack, ModelMerge, SamplingDiscrete};
pub use output::Output;
pub use sampler::Sampler;

pub trait Module: Send + Sync {
    /// Name used in logs and error context.
    fn name(&self) -> &'static str;

    /// Whether this request needs the module. Reads only the params.
    fn should_run(&self, params: &Params) -> bool;

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()>;
}

/// The module list in execution order.
pub fn default_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(Loader),
        Box::new(ModelMerge),
        Box::new(LoraStack),
        Box::new(SamplingDiscrete),
        Box::new(Conditioning),
        Box::new(ClipVision),
        Box::new(ControlNet),
        Box::new(Sampler),
        Box::new(HiresFix),
        Box::new(Output),
    ]
}
