// Modules that rewrite the model (and for LoRAs, the clip) channel after loading.

use anyhow::Result;
use log::{debug, warn};
use serde_json::Value;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow},
    params::{self, Params},
};

/// Blends a second checkpoint into the model channel.
pub struct ModelMerge;

impl Module for ModelMerge {
    fn name(&self) -> &'static str {
        "ModelMerge"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("model_merge_enabled") && params.is_set("model2_name")
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let model2_name = params.str_or("model2_name", "");
        let ratio = params.f64_or("model_merge_ratio", 0.5);

        let (_, model2) = flow.add_node(
            "CheckpointLoaderSimple",
            inputs! { "ckpt_name" => model2_name },
            Some("Load Checkpoint 2 (Merge)"),
        )?;
        let model1 = flow.read(Channel::Model)?;
        let (_, merged) = flow.add_node(
            "ModelMergeSimple",
            inputs! {
                "model1" => model1,
                "model2" => model2,
                "ratio" => ratio,
            },
            Some(format!("Merge Models (ratio: {})", ratio).as_str()),
        )?;
        flow.write(Channel::Model, merged);
        debug!("Merged with {} at ratio {}", model2_name, ratio);
        Ok(())
    }
}

/// One usable entry of `loras_config`.
#[derive(Debug, PartialEq)]
struct LoraEntry {
    name: String,
    strength: f64,
}

impl LoraEntry {
    /// Returns None for entries that should be skipped: no name, "none", or a non-numeric strength.
    fn parse(value: &Value) -> Option<Self> {
        let name = value.get("name").and_then(Value::as_str)?;
        if name.is_empty() || name == "none" {
            return None;
        }
        let strength = match value.get("strength") {
            None | Some(Value::Null) => 1.0,
            Some(s) => match params::as_f64(s) {
                Some(s) => s,
                None => {
                    warn!("Skipping LoRA {} with unusable strength {}", name, s);
                    return None;
                }
            },
        };
        Some(Self { name: name.to_owned(), strength })
    }

    fn basename(&self) -> &str {
        self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name)
    }
}

/// Chains LoRA loaders over the model and clip channels, in list order.
pub struct LoraStack;

impl Module for LoraStack {
    fn name(&self) -> &'static str {
        "LoraStack"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("loras_enabled") && params.is_set("loras_config")
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let entries = params
            .get("loras_config")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries.iter().filter_map(LoraEntry::parse) {
            let model = flow.read(Channel::Model)?;
            let clip = flow.read(Channel::Clip)?;
            // The engine lists LoRAs in subdirectories with backslashes.
            let (lora, _) = flow.add_node(
                "LoraLoader",
                inputs! {
                    "lora_name" => entry.name.replace('/', "\\"),
                    "strength_model" => entry.strength,
                    "strength_clip" => entry.strength,
                    "model" => model,
                    "clip" => clip,
                },
                Some(format!("Load LoRA: {}", entry.basename()).as_str()),
            )?;
            flow.write(Channel::Model, lora.output(0));
            flow.write(Channel::Clip, lora.output(1));
            debug!("Added LoRA {} at {}", entry.name, entry.strength);
        }
        Ok(())
    }
}

/// Re-parameterizes sampling of the model (eps, v_prediction, ...), optionally with zero terminal SNR.
pub struct SamplingDiscrete;

impl Module for SamplingDiscrete {
    fn name(&self) -> &'static str {
        "SamplingDiscrete"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("sampling_discrete_enabled")
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let sampling = params.str_or("sampling_type", "eps");
        let zsnr = params.bool_or("zsnr_enabled", false);
        let model = flow.read(Channel::Model)?;
        let (_, model) = flow.add_node(
            "ModelSamplingDiscrete",
            inputs! {
                "model" => model,
                "sampling" => sampling,
                "zsnr" => zsnr,
            },
            Some(format!("Sampling Discrete ({})", sampling).as_str()),
        )?;
        flow.write(Channel::Model, model);
        debug!("Sampling {}, zsnr {}", sampling, zsnr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{build_from, link, lit};
    use serde_json::json;

    #[test]
    fn test_lora_entry_parse() {
        assert_eq!(
            LoraEntry::parse(&json!({ "name": "style/ink.safetensors", "strength": "0.7" })),
            Some(LoraEntry { name: "style/ink.safetensors".to_owned(), strength: 0.7 })
        );
        assert_eq!(LoraEntry::parse(&json!({ "name": "a" })).map(|e| e.strength), Some(1.0));
        assert_eq!(LoraEntry::parse(&json!({ "name": "none", "strength": 1.0 })), None);
        assert_eq!(LoraEntry::parse(&json!({ "name": "", "strength": 1.0 })), None);
        assert_eq!(LoraEntry::parse(&json!({ "strength": 1.0 })), None);
        assert_eq!(LoraEntry::parse(&json!({ "name": "a", "strength": "lots" })), None);
        assert_eq!(LoraEntry::parse(&json!("a")), None);
    }

    #[test]
    fn test_lora_stack_skips_none_and_chains() {
        let workflow = build_from(json!({
            "loras_enabled": true,
            "loras_config": [
                { "name": "A", "strength": 0.5 },
                { "name": "none", "strength": 1.0 },
                { "name": "chars/B.safetensors", "strength": 0.8 },
            ],
        }));
        let loras: Vec<_> = workflow.nodes_of_type("LoraLoader").collect();
        assert_eq!(loras.len(), 2);
        let (a_id, a) = loras[0];
        let (b_id, b) = loras[1];
        assert_eq!(lit(a, "lora_name"), Some(&json!("A")));
        assert_eq!(lit(a, "strength_model"), Some(&json!(0.5)));
        assert_eq!(lit(a, "strength_clip"), Some(&json!(0.5)));
        assert_eq!(lit(b, "lora_name"), Some(&json!("chars\\B.safetensors")));
        assert_eq!(b.title(), Some("Load LoRA: B.safetensors"));
        // B consumes A's outputs on both channels.
        assert_eq!(link(b, "model"), Some(a_id.output(0)));
        assert_eq!(link(b, "clip"), Some(a_id.output(1)));
        // And the sampler consumes B's model output.
        let (_, sampler) = workflow.nodes_of_type("KSampler").next().unwrap();
        assert_eq!(link(sampler, "model"), Some(b_id.output(0)));
    }

    #[test]
    fn test_lora_stack_needs_flag() {
        let workflow = build_from(json!({
            "loras_enabled": false,
            "loras_config": [{ "name": "A", "strength": 0.5 }],
        }));
        assert_eq!(workflow.nodes_of_type("LoraLoader").count(), 0);
    }

    #[test]
    fn test_merge_then_discrete_sampling() {
        let workflow = build_from(json!({
            "model_merge_enabled": true,
            "model2_name": "other.safetensors",
            "model_merge_ratio": 0.25,
            "sampling_discrete_enabled": true,
            "sampling_type": "v_prediction",
            "zsnr_enabled": true,
        }));
        let (merge_id, merge) = workflow.nodes_of_type("ModelMergeSimple").next().unwrap();
        assert_eq!(lit(merge, "ratio"), Some(&json!(0.25)));
        let (loader_id, _) = workflow.nodes_of_type("CheckpointLoaderSimple").next().unwrap();
        assert_eq!(link(merge, "model2"), Some(loader_id.output(0)));

        let (discrete_id, discrete) = workflow.nodes_of_type("ModelSamplingDiscrete").next().unwrap();
        assert_eq!(link(discrete, "model"), Some(merge_id.output(0)));
        assert_eq!(lit(discrete, "zsnr"), Some(&json!(true)));
        let (_, sampler) = workflow.nodes_of_type("KSampler").next().unwrap();
        assert_eq!(link(sampler, "model"), Some(discrete_id.output(0)));
    }

    #[test]
    fn test_merge_needs_second_model() {
        let workflow = build_from(json!({ "model_merge_enabled": true }));
        assert_eq!(workflow.nodes_of_type("ModelMergeSimple").count(), 0);
    }
}
