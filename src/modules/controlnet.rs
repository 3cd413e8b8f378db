// ControlNet, and the preprocessor chain it shares with the preview-only build.

use anyhow::Result;
use log::debug;

use super::Module;
use crate::{
    flow_generator::{Channel, Flow, Inputs, NodeRef, PREVIEW_TITLE},
    params::Params,
};

/// Image-to-control-signal transforms, in the order they are chained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Preprocessor {
    LineArt,
    Depth,
    Pose,
    Canny,
}

const CHAIN: [Preprocessor; 4] = [
    Preprocessor::LineArt,
    Preprocessor::Depth,
    Preprocessor::Pose,
    Preprocessor::Canny,
];

impl Preprocessor {
    /// Key in the `controlnet_preprocessors` toggle map.
    fn toggle(self) -> &'static str {
        match self {
            Preprocessor::LineArt => "anyLine",
            Preprocessor::Depth => "depth",
            Preprocessor::Pose => "openPose",
            Preprocessor::Canny => "canny",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Preprocessor::LineArt => "AnyLine",
            Preprocessor::Depth => "Depth",
            Preprocessor::Pose => "OpenPose",
            Preprocessor::Canny => "Canny",
        }
    }

    fn class_type(self) -> &'static str {
        match self {
            Preprocessor::LineArt => "AnyLineArtPreprocessor_aux",
            Preprocessor::Depth => "DepthAnythingV2Preprocessor",
            Preprocessor::Pose => "OpenposePreprocessor",
            Preprocessor::Canny => "CannyEdgePreprocessor",
        }
    }

    fn inputs(self, params: &Params, image: NodeRef) -> Inputs {
        match self {
            Preprocessor::LineArt => inputs! {
                "image" => image,
                "merge_with_lineart" => params.str_or("selected_anyline_style", "lineart_realistic"),
                "resolution" => params.i64_or("cn_anyline_resolution", 1152),
                "lineart_lower_bound" => 0.0,
                "lineart_upper_bound" => 1.0,
                "object_min_size" => 36i64,
                "object_connectivity" => 1i64,
            },
            Preprocessor::Depth => inputs! {
                "image" => image,
                "ckpt_name" => params.str_or("cn_depth_model", "depth_anything_v2_vitl.pth"),
                "resolution" => params.i64_or("cn_depth_resolution", 1472),
            },
            Preprocessor::Pose => inputs! {
                "image" => image,
                "resolution" => params.i64_or("cn_openpose_resolution", 1024),
                "detect_hand" => "enable",
                "detect_body" => "enable",
                "detect_face" => "enable",
                "scale_stick_for_xinsr_cn" => "disable",
            },
            Preprocessor::Canny => inputs! {
                "image" => image,
                "low_threshold" => 100i64,
                "high_threshold" => 200i64,
                "resolution" => params.i64_or("cn_canny_resolution", 192),
            },
        }
    }
}

/// Runs every enabled preprocessor over `image`, each consuming the previous one's output.
/// Returns the last image in the chain (the input itself when nothing is enabled).
pub fn preprocess(flow: &mut Flow, params: &Params, image: NodeRef, title_prefix: &str) -> Result<NodeRef> {
    let mut current = image;
    for stage in CHAIN {
        if !params.is_set_in("controlnet_preprocessors", stage.toggle()) {
            continue;
        }
        let (_, out) = flow.add_node(
            stage.class_type(),
            stage.inputs(params, current),
            Some(format!("{}: {}", title_prefix, stage.label()).as_str()),
        )?;
        debug!("Preprocessor {:?} added", stage);
        current = out;
    }
    Ok(current)
}

/// Preprocesses a reference image and applies it through a ControlNet to both conditionings.
pub struct ControlNet;

impl Module for ControlNet {
    fn name(&self) -> &'static str {
        "ControlNet"
    }

    fn should_run(&self, params: &Params) -> bool {
        params.is_set("controlnet_enabled")
            && params.str("controlnet_model_name").is_some()
            && params.str("controlnet_ref_image_filename").is_some()
    }

    fn build(&self, flow: &mut Flow, params: &Params) -> Result<()> {
        let model_name = params.str_or("controlnet_model_name", "");
        let strength = params.f64_or("controlnet_strength", 1.0);
        let positive = flow.read(Channel::Positive)?;
        let negative = flow.read(Channel::Negative)?;

        let (_, image) = flow.add_node(
            "LoadImage",
            inputs! { "image" => params.str_or("controlnet_ref_image_filename", "") },
            Some("CN Load Ref Image"),
        )?;
        let image = preprocess(flow, params, image, "CN")?;

        let (preview, _) = flow.add_node("PreviewImage", inputs! { "images" => image }, Some(PREVIEW_TITLE))?;
        flow.set_preview_node(preview);

        let (_, control_net) = flow.add_node(
            "ControlNetLoader",
            inputs! { "control_net_name" => model_name },
            Some("Load ControlNet"),
        )?;
        let (apply, _) = flow.add_node(
            "ControlNetApplyAdvanced",
            inputs! {
                "positive" => positive,
                "negative" => negative,
                "control_net" => control_net,
                "image" => image,
                "strength" => strength,
                "start_percent" => 0.0,
                "end_percent" => 1.0,
            },
            Some("Apply ControlNet"),
        )?;
        flow.write(Channel::Positive, apply.output(0));
        flow.write(Channel::Negative, apply.output(1));
        debug!("Applied {} at strength {}", model_name, strength);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::{build_from, link, lit};
    use serde_json::json;

    fn controlnet(preprocessors: serde_json::Value) -> serde_json::Value {
        json!({
            "controlnet_enabled": true,
            "controlnet_model_name": "control_v11p_sd15_depth.pth",
            "controlnet_ref_image_filename": "cn_ref.png",
            "controlnet_strength": 0.8,
            "controlnet_preprocessors": preprocessors,
        })
    }

    #[test]
    fn test_depth_only() {
        let workflow = build_from(controlnet(json!({ "depth": true, "canny": false })));
        let (load_id, _) = workflow.nodes_of_type("LoadImage").next().unwrap();
        let (depth_id, depth) = workflow.nodes_of_type("DepthAnythingV2Preprocessor").next().unwrap();
        assert_eq!(link(depth, "image"), Some(load_id.output(0)));
        assert_eq!(lit(depth, "resolution"), Some(&json!(1472)));
        for class_type in ["AnyLineArtPreprocessor_aux", "OpenposePreprocessor", "CannyEdgePreprocessor"] {
            assert_eq!(workflow.nodes_of_type(class_type).count(), 0, "{}", class_type);
        }

        let preview_id = workflow.preview_node().unwrap();
        let preview = workflow.node(preview_id).unwrap();
        assert_eq!(preview.title(), Some(PREVIEW_TITLE));
        assert_eq!(link(preview, "images"), Some(depth_id.output(0)));
        // Exactly one node between the loaded image and the preview.
        assert_eq!(preview_id.get() - load_id.get(), 2);
    }

    #[test]
    fn test_chain_order_ignores_toggle_order() {
        let workflow = build_from(controlnet(json!({
            "canny": true,
            "openPose": true,
            "depth": true,
            "anyLine": true,
        })));
        let expected = [
            "LoadImage",
            "AnyLineArtPreprocessor_aux",
            "DepthAnythingV2Preprocessor",
            "OpenposePreprocessor",
            "CannyEdgePreprocessor",
            "PreviewImage",
        ];
        let (load_id, _) = workflow.nodes_of_type("LoadImage").next().unwrap();
        let chain: Vec<_> = workflow
            .nodes()
            .skip(load_id.get() as usize - 1)
            .take(expected.len())
            .collect();
        for (i, (id, node)) in chain.iter().enumerate() {
            assert_eq!(node.class_type, expected[i]);
            if i > 0 {
                let input = if node.class_type == "PreviewImage" { "images" } else { "image" };
                assert_eq!(link(node, input), Some(chain[i - 1].0.output(0)), "{}", id);
            }
        }
    }

    #[test]
    fn test_non_string_model_name_disables() {
        let mut params = controlnet(json!({ "depth": true }));
        params["controlnet_model_name"] = json!(5);
        let workflow = build_from(params);
        assert_eq!(workflow.nodes_of_type("ControlNetLoader").count(), 0);
        assert_eq!(workflow.nodes_of_type("ControlNetApplyAdvanced").count(), 0);
        assert_eq!(workflow.nodes_of_type("LoadImage").count(), 0);
        assert_eq!(workflow.preview_node(), None);
    }

    #[test]
    fn test_apply_replaces_both_conditionings() {
        let workflow = build_from(controlnet(json!({})));
        let (apply_id, apply) = workflow.nodes_of_type("ControlNetApplyAdvanced").next().unwrap();
        let (load_id, _) = workflow.nodes_of_type("LoadImage").next().unwrap();
        // No preprocessors: the raw image goes straight to preview and apply.
        assert_eq!(link(apply, "image"), Some(load_id.output(0)));
        assert_eq!(lit(apply, "strength"), Some(&json!(0.8)));
        let (_, sampler) = workflow.nodes_of_type("KSampler").next().unwrap();
        assert_eq!(link(sampler, "positive"), Some(apply_id.output(0)));
        assert_eq!(link(sampler, "negative"), Some(apply_id.output(1)));
    }

    #[test]
    fn test_disabled_has_no_preview() {
        let mut params = controlnet(json!({ "depth": true }));
        params["controlnet_model_name"] = json!(null);
        let workflow = build_from(params);
        assert_eq!(workflow.preview_node(), None);
        assert_eq!(workflow.nodes_of_type("PreviewImage").count(), 0);
    }
}
