// Normalizes the flat parameter map a caller sends for one generation.
// Every key in DEFAULTS is guaranteed present and non-null afterwards; unknown keys ride along untouched.

use lazy_static::lazy_static;
use serde_json::{json, Map, Value};

lazy_static! {
    static ref DEFAULTS: Vec<(&'static str, Value)> = vec![
        // Main generation
        ("positive_prompt", json!("")),
        ("negative_prompt", json!("")),
        ("random_seed", json!(-1)),
        ("steps", json!(20)),
        ("cfg", json!(7.0)),
        ("width", json!(512)),
        ("height", json!(512)),
        ("denoise", json!(1.0)),
        ("batch_size", json!(1)),
        ("clipskip", json!(-2)),
        ("sampler_name", json!("euler_ancestral")),
        ("scheduler", json!("normal")),
        ("api_image_landscape", json!(false)),
        // HiresFix
        ("hf_enable", json!(false)),
        ("hf_scale", json!(1.5)),
        ("hf_denoising_strength", json!(0.4)),
        ("hf_upscaler", json!("RealESRGAN_x4.pth")),
        ("hf_steps", json!(15)),
        ("hf_cfg", json!(7.0)),
        ("hf_colortransfer", json!("none")),
        ("hf_temporal_size", json!(64)),
        ("hf_temporal_overlap", json!(8)),
        // LoRA
        ("loras_enabled", json!(false)),
        ("loras_config", json!([])),
        // ControlNet
        ("controlnet_enabled", json!(false)),
        ("controlnet_strength", json!(1.0)),
        ("controlnet_preprocessors", json!({})),
        ("selected_anyline_style", json!("lineart_realistic")),
        ("cn_anyline_resolution", json!(1152)),
        ("cn_depth_model", json!("depth_anything_v2_vitl.pth")),
        ("cn_depth_resolution", json!(1472)),
        ("cn_openpose_resolution", json!(1024)),
        ("cn_canny_resolution", json!(192)),
        // ClipVision
        ("clipvision_enabled", json!(false)),
        ("clipvision_strength", json!(1.0)),
        // Output
        ("output_filename_format", json!("%time_%seed")),
        ("output_path_format", json!("%date")),
        // Model merge
        ("model_merge_enabled", json!(false)),
        ("model_merge_ratio", json!(0.5)),
        // Sampling discrete
        ("sampling_discrete_enabled", json!(false)),
        ("sampling_type", json!("eps")),
        ("zsnr_enabled", json!(false)),
    ];
}

const PREPROCESSOR_RESOLUTIONS: [&str; 4] = [
    "cn_anyline_resolution",
    "cn_depth_resolution",
    "cn_openpose_resolution",
    "cn_canny_resolution",
];

/// Validated generation parameters. Construct with [`validate_params`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Map<String, Value>);

/// Fills defaults and resolves legacy aliases. Never fails.
pub fn validate_params(raw: &Map<String, Value>) -> Params {
    let mut validated = raw.clone();

    // The global preprocessor resolution only stands in for per-stage values the caller left out.
    if let Some(global) = raw.get("cn_global_preprocessor_resolution").filter(|v| !v.is_null()) {
        for key in PREPROCESSOR_RESOLUTIONS {
            if validated.get(key).map_or(true, Value::is_null) {
                validated.insert(key.to_owned(), global.clone());
            }
        }
    }

    for (key, default) in DEFAULTS.iter() {
        if validated.get(*key).map_or(true, Value::is_null) {
            validated.insert((*key).to_owned(), default.clone());
        }
    }

    // "loops" is the older name for batch size.
    if let Some(loops) = raw.get("loops").filter(|v| !v.is_null()) {
        validated.insert("batch_size".to_owned(), loops.clone());
    }

    Params(validated)
}

/// Loose truthiness: null, false, 0, "" and empty containers are all "not set".
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Reads a finite number, accepting numeric strings as well.
/// JSON has no NaN or infinity, so "NaN" and "inf" count as missing.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f: &f64| f.is_finite())
}

impl Params {
    /// The value for `key`, treating null as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// True when `key` holds a truthy value.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).map_or(false, truthy)
    }

    /// A non-empty string, or `None`.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.str(key).unwrap_or(default)
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(as_f64).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).map_or(default, truthy)
    }

    /// The raw value, for inputs passed through to the engine verbatim.
    pub fn value_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Truthiness of `key` inside the object stored under `object`.
    pub fn is_set_in(&self, object: &str, key: &str) -> bool {
        self.get(object)
            .and_then(Value::as_object)
            .and_then(|o| o.get(key))
            .map_or(false, truthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fills_every_default() {
        let params = validate_params(&Map::new());
        for (key, default) in DEFAULTS.iter() {
            assert_eq!(params.get(key), Some(default), "{}", key);
        }
        assert_eq!(params.i64_or("steps", 0), 20);
        assert_eq!(params.str_or("sampler_name", ""), "euler_ancestral");
    }

    #[test]
    fn test_caller_values_win_and_nulls_are_gaps() {
        let params = validate_params(&raw(json!({
            "steps": 35,
            "cfg": null,
            "scheduler": "karras",
            "something_else": [1, 2],
        })));
        assert_eq!(params.i64_or("steps", 0), 35);
        assert_eq!(params.f64_or("cfg", 0.0), 7.0);
        assert_eq!(params.str("scheduler"), Some("karras"));
        assert_eq!(params.get("something_else"), Some(&json!([1, 2])));
    }

    #[test]
    fn test_input_is_not_mutated() {
        let input = raw(json!({ "steps": null }));
        let _ = validate_params(&input);
        assert_eq!(input.get("steps"), Some(&Value::Null));
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn test_loops_overrides_batch_size() {
        let params = validate_params(&raw(json!({ "batch_size": 2, "loops": 4 })));
        assert_eq!(params.i64_or("batch_size", 0), 4);
        let params = validate_params(&raw(json!({ "batch_size": 3 })));
        assert_eq!(params.i64_or("batch_size", 0), 3);
    }

    #[test]
    fn test_global_preprocessor_resolution() {
        let params = validate_params(&raw(json!({
            "cn_global_preprocessor_resolution": 768,
            "cn_depth_resolution": 2048,
            "cn_canny_resolution": null,
        })));
        assert_eq!(params.i64_or("cn_anyline_resolution", 0), 768);
        assert_eq!(params.i64_or("cn_depth_resolution", 0), 2048);
        assert_eq!(params.i64_or("cn_openpose_resolution", 0), 768);
        assert_eq!(params.i64_or("cn_canny_resolution", 0), 768);
    }

    #[test]
    fn test_accessors() {
        let params = validate_params(&raw(json!({
            "controlnet_enabled": 1,
            "model2_name": "",
            "hf_scale": "2.0",
            "width": 640.0,
            "controlnet_preprocessors": { "depth": true, "canny": false },
        })));
        assert!(params.is_set("controlnet_enabled"));
        assert!(!params.is_set("model2_name"));
        assert_eq!(params.str("model2_name"), None);
        assert!(!params.is_set("loras_config"));
        assert_eq!(params.f64_or("hf_scale", 0.0), 2.0);
        assert_eq!(params.i64_or("width", 0), 640);
        assert!(params.is_set_in("controlnet_preprocessors", "depth"));
        assert!(!params.is_set_in("controlnet_preprocessors", "canny"));
        assert!(!params.is_set_in("controlnet_preprocessors", "openPose"));
        assert_eq!(params.value_or("missing", json!(3)), json!(3));
    }

    #[test]
    fn test_non_finite_numbers_fall_back() {
        let params = validate_params(&raw(json!({ "cfg": "NaN", "hf_scale": "inf", "hf_cfg": "-infinity" })));
        assert_eq!(params.f64_or("cfg", 7.0), 7.0);
        assert_eq!(params.f64_or("hf_scale", 1.5), 1.5);
        assert_eq!(params.f64_or("hf_cfg", 7.0), 7.0);
        assert_eq!(as_f64(&json!(" 2.5 ")), Some(2.5));
    }
}
