use serde_json::{Map, Value};

use crate::models::Selection;

pub const LORA_SCRIPT_NAME: &str = "LoRA";
pub const DEFAULT_CFG_SCALE: f64 = 7.0;

pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub sampler: String,
    pub scheduler: Option<String>,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub batch_count: u32,
    pub seed: i64,
    pub subseed: Option<i64>,
    pub clip_skip: Option<u32>,
    pub checkpoint: Option<String>,
    pub vae: Option<String>,
    pub text_encoder: Option<String>,
    pub gpu_weight_limit: Option<u64>,
    pub selections: Vec<Selection>,
    /// Merged into `override_settings` last; wins on key collisions.
    pub override_settings: Map<String, Value>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            sampler: "Euler a".to_string(),
            scheduler: None,
            cfg_scale: DEFAULT_CFG_SCALE,
            width: 512,
            height: 512,
            batch_size: 1,
            batch_count: 1,
            seed: -1,
            subseed: None,
            clip_skip: None,
            checkpoint: None,
            vae: None,
            text_encoder: None,
            gpu_weight_limit: None,
            selections: Vec::new(),
            override_settings: Map::new(),
        }
    }
}

impl GenerationRequest {
    pub fn to_payload(&self) -> Payload {
        build_payload(self)
    }

    /// Seeds the form from the service's current `/options`. `samplers` is
    /// the sampler listing, used when only `sampler_index` is reported.
    pub fn with_server_options(mut self, options: &Map<String, Value>, samplers: &[String]) -> Self {
        if let Some(value) = option_text(options, "sd_model_checkpoint") {
            self.checkpoint = Some(value);
        }
        if let Some(value) = option_text(options, "sd_vae") {
            self.vae = Some(value);
        }
        if let Some(value) = option_text(options, "sd_text_encoder") {
            self.text_encoder = Some(value);
        }
        match options.get("sampler_name") {
            Some(Value::String(name)) => {
                if !name.is_empty() {
                    self.sampler = name.clone();
                }
            }
            _ => {
                let indexed = options
                    .get("sampler_index")
                    .and_then(Value::as_i64)
                    .and_then(|index| usize::try_from(index).ok())
                    .and_then(|index| samplers.get(index));
                if let Some(name) = indexed {
                    self.sampler = name.clone();
                }
            }
        }
        if let Some(value) = option_text(options, "scheduler") {
            self.scheduler = Some(value);
        }

        if let Some(value) = option_int(options, "CLIP_stop_at_last_layers", 0) {
            self.clip_skip = u32::try_from(value).ok().filter(|value| *value > 0);
        }
        if let Some(value) = option_int(options, "gpu_weights_limit_mb", 0) {
            self.gpu_weight_limit = u64::try_from(value).ok().filter(|value| *value > 0);
        }

        for (key, field) in [
            ("steps", &mut self.steps),
            ("width", &mut self.width),
            ("height", &mut self.height),
            ("batch_size", &mut self.batch_size),
            ("n_iter", &mut self.batch_count),
        ] {
            if let Some(value) = option_int(options, key, 1).and_then(|value| u32::try_from(value).ok())
            {
                *field = value;
            }
        }
        if let Some(value) = option_int(options, "seed", -1) {
            self.seed = value;
        }
        let cfg_scale = options.get("cfg_scale").and_then(Value::as_f64);
        if let Some(value) = cfg_scale.filter(|value| value.is_finite()) {
            self.cfg_scale = value;
        }
        self
    }
}

fn option_text(options: &Map<String, Value>, key: &str) -> Option<String> {
    match options.get(key)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn option_int(options: &Map<String, Value>, key: &str, minimum: i64) -> Option<i64> {
    options
        .get(key)
        .and_then(Value::as_i64)
        .filter(|value| *value >= minimum)
}

/// Assembles the txt2img request body. Pure: identical requests give
/// identical payloads.
pub fn build_payload(request: &GenerationRequest) -> Payload {
    let mut prompt_segments = Vec::new();
    if !request.prompt.is_empty() {
        prompt_segments.push(request.prompt.clone());
    }
    if !request.selections.is_empty() {
        prompt_segments.push(
            request
                .selections
                .iter()
                .map(Selection::prompt_tag)
                .collect::<Vec<String>>()
                .join(" "),
        );
    }

    let mut payload = Map::new();
    payload.insert(
        "prompt".to_string(),
        Value::String(prompt_segments.join("\n")),
    );
    payload.insert(
        "negative_prompt".to_string(),
        Value::String(request.negative_prompt.clone()),
    );
    payload.insert("steps".to_string(), Value::from(request.steps));
    payload.insert(
        "sampler_name".to_string(),
        Value::String(request.sampler.clone()),
    );
    // serde_json encodes NaN and infinities as null.
    let cfg_scale = if request.cfg_scale.is_finite() {
        request.cfg_scale
    } else {
        DEFAULT_CFG_SCALE
    };
    payload.insert("cfg_scale".to_string(), Value::from(cfg_scale));
    payload.insert("width".to_string(), Value::from(request.width));
    payload.insert("height".to_string(), Value::from(request.height));
    payload.insert("batch_size".to_string(), Value::from(request.batch_size));
    payload.insert("n_iter".to_string(), Value::from(request.batch_count));
    payload.insert("seed".to_string(), Value::from(request.seed));
    if let Some(scheduler) = non_empty(&request.scheduler) {
        payload.insert("scheduler".to_string(), Value::String(scheduler));
    }
    if let Some(subseed) = request.subseed {
        payload.insert("subseed".to_string(), Value::from(subseed));
    }

    let mut overrides = Map::new();
    if let Some(clip_skip) = request.clip_skip {
        overrides.insert(
            "CLIP_stop_at_last_layers".to_string(),
            Value::from(clip_skip),
        );
    }
    if let Some(checkpoint) = non_empty(&request.checkpoint) {
        overrides.insert("sd_model_checkpoint".to_string(), Value::String(checkpoint));
    }
    if let Some(vae) = non_empty(&request.vae) {
        overrides.insert("sd_vae".to_string(), Value::String(vae));
    }
    if let Some(encoder) = non_empty(&request.text_encoder) {
        overrides.insert("sd_text_encoder".to_string(), Value::String(encoder));
    }
    if let Some(limit) = request.gpu_weight_limit {
        overrides.insert("gpu_weights_limit_mb".to_string(), Value::from(limit));
    }

    if !request.selections.is_empty() {
        let mut script = Map::new();
        script.insert(
            "args".to_string(),
            Value::Array(
                request
                    .selections
                    .iter()
                    .map(Selection::script_args)
                    .collect(),
            ),
        );
        let mut scripts = Map::new();
        scripts.insert(LORA_SCRIPT_NAME.to_string(), Value::Object(script));
        payload.insert("alwayson_scripts".to_string(), Value::Object(scripts));
    }

    for (key, value) in &request.override_settings {
        overrides.insert(key.clone(), value.clone());
    }
    payload.insert("override_settings".to_string(), Value::Object(overrides));
    payload
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|text| !text.is_empty()).cloned()
}
