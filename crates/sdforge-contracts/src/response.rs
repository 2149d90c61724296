use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub seed: i64,
    pub info: Map<String, Value>,
}

/// Normalizes the `info` field, which the service may send either as an
/// object or as JSON encoded in a string. Undecodable strings are kept under
/// `raw`.
pub fn decode_info(info: Option<&Value>) -> Map<String, Value> {
    match info {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(_) => {
                let mut map = Map::new();
                map.insert("raw".to_string(), Value::String(raw.clone()));
                map
            }
        },
        _ => Map::new(),
    }
}

/// Decodes a txt2img response body. Seeds come from `info.all_seeds`, with
/// `fallback_seed` (the requested seed) filling any gaps.
pub fn decode_images(response: &Value, fallback_seed: i64) -> Result<Vec<GeneratedImage>> {
    let info = decode_info(response.get("info"));
    let seeds = info
        .get("all_seeds")
        .and_then(Value::as_array)
        .map(|seeds| {
            seeds
                .iter()
                .map(|seed| seed.as_i64().unwrap_or(fallback_seed))
                .collect::<Vec<i64>>()
        })
        .unwrap_or_default();

    let encoded = response
        .get("images")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut images = Vec::with_capacity(encoded.len());
    for (index, entry) in encoded.iter().enumerate() {
        let Some(text) = entry.as_str() else {
            continue;
        };
        // Strip a `data:image/png;base64,` prefix when present.
        let body = text.rsplit(',').next().unwrap_or(text).trim();
        let data = BASE64
            .decode(body)
            .with_context(|| format!("image {index} is not valid base64"))?;
        images.push(GeneratedImage {
            data,
            seed: seeds.get(index).copied().unwrap_or(fallback_seed),
            info: info.clone(),
        });
    }
    Ok(images)
}

pub fn info_lines(image: &GeneratedImage) -> Vec<String> {
    let mut entries = image.info.iter().collect::<Vec<(&String, &Value)>>();
    entries.sort_by(|left, right| left.0.cmp(right.0));
    let mut lines = vec![format!("Seed: {}", image.seed)];
    for (key, value) in entries {
        match value {
            Value::String(text) => lines.push(format!("{key}: {text}")),
            other => lines.push(format!("{key}: {other}")),
        }
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub progress: Option<f64>,
    pub eta_relative: Option<f64>,
}

impl ProgressSnapshot {
    /// `None` for an empty or non-object progress body.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object().filter(|object| !object.is_empty())?;
        Some(Self {
            progress: object.get("progress").and_then(Value::as_f64),
            eta_relative: object
                .get("eta_relative")
                .and_then(Value::as_f64)
                .filter(|eta| *eta >= 0.0),
        })
    }

    pub fn percent(&self) -> Option<u8> {
        self.progress
            .map(|progress| (progress * 100.0).trunc().clamp(0.0, 100.0) as u8)
    }

    pub fn status_line(&self) -> String {
        match (self.progress, self.eta_relative) {
            (Some(progress), Some(eta)) => {
                format!("Progress: {:.1}% - ETA {eta:.1}s", progress * 100.0)
            }
            (None, Some(eta)) => format!("ETA {eta:.1}s"),
            (Some(_), None) => format!("Progress: {}%", self.percent().unwrap_or(0)),
            (None, None) => "Processing...".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::{json, Value};

    use super::{decode_images, decode_info, info_lines, ProgressSnapshot};

    #[test]
    fn string_info_is_decoded_twice() {
        let info = decode_info(Some(&json!(r#"{"all_seeds": [7]}"#)));
        assert_eq!(info["all_seeds"], json!([7]));
    }

    #[test]
    fn unparsable_info_is_kept_raw() {
        assert_eq!(
            Value::Object(decode_info(Some(&json!("oops")))),
            json!({"raw": "oops"})
        );
        assert!(decode_info(Some(&json!("[1, 2]"))).is_empty());
        assert!(decode_info(None).is_empty());
        assert_eq!(
            Value::Object(decode_info(Some(&json!({"seed": 3})))),
            json!({"seed": 3})
        );
    }

    #[test]
    fn images_take_seeds_from_info() -> anyhow::Result<()> {
        let png = BASE64.encode(b"png-bytes");
        let response = json!({
            "images": [format!("data:image/png;base64,{png}"), png],
            "info": r#"{"all_seeds": [11], "sampler_name": "Euler a"}"#,
        });
        let images = decode_images(&response, -1)?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].data, b"png-bytes".to_vec());
        assert_eq!(images[0].seed, 11);
        assert_eq!(images[1].seed, -1);
        assert_eq!(images[1].info["sampler_name"], json!("Euler a"));
        Ok(())
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let response = json!({"images": ["***"]});
        assert!(decode_images(&response, 5).is_err());
        assert!(decode_images(&json!({}), 5).map(|images| images.is_empty()).unwrap_or(false));
    }

    #[test]
    fn info_lines_are_sorted() -> anyhow::Result<()> {
        let response = json!({
            "images": [BASE64.encode(b"x")],
            "info": {"steps": 20, "prompt": "cat", "all_seeds": [9]},
        });
        let images = decode_images(&response, -1)?;
        assert_eq!(
            info_lines(&images[0]),
            vec!["Seed: 9", "all_seeds: [9]", "prompt: cat", "steps: 20"]
        );
        Ok(())
    }

    #[test]
    fn progress_status_lines() {
        let both = ProgressSnapshot::from_value(&json!({"progress": 0.425, "eta_relative": 3.21}));
        assert_eq!(
            both.map(|snapshot| snapshot.status_line()),
            Some("Progress: 42.5% - ETA 3.2s".to_string())
        );

        let only_progress = ProgressSnapshot::from_value(&json!({"progress": 1.7}));
        assert_eq!(only_progress.and_then(|snapshot| snapshot.percent()), Some(100));
        assert_eq!(
            only_progress.map(|snapshot| snapshot.status_line()),
            Some("Progress: 100%".to_string())
        );

        let idle = ProgressSnapshot::from_value(&json!({"eta_relative": -1, "state": {}}));
        assert_eq!(
            idle.map(|snapshot| snapshot.status_line()),
            Some("Processing...".to_string())
        );
        assert_eq!(ProgressSnapshot::from_value(&json!({})), None);
    }
}
