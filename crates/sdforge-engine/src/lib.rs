use std::collections::BTreeSet;
use std::env;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::blocking::Client as HttpClient;
use reqwest::{Method, StatusCode};
use sdforge_contracts::models::ModelCatalog;
use sdforge_contracts::request::{GenerationRequest, Payload};
use sdforge_contracts::response::{decode_images, GeneratedImage, ProgressSnapshot};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7860";
pub const API_URL_ENV: &str = "SDFORGE_API_URL";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API base URL cannot be empty")]
    EmptyBaseUrl,
    #[error("API request failed ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("API transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API returned invalid JSON for {path}: {source}")]
    InvalidJson {
        path: String,
        source: serde_json::Error,
    },
    #[error("API returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Adds `http://` when no scheme is given and drops trailing slashes.
/// Blank input yields `None`.
pub fn normalize_api_url(text: &str) -> Option<String> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }
    let with_scheme = if cleaned.contains("://") {
        cleaned.to_string()
    } else {
        format!("http://{cleaned}")
    };
    Some(with_scheme.trim_end_matches('/').to_string())
}

pub fn api_url_from_env() -> String {
    env::var(API_URL_ENV)
        .ok()
        .and_then(|value| normalize_api_url(&value))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

/// Lists and options fetched when the generation form opens. Each failed
/// endpoint leaves its list empty and adds a line to `errors`.
#[derive(Debug, Clone, Default)]
pub struct ServiceMetadata {
    pub checkpoints: Vec<String>,
    pub vaes: Vec<String>,
    pub text_encoders: Vec<String>,
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
    pub options: Map<String, Value>,
    pub errors: Vec<String>,
}

/// Blocking client for the Forge `/sdapi/v1` HTTP API.
#[derive(Debug, Clone)]
pub struct ForgeClient {
    base_url: String,
    http: HttpClient,
}

impl ForgeClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut client = Self {
            base_url: String::new(),
            http,
        };
        client.set_base_url(base_url)?;
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_base_url(&mut self, base_url: &str) -> Result<(), ApiError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ApiError::EmptyBaseUrl);
        }
        self.base_url = trimmed.to_string();
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        debug!(%method, path, "forge request");
        let mut builder = self.http.request(method, self.url(path));
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            let message = truncate_text(&text, ERROR_BODY_MAX_CHARS);
            error!(status = status.as_u16(), path, "API request failed: {message}");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_str(&text).map_err(|source| ApiError::InvalidJson {
            path: path.to_string(),
            source,
        })
    }

    fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, path, None, &[])
    }

    pub fn list_checkpoints(&self) -> Result<Vec<String>, ApiError> {
        let data = self.get("/sdapi/v1/sd-models")?;
        Ok(extract_names(
            &data,
            &["title", "model_name", "filename", "name"],
        ))
    }

    pub fn list_vaes(&self) -> Result<Vec<String>, ApiError> {
        let data = self.get("/sdapi/v1/sd-vae")?;
        Ok(extract_names(
            &data,
            &["model_name", "title", "filename", "name"],
        ))
    }

    pub fn list_text_encoders(&self) -> Result<Vec<String>, ApiError> {
        let data = self.get("/sdapi/v1/sd-embeddings")?;
        Ok(text_encoder_names(&data))
    }

    pub fn list_samplers(&self) -> Result<Vec<String>, ApiError> {
        let data = self.get("/sdapi/v1/samplers")?;
        Ok(extract_names(&data, &["name", "title"]))
    }

    /// Older servers lack the schedulers endpoint; a 404 is an empty list.
    pub fn list_schedulers(&self) -> Result<Vec<String>, ApiError> {
        match self.get("/sdapi/v1/schedulers") {
            Ok(data) => Ok(extract_names(&data, &["name", "title"])),
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND.as_u16()) => {
                info!("schedulers endpoint unavailable; returning empty list");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub fn list_loras(&self) -> Result<ModelCatalog, ApiError> {
        let data = self.get("/sdapi/v1/loras")?;
        Ok(ModelCatalog::from_listing(&data))
    }

    pub fn get_options(&self) -> Result<Map<String, Value>, ApiError> {
        match self.get("/sdapi/v1/options")? {
            Value::Object(options) => Ok(options),
            other => {
                warn!(payload = %value_kind(&other), "unexpected payload for /options endpoint");
                Ok(Map::new())
            }
        }
    }

    pub fn load_metadata(&self) -> ServiceMetadata {
        let mut errors = Vec::new();
        let mut collect = |label: &str, result: Result<Vec<String>, ApiError>| match result {
            Ok(values) => values,
            Err(err) => {
                errors.push(format!("{label}: {err}"));
                Vec::new()
            }
        };
        let checkpoints = collect("Checkpoints", self.list_checkpoints());
        let vaes = collect("VAEs", self.list_vaes());
        let text_encoders = collect("Text encoders", self.list_text_encoders());
        let samplers = collect("Samplers", self.list_samplers());
        let schedulers = collect("Schedulers", self.list_schedulers());
        let options = match self.get_options() {
            Ok(options) => options,
            Err(err) => {
                errors.push(format!("Options: {err}"));
                Map::new()
            }
        };
        ServiceMetadata {
            checkpoints,
            vaes,
            text_encoders,
            samplers,
            schedulers,
            options,
            errors,
        }
    }

    pub fn text_to_image(&self, payload: &Payload) -> Result<Vec<GeneratedImage>, ApiError> {
        let body = Value::Object(payload.clone());
        let data = self.request(Method::POST, "/sdapi/v1/txt2img", Some(&body), &[])?;
        let fallback_seed = payload.get("seed").and_then(Value::as_i64).unwrap_or(-1);
        decode_images(&data, fallback_seed)
            .map_err(|err| ApiError::InvalidResponse(format!("{err:#}")))
    }

    pub fn progress(&self) -> Result<Option<ProgressSnapshot>, ApiError> {
        let data = self.request(
            Method::GET,
            "/sdapi/v1/progress",
            None,
            &[("skip_current_image", "true")],
        )?;
        Ok(ProgressSnapshot::from_value(&data))
    }
}

pub type GenerationOutcome = Result<Vec<GeneratedImage>, String>;

/// Builds the payload and submits it on a worker thread. The outcome arrives
/// on the returned channel exactly once.
pub fn spawn_generation(
    client: ForgeClient,
    request: GenerationRequest,
) -> (JoinHandle<()>, Receiver<GenerationOutcome>) {
    let (sender, receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        let payload = request.to_payload();
        let outcome = client
            .text_to_image(&payload)
            .map_err(|err| err.to_string());
        if sender.send(outcome).is_err() {
            debug!("generation finished after the receiver was dropped");
        }
    });
    (handle, receiver)
}

pub fn extract_names(items: &Value, keys: &[&str]) -> Vec<String> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            keys.iter()
                .filter_map(|key| item.get(*key))
                .find_map(|value| match value {
                    Value::String(text) if !text.is_empty() => Some(text.clone()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
        })
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Names from the embeddings endpoint: the keys of `loaded` and `skipped`,
/// or a plain string list, sorted and deduplicated.
pub fn text_encoder_names(data: &Value) -> Vec<String> {
    let mut names = BTreeSet::new();
    match data {
        Value::Object(groups) => {
            for key in ["loaded", "skipped"] {
                if let Some(group) = groups.get(key).and_then(Value::as_object) {
                    names.extend(group.keys().cloned());
                }
            }
        }
        Value::Array(items) => {
            names.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
        }
        _ => {}
    }
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
