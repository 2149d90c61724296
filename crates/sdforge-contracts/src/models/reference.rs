use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelReferenceError {
    #[error("model reference name must not be empty")]
    EmptyName,
}

/// An auxiliary model (LoRA) known to the generation service.
///
/// Contents are immutable once built; catalogs and selections share the same
/// instance through `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    name: String,
    alias: Option<String>,
    path: Option<String>,
}

impl ModelReference {
    pub fn new(name: impl Into<String>) -> Result<Self, ModelReferenceError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(ModelReferenceError::EmptyName);
        }
        Ok(Self {
            name,
            alias: None,
            path: None,
        })
    }

    pub fn with_alias(mut self, alias: Option<&str>) -> Self {
        self.alias = non_empty(alias);
        self
    }

    pub fn with_path(mut self, path: Option<&str>) -> Self {
        self.path = non_empty(path);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn display_name(&self) -> String {
        match self.alias.as_deref() {
            Some(alias) if alias.to_lowercase() != self.name.to_lowercase() => {
                format!("{alias} ({})", self.name)
            }
            _ => self.name.clone(),
        }
    }

    pub fn prompt_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Builds a reference from one entry of the service's LoRA listing.
    pub fn from_listing_entry(entry: &Value) -> Option<Self> {
        let object = entry.as_object()?;
        let name = ["name", "model_name", "alias"]
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(truthy_text)?;
        let reference = Self::new(name).ok()?;
        let alias = object.get("alias").and_then(Value::as_str);
        let path = object
            .get("path")
            .and_then(truthy_text)
            .or_else(|| object.get("model_path").and_then(truthy_text));
        Some(reference.with_alias(alias).with_path(path.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn truthy_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
