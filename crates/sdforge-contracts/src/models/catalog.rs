use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::reference::ModelReference;

/// Source of truth for the auxiliary models the service offers.
///
/// Keys are lowercased names so a listing that repeats a model with
/// different casing keeps only the first entry.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: IndexMap<String, Arc<ModelReference>>,
}

impl ModelCatalog {
    pub fn new(models: impl IntoIterator<Item = ModelReference>) -> Self {
        let mut catalog = Self::default();
        for model in models {
            catalog.insert(model);
        }
        catalog
    }

    /// Parses the JSON array returned by the LoRA listing endpoint.
    /// Anything that is not an array yields an empty catalog.
    pub fn from_listing(listing: &Value) -> Self {
        let entries = listing.as_array().map(Vec::as_slice).unwrap_or_default();
        Self::new(entries.iter().filter_map(ModelReference::from_listing_entry))
    }

    /// Returns false when a model with the same case-insensitive name exists.
    pub fn insert(&mut self, model: ModelReference) -> bool {
        let key = model.name().to_lowercase();
        if self.models.contains_key(&key) {
            return false;
        }
        self.models.insert(key, Arc::new(model));
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelReference>> {
        self.models.get(&name.to_lowercase()).cloned()
    }

    /// Looks a model up by name first, then by alias.
    pub fn find(&self, needle: &str) -> Option<Arc<ModelReference>> {
        self.get(needle).or_else(|| {
            let lowered = needle.to_lowercase();
            self.models
                .values()
                .find(|model| {
                    model
                        .alias()
                        .map(|alias| alias.to_lowercase() == lowered)
                        .unwrap_or(false)
                })
                .cloned()
        })
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<ModelReference>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::ModelCatalog;

    #[test]
    fn listing_deduplicates_case_insensitively() {
        let catalog = ModelCatalog::from_listing(&json!([
            {"name": "Ohwx", "alias": "ohwx-style", "path": "/loras/ohwx.safetensors"},
            {"name": "ohwx", "alias": "duplicate"},
            {"alias": "grain"},
            {"name": ""},
            "not an object",
        ]));
        assert_eq!(catalog.len(), 2);
        let names = catalog
            .list()
            .map(|model| model.name().to_string())
            .collect::<Vec<String>>();
        assert_eq!(names, vec!["Ohwx", "grain"]);
        assert_eq!(
            catalog.get("OHWX").and_then(|model| model.alias().map(str::to_string)),
            Some("ohwx-style".to_string())
        );
    }

    #[test]
    fn non_array_listing_is_empty() {
        assert!(ModelCatalog::from_listing(&json!({"error": "nope"})).is_empty());
    }

    #[test]
    fn find_matches_alias_and_shares_instances() {
        let catalog = ModelCatalog::from_listing(&json!([
            {"name": "add_detail", "alias": "Detail"},
        ]));
        let by_alias = catalog.find("detail").unwrap();
        let by_name = catalog.get("add_detail").unwrap();
        assert!(Arc::ptr_eq(&by_alias, &by_name));
        assert!(catalog.find("missing").is_none());
    }
}
