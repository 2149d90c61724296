use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::reference::ModelReference;

pub const DEFAULT_SELECTION_WEIGHT: f64 = 1.0;

/// A model reference picked by the user together with its strength.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub reference: Arc<ModelReference>,
    pub weight: f64,
}

impl Selection {
    /// Negative weights clamp to zero.
    pub fn new(reference: Arc<ModelReference>, weight: f64) -> Self {
        Self {
            reference,
            weight: clamp_weight(weight),
        }
    }

    pub fn name(&self) -> &str {
        self.reference.name()
    }

    /// `<lora:{prompt_name}:{weight}>` with at most two decimals.
    pub fn prompt_tag(&self) -> String {
        let text = format!("{:.2}", self.weight);
        let mut weight = text.trim_end_matches('0').trim_end_matches('.');
        if weight.is_empty() {
            weight = "1";
        }
        format!("<lora:{}:{weight}>", self.reference.prompt_name())
    }

    pub fn script_args(&self) -> Value {
        Value::Array(vec![
            Value::String(self.reference.name().to_string()),
            Value::from(self.weight),
        ])
    }
}

fn clamp_weight(weight: f64) -> f64 {
    if weight > 0.0 {
        weight
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    Added,
    Updated,
    Removed,
    Replaced,
    Cleared,
}

type ChangeListener = Box<dyn FnMut(SelectionChange)>;

/// Ordered, name-keyed collection of auxiliary model selections.
///
/// Listeners run synchronously after each mutation. They only receive the
/// change kind, so they cannot re-enter the set while it is borrowed.
#[derive(Default)]
pub struct SelectionSet {
    entries: IndexMap<String, Selection>,
    listeners: Vec<ChangeListener>,
}

impl fmt::Debug for SelectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionSet")
            .field("entries", &self.entries)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(SelectionChange) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn add_or_update(&mut self, reference: Arc<ModelReference>, weight: f64) {
        let change = self.upsert(Selection::new(reference, weight));
        self.notify(change);
    }

    /// Returns the clamped weight, or `None` when `name` is not selected.
    pub fn adjust_weight(&mut self, name: &str, delta: f64) -> Option<f64> {
        let entry = self.entries.get_mut(name)?;
        entry.weight = clamp_weight(entry.weight + delta);
        let weight = entry.weight;
        self.notify(SelectionChange::Updated);
        Some(weight)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.entries.shift_remove(name).is_none() {
            return false;
        }
        self.notify(SelectionChange::Removed);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Selection> {
        self.entries.get(name)
    }

    pub fn selections(&self) -> Vec<Selection> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restores the whole set with a single `Replaced` notification. Repeated
    /// names inside `items` update the earlier entry in place.
    pub fn replace_all(&mut self, items: impl IntoIterator<Item = (Arc<ModelReference>, f64)>) {
        self.entries.clear();
        for (reference, weight) in items {
            self.upsert(Selection::new(reference, weight));
        }
        self.notify(SelectionChange::Replaced);
    }

    /// Always notifies, even when the set is already empty.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.notify(SelectionChange::Cleared);
    }

    fn upsert(&mut self, selection: Selection) -> SelectionChange {
        let name = selection.name().to_string();
        match self.entries.get_mut(&name) {
            Some(existing) => {
                existing.weight = selection.weight;
                SelectionChange::Updated
            }
            None => {
                self.entries.insert(name, selection);
                SelectionChange::Added
            }
        }
    }

    fn notify(&mut self, change: SelectionChange) {
        for listener in self.listeners.iter_mut() {
            listener(change);
        }
    }
}
