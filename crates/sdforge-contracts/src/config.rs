use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};

pub const UI_CONFIG_FILE: &str = "ui-config.json";

/// Optional per-control overrides read from `ui-config.json`.
///
/// Keys have the form `"<section>/<control>/<property>"`. A file that cannot
/// be read or parsed leaves the config empty and records `error`.
#[derive(Debug, Clone, Default)]
pub struct UiConfig {
    path: PathBuf,
    entries: Map<String, Value>,
    error: Option<String>,
}

impl UiConfig {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut config = Self {
            path,
            ..Self::default()
        };
        if !config.path.exists() {
            return config;
        }
        let parsed = std::fs::read_to_string(&config.path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str::<Value>(&raw).map_err(|err| err.to_string()));
        match parsed {
            Ok(Value::Object(entries)) => config.entries = entries,
            Ok(_) => config.error = Some("Top-level JSON structure must be an object".to_string()),
            Err(err) => config.error = Some(err),
        }
        config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Properties grouped by control for one section (case-insensitive).
    pub fn section(&self, name: &str) -> IndexMap<String, Map<String, Value>> {
        let wanted = name.to_lowercase();
        let mut grouped: IndexMap<String, Map<String, Value>> = IndexMap::new();
        for (key, value) in &self.entries {
            let Some((head, tail)) = key.split_once('/') else {
                continue;
            };
            if tail.is_empty() || head.to_lowercase() != wanted {
                continue;
            }
            let Some((control, property)) = tail.split_once('/') else {
                continue;
            };
            if property.is_empty() {
                continue;
            }
            grouped
                .entry(control.to_string())
                .or_default()
                .insert(property.to_string(), value.clone());
        }
        grouped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    Minimum,
    Maximum,
}

/// What a config entry may change on a form control. Kinds without a range
/// or step ignore those properties.
pub trait SettableControl {
    fn apply_value(&mut self, value: &Value);

    fn apply_range(&mut self, _bound: RangeBound, _value: &Value) {}

    fn apply_step(&mut self, _value: &Value) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceControl {
    pub items: Vec<String>,
    pub current: Option<usize>,
}

impl ChoiceControl {
    pub fn current_text(&self) -> Option<&str> {
        self.current
            .and_then(|index| self.items.get(index))
            .map(String::as_str)
    }

    /// Exact item first, then a case-insensitive match, otherwise the text
    /// is appended as a new item.
    pub fn select(&mut self, text: &str) {
        let lowered = text.to_lowercase();
        let index = self
            .items
            .iter()
            .position(|item| item == text)
            .or_else(|| self.items.iter().position(|item| item.to_lowercase() == lowered))
            .unwrap_or_else(|| {
                self.items.push(text.to_string());
                self.items.len() - 1
            });
        self.current = Some(index);
    }
}

impl SettableControl for ChoiceControl {
    fn apply_value(&mut self, value: &Value) {
        let value = match value {
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => return,
            },
            other => other,
        };
        match value {
            Value::Null => {}
            Value::String(text) if text.is_empty() => {}
            other => self.select(&value_text(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntControl {
    pub value: i64,
    pub minimum: i64,
    pub maximum: i64,
    pub step: i64,
}

impl SettableControl for IntControl {
    fn apply_value(&mut self, value: &Value) {
        let parsed = match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64)),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            Value::Bool(flag) => Some(i64::from(*flag)),
            _ => None,
        };
        if let Some(parsed) = parsed {
            self.value = parsed.clamp(self.minimum, self.maximum);
        }
    }

    fn apply_range(&mut self, bound: RangeBound, value: &Value) {
        let Some(number) = value_as_f64(value) else {
            return;
        };
        let number = number as i64;
        match bound {
            RangeBound::Minimum => {
                self.minimum = number;
                self.maximum = self.maximum.max(number);
            }
            RangeBound::Maximum => {
                self.maximum = number;
                self.minimum = self.minimum.min(number);
            }
        }
        self.value = self.value.clamp(self.minimum, self.maximum);
    }

    fn apply_step(&mut self, value: &Value) {
        if let Some(number) = value_as_f64(value) {
            self.step = number as i64;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatControl {
    pub value: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub step: f64,
}

impl SettableControl for FloatControl {
    fn apply_value(&mut self, value: &Value) {
        if let Some(number) = value_as_f64(value) {
            self.value = number.clamp(self.minimum, self.maximum);
        }
    }

    fn apply_range(&mut self, bound: RangeBound, value: &Value) {
        let Some(number) = value_as_f64(value) else {
            return;
        };
        match bound {
            RangeBound::Minimum => {
                self.minimum = number;
                self.maximum = self.maximum.max(number);
            }
            RangeBound::Maximum => {
                self.maximum = number;
                self.minimum = self.minimum.min(number);
            }
        }
        self.value = self.value.clamp(self.minimum, self.maximum);
    }

    fn apply_step(&mut self, value: &Value) {
        if let Some(number) = value_as_f64(value) {
            self.step = number;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToggleControl {
    pub checked: bool,
}

impl SettableControl for ToggleControl {
    fn apply_value(&mut self, value: &Value) {
        if let Some(checked) = value_as_bool(value) {
            self.checked = checked;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextControl {
    pub text: String,
}

impl SettableControl for TextControl {
    fn apply_value(&mut self, value: &Value) {
        self.text = value_text(value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Choice(ChoiceControl),
    Integer(IntControl),
    Float(FloatControl),
    Toggle(ToggleControl),
    Text(TextControl),
}

impl Control {
    fn settable(&mut self) -> &mut dyn SettableControl {
        match self {
            Self::Choice(control) => control,
            Self::Integer(control) => control,
            Self::Float(control) => control,
            Self::Toggle(control) => control,
            Self::Text(control) => control,
        }
    }
}

impl SettableControl for Control {
    fn apply_value(&mut self, value: &Value) {
        self.settable().apply_value(value);
    }

    fn apply_range(&mut self, bound: RangeBound, value: &Value) {
        self.settable().apply_range(bound, value);
    }

    fn apply_step(&mut self, value: &Value) {
        self.settable().apply_step(value);
    }
}

/// A form control plus the visibility flags every kind shares.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub control: Control,
    pub visible: bool,
    pub enabled: bool,
}

impl ControlState {
    pub fn new(control: Control) -> Self {
        Self {
            control,
            visible: true,
            enabled: true,
        }
    }

    /// Unknown property names are ignored.
    pub fn apply_properties(&mut self, properties: &Map<String, Value>) {
        for (property, value) in properties {
            match property.to_lowercase().as_str() {
                "visible" => {
                    if let Some(flag) = value_as_bool(value) {
                        self.visible = flag;
                    }
                }
                "enabled" => {
                    if let Some(flag) = value_as_bool(value) {
                        self.enabled = flag;
                    }
                }
                "value" => self.control.apply_value(value),
                "minimum" | "min" => self.control.apply_range(RangeBound::Minimum, value),
                "maximum" | "max" => self.control.apply_range(RangeBound::Maximum, value),
                "step" | "singlestep" => self.control.apply_step(value),
                _ => {}
            }
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// Only finite numbers; `"NaN"` and `"inf"` parse as f64 but are not usable.
fn value_as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|number| number.is_finite())
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(raw) => Some(*raw),
        Value::Number(raw) => raw.as_f64().map(|value| value != 0.0),
        Value::String(raw) => {
            let lowered = raw.trim().to_ascii_lowercase();
            if matches!(lowered.as_str(), "1" | "true" | "yes" | "on") {
                Some(true)
            } else if matches!(lowered.as_str(), "0" | "false" | "no" | "off" | "") {
                Some(false)
            } else {
                None
            }
        }
        Value::Null => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{
        ChoiceControl, Control, ControlState, FloatControl, IntControl, TextControl,
        ToggleControl, UiConfig,
    };

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn steps() -> ControlState {
        ControlState::new(Control::Integer(IntControl {
            value: 20,
            minimum: 1,
            maximum: 150,
            step: 1,
        }))
    }

    #[test]
    fn section_groups_properties_by_control() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ui-config.json");
        std::fs::write(
            &path,
            r#"{
                "txt2img/Steps/value": 30,
                "TXT2IMG/Steps/maximum": 80,
                "txt2img/Sampler/value": "DPM++ 2M",
                "txt2img/orphan": true,
                "txt2img/Seed/": 1,
                "img2img/Steps/value": 10
            }"#,
        )?;
        let config = UiConfig::load(&path);
        assert_eq!(config.error(), None);

        let section = config.section("txt2img");
        assert_eq!(section.len(), 2);
        assert_eq!(
            Value::Object(section["Steps"].clone()),
            json!({"value": 30, "maximum": 80})
        );
        assert_eq!(section["Sampler"]["value"], json!("DPM++ 2M"));
        Ok(())
    }

    #[test]
    fn load_errors_are_recorded_not_raised() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let missing = UiConfig::load(temp.path().join("absent.json"));
        assert_eq!(missing.error(), None);
        assert!(missing.section("txt2img").is_empty());

        let list = temp.path().join("list.json");
        std::fs::write(&list, "[1, 2]")?;
        assert_eq!(
            UiConfig::load(&list).error(),
            Some("Top-level JSON structure must be an object")
        );

        let broken = temp.path().join("broken.json");
        std::fs::write(&broken, "{")?;
        assert!(UiConfig::load(&broken).error().is_some());
        Ok(())
    }

    #[test]
    fn integer_control_clamps_into_range() {
        let mut state = steps();
        state.apply_properties(&obj(json!({"max": "40", "value": 90, "step": 5.0})));
        assert_eq!(
            state.control,
            Control::Integer(IntControl {
                value: 40,
                minimum: 1,
                maximum: 40,
                step: 5,
            })
        );

        state.apply_properties(&obj(json!({"value": "12", "min": "bogus"})));
        assert_eq!(
            state.control,
            Control::Integer(IntControl {
                value: 12,
                minimum: 1,
                maximum: 40,
                step: 5,
            })
        );
    }

    #[test]
    fn float_control_accepts_numeric_strings() {
        let mut state = ControlState::new(Control::Float(FloatControl {
            value: 7.0,
            minimum: 1.0,
            maximum: 30.0,
            step: 0.5,
        }));
        state.apply_properties(&obj(json!({
            "value": "4.5",
            "singlestep": 0.25,
            "Minimum": 5,
        })));
        assert_eq!(
            state.control,
            Control::Float(FloatControl {
                value: 5.0,
                minimum: 5.0,
                maximum: 30.0,
                step: 0.25,
            })
        );
    }

    #[test]
    fn non_finite_numbers_are_ignored() {
        let original = FloatControl {
            value: 7.0,
            minimum: 1.0,
            maximum: 30.0,
            step: 0.5,
        };
        let mut state = ControlState::new(Control::Float(original.clone()));
        state.apply_properties(&obj(json!({
            "minimum": "NaN",
            "max": "inf",
            "value": "nan",
            "step": "-inf",
        })));
        assert_eq!(state.control, Control::Float(original));

        let mut steps = steps();
        let before = steps.control.clone();
        steps.apply_properties(&obj(json!({"min": "-infinity", "maximum": "NaN"})));
        assert_eq!(steps.control, before);
    }

    #[test]
    fn choice_control_matches_or_appends() {
        let mut choice = ControlState::new(Control::Choice(ChoiceControl {
            items: vec!["Euler a".to_string(), "DPM++ 2M".to_string()],
            current: Some(0),
        }));
        choice.apply_properties(&obj(json!({"value": ["dpm++ 2m", "Euler a"]})));
        let Control::Choice(inner) = &choice.control else {
            panic!("expected a choice control");
        };
        assert_eq!(inner.current_text(), Some("DPM++ 2M"));

        choice.apply_properties(&obj(json!({"value": "UniPC"})));
        choice.apply_properties(&obj(json!({"value": ""})));
        choice.apply_properties(&obj(json!({"value": []})));
        let Control::Choice(inner) = &choice.control else {
            panic!("expected a choice control");
        };
        assert_eq!(inner.items.len(), 3);
        assert_eq!(inner.current_text(), Some("UniPC"));
    }

    #[test]
    fn shared_flags_and_simple_controls() {
        let mut toggle = ControlState::new(Control::Toggle(ToggleControl::default()));
        toggle.apply_properties(&obj(json!({
            "value": "yes",
            "visible": false,
            "enabled": 0,
            "step": 3,
        })));
        assert_eq!(toggle.control, Control::Toggle(ToggleControl { checked: true }));
        assert!(!toggle.visible);
        assert!(!toggle.enabled);

        let mut text = ControlState::new(Control::Text(TextControl::default()));
        text.apply_properties(&obj(json!({"value": 42})));
        assert_eq!(
            text.control,
            Control::Text(TextControl {
                text: "42".to_string()
            })
        );
    }
}
