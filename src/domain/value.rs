//! Dynamic variable bag: the tagged value variant fed to the templating engine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A template variable after normalisation.
///
/// Whatever shape the decoder hands us (JSON scalars, arrays, objects) is
/// reduced to this closed set before the engine runs. Whole numbers prefer
/// the integer representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<TemplateValue>),
    Map(TemplateMap),
}

impl TemplateValue {
    /// Normalise an arbitrary JSON value into the variant set.
    pub fn from_json(value: Json) -> Self {
        match value {
            Json::Null => TemplateValue::Null,
            Json::Bool(flag) => TemplateValue::Bool(flag),
            Json::Number(number) => match number.as_i64() {
                Some(whole) => TemplateValue::Int(whole),
                None => TemplateValue::Float(number.as_f64().unwrap_or_default()),
            },
            Json::String(text) => TemplateValue::String(text),
            Json::Array(items) => {
                TemplateValue::List(items.into_iter().map(TemplateValue::from_json).collect())
            }
            Json::Object(entries) => TemplateValue::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, TemplateValue::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TemplateValue::Null)
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::String(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::String(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Int(value)
    }
}

impl From<f64> for TemplateValue {
    fn from(value: f64) -> Self {
        TemplateValue::Float(value)
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Bool(value)
    }
}

/// String-keyed mapping with preserved insertion order and
/// case-insensitive lookup (an exact match always wins).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateMap(IndexMap<String, TemplateValue>);

impl TemplateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: TemplateValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&TemplateValue> {
        if let Some(value) = self.0.get(key) {
            return Some(value);
        }
        self.0
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TemplateValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, TemplateValue)> for TemplateMap {
    fn from_iter<I: IntoIterator<Item = (String, TemplateValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
