//! Live-settings protocol shared by every injector.
//!
//! `options()` describes each recognized key with a title, a description, a
//! UI type and the current value. `set_options` takes a partial JSON object;
//! unknown keys are ignored, recognized keys with the wrong shape are rejected.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::injectors::InjectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Text,
    Checkbox,
    Json,
    File,
    Directory,
    Entry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionField {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    pub value: Value,
}

impl OptionField {
    pub fn new(kind: OptionKind, title: &str, description: &str, value: Value) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            kind,
            value,
        }
    }
}

pub type OptionSet = BTreeMap<String, OptionField>;

fn invalid(key: &str, expected: &str) -> InjectorError {
    InjectorError::InvalidOption {
        key: key.to_string(),
        reason: format!("expected {expected}"),
    }
}

pub fn as_bool(key: &str, value: &Value) -> Result<bool, InjectorError> {
    value.as_bool().ok_or_else(|| invalid(key, "a boolean"))
}

pub fn as_u64(key: &str, value: &Value) -> Result<u64, InjectorError> {
    value.as_u64().ok_or_else(|| invalid(key, "a non-negative integer"))
}

pub fn as_string(key: &str, value: &Value) -> Result<String, InjectorError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, "a string"))
}

/// A list of strings; a single string counts as a list of one.
pub fn as_string_list(key: &str, value: &Value) -> Result<Vec<String>, InjectorError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(key, "a list of strings"))
            })
            .collect(),
        _ => Err(invalid(key, "a list of strings")),
    }
}

pub fn as_string_map(key: &str, value: &Value) -> Result<BTreeMap<String, String>, InjectorError> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(key, "an object of strings"))?;
    object
        .iter()
        .map(|(name, value)| {
            value
                .as_str()
                .map(|v| (name.clone(), v.to_string()))
                .ok_or_else(|| invalid(key, "an object of strings"))
        })
        .collect()
}

pub fn as_dirs(key: &str, value: &Value) -> Result<Vec<PathBuf>, InjectorError> {
    Ok(as_string_list(key, value)?
        .into_iter()
        .map(PathBuf::from)
        .collect())
}

pub fn dirs_value(dirs: &[PathBuf]) -> Value {
    Value::Array(
        dirs.iter()
            .map(|d| Value::String(d.to_string_lossy().into_owned()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_serializes_type_key() {
        let field = OptionField::new(OptionKind::Checkbox, "Delay", "Replay timing", json!(false));
        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(value["type"], "checkbox");
        assert_eq!(value["value"], false);
    }

    #[test]
    fn typed_extractors_reject_wrong_shapes() {
        assert!(as_bool("delay", &json!(true)).unwrap());
        assert!(as_bool("delay", &json!("yes")).is_err());
        assert_eq!(as_string_list("d", &json!("one")).unwrap(), ["one"]);
        assert!(as_string_list("d", &json!([1, 2])).is_err());
        assert_eq!(as_string_map("h", &json!({"a": "b"})).unwrap()["a"], "b");
        assert!(as_string_map("h", &json!({"a": 1})).is_err());
        assert_eq!(as_u64("t", &json!(30)).unwrap(), 30);
    }
}
