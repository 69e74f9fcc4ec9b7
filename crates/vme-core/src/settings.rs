//! Hierarchical settings source.
//!
//! Device settings live in a JSON-shaped tree. A device is configured from
//! one subtree (the *settings path*, e.g. `"ADC"`) which must name its
//! `model`; any key missing there is looked up in `defaults.<model>`. Keys are
//! dotted paths (`"threshold.CH03"`) walking nested objects.
//!
//! ```
//! use serde_json::json;
//! use vme_core::settings::Settings;
//!
//! let root = json!({
//!     "bridge": { "model": "V2718", "linkIndex": 0 },
//!     "defaults": { "V2718": { "boardIndex": 0 } }
//! });
//! let mut settings = Settings::load(&root, "bridge")?;
//! let link: u16 = settings.get("linkIndex")?;
//! let board: u16 = settings.get("boardIndex")?;
//! let timeout: u64 = settings.get_or("timeout", 1000)?;
//! assert_eq!((link, board, timeout), (0, 0, 1000));
//! # Ok::<(), vme_core::ConfigError>(())
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::ConfigError;

/// Static string to value table used to translate settings.
#[derive(Debug, Clone, Copy)]
pub struct Translator<T: 'static> {
    entries: &'static [(&'static str, T)],
}

impl<T: Copy + 'static> Translator<T> {
    /// Create a translator over `entries`.
    pub const fn new(entries: &'static [(&'static str, T)]) -> Self {
        Self { entries }
    }

    /// Value registered for `name`.
    pub fn lookup(&self, name: &str) -> Option<T> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|&(_, value)| value)
    }

    /// Comma separated list of accepted names.
    pub fn allowed(&self) -> String {
        self.entries
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Registered entries.
    pub fn entries(&self) -> &'static [(&'static str, T)] {
        self.entries
    }
}

/// Settings of one device with fallback to its model defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    settings_path: String,
    defaults_path: String,
    model: String,
    settings: Value,
    defaults: Value,
}

impl Settings {
    /// Load the subtree at `path` from `root`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Path`] if `path` is not an object in `root`,
    /// [`ConfigError::MissingModel`] if it has no string `model` key.
    pub fn load(root: &Value, path: &str) -> Result<Self, ConfigError> {
        Self::load_keyed(root, path, "model")
    }

    /// Load the subtree at `path`, reading the defaults selector from
    /// `model_key` instead of `model`.
    pub fn load_keyed(root: &Value, path: &str, model_key: &str) -> Result<Self, ConfigError> {
        let settings = lookup(root, path)
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| ConfigError::Path {
                path: path.to_string(),
            })?;
        let model = settings
            .get(model_key)
            .and_then(text)
            .ok_or_else(|| ConfigError::MissingModel {
                path: path.to_string(),
            })?;
        let defaults_path = format!("defaults.{model}");
        let defaults = lookup(root, &defaults_path)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        trace!(path, model = %model, "Loaded settings");

        Ok(Self {
            settings_path: path.to_string(),
            defaults_path,
            model,
            settings,
            defaults,
        })
    }

    /// Path of the settings subtree.
    pub fn path(&self) -> &str {
        &self.settings_path
    }

    /// Path of the defaults subtree (`defaults.<model>`).
    pub fn defaults_path(&self) -> &str {
        &self.defaults_path
    }

    /// Model name read from the settings subtree.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether `key` is present in settings or defaults.
    pub fn contains(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    // =========================================================================
    // Scalars
    // =========================================================================

    /// Optional scalar; `Ok(None)` when the key is absent everywhere.
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.raw(key).map(|value| self.convert(key, value)).transpose()
    }

    /// Required scalar.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get_optional(key)?
            .ok_or_else(|| self.key_error(key))
    }

    /// Scalar with fallback; a missing key is recorded in the defaults tree.
    pub fn get_or<T>(&mut self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize,
    {
        match self.get_optional(key)? {
            Some(value) => Ok(value),
            None => {
                self.materialize(key, &default)?;
                Ok(default)
            }
        }
    }

    // =========================================================================
    // Vectors
    // =========================================================================

    /// Optional vector. A scalar value reads as a one element vector.
    pub fn get_vec_optional<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Vec<T>>, ConfigError> {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        let items = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.convert(key, item))
                .collect::<Result<Vec<T>, _>>()?,
            scalar => vec![self.convert(key, scalar)?],
        };
        Ok(Some(items))
    }

    /// Required vector.
    pub fn get_vec<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ConfigError> {
        self.get_vec_optional(key)?
            .ok_or_else(|| self.key_error(key))
    }

    /// Vector with fallback; a missing key is recorded in the defaults tree.
    pub fn get_vec_or<T>(&mut self, key: &str, default: Vec<T>) -> Result<Vec<T>, ConfigError>
    where
        T: DeserializeOwned + Serialize,
    {
        match self.get_vec_optional(key)? {
            Some(values) => Ok(values),
            None => {
                self.materialize(key, &default)?;
                Ok(default)
            }
        }
    }

    // =========================================================================
    // Translation tables
    // =========================================================================

    /// Optional value translated through `table`.
    pub fn translate_optional<T: Copy>(
        &self,
        key: &str,
        table: &Translator<T>,
    ) -> Result<Option<T>, ConfigError> {
        self.raw(key)
            .map(|value| self.translate_value(key, value, table))
            .transpose()
    }

    /// Required value translated through `table`.
    pub fn translate<T: Copy>(&self, key: &str, table: &Translator<T>) -> Result<T, ConfigError> {
        self.translate_optional(key, table)?
            .ok_or_else(|| self.key_error(key))
    }

    /// Translated value with fallback to the entry named `default`.
    pub fn translate_or<T: Copy>(
        &mut self,
        key: &str,
        default: &str,
        table: &Translator<T>,
    ) -> Result<T, ConfigError> {
        if let Some(value) = self.translate_optional(key, table)? {
            return Ok(value);
        }
        let value = self.translate_value(key, &Value::String(default.to_string()), table)?;
        self.materialize(key, &default)?;
        Ok(value)
    }

    /// Optional vector translated element-wise through `table`.
    pub fn translate_vec_optional<T: Copy>(
        &self,
        key: &str,
        table: &Translator<T>,
    ) -> Result<Option<Vec<T>>, ConfigError> {
        let Some(value) = self.raw(key) else {
            return Ok(None);
        };
        let values = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.translate_value(key, item, table))
                .collect::<Result<Vec<T>, _>>()?,
            scalar => vec![self.translate_value(key, scalar, table)?],
        };
        Ok(Some(values))
    }

    /// Required vector translated element-wise through `table`.
    pub fn translate_vec<T: Copy>(
        &self,
        key: &str,
        table: &Translator<T>,
    ) -> Result<Vec<T>, ConfigError> {
        self.translate_vec_optional(key, table)?
            .ok_or_else(|| self.key_error(key))
    }

    /// Translated vector with fallback to the entries named in `default`.
    pub fn translate_vec_or<T: Copy>(
        &mut self,
        key: &str,
        default: &[&str],
        table: &Translator<T>,
    ) -> Result<Vec<T>, ConfigError> {
        if let Some(values) = self.translate_vec_optional(key, table)? {
            return Ok(values);
        }
        let values = default
            .iter()
            .map(|name| self.translate_value(key, &Value::String((*name).to_string()), table))
            .collect::<Result<Vec<T>, _>>()?;
        self.materialize(key, &default)?;
        Ok(values)
    }

    /// Optional bit pattern: the OR of all translated vector entries.
    pub fn bitpattern_optional<T>(
        &self,
        key: &str,
        table: &Translator<T>,
    ) -> Result<Option<u32>, ConfigError>
    where
        T: Copy + Into<u32>,
    {
        Ok(self
            .translate_vec_optional(key, table)?
            .map(|values| values.into_iter().fold(0, |acc, v| acc | v.into())))
    }

    /// Required bit pattern.
    pub fn bitpattern<T>(&self, key: &str, table: &Translator<T>) -> Result<u32, ConfigError>
    where
        T: Copy + Into<u32>,
    {
        self.bitpattern_optional(key, table)?
            .ok_or_else(|| self.key_error(key))
    }

    /// Bit pattern with fallback to the entries named in `default`.
    pub fn bitpattern_or<T>(
        &mut self,
        key: &str,
        default: &[&str],
        table: &Translator<T>,
    ) -> Result<u32, ConfigError>
    where
        T: Copy + Into<u32>,
    {
        Ok(self
            .translate_vec_or(key, default, table)?
            .into_iter()
            .fold(0, |acc, v| acc | v.into()))
    }

    // =========================================================================
    // Errors and persistence
    // =========================================================================

    /// Value error for `key` carrying both searched paths.
    pub fn value_error(&self, key: &str, value: impl fmt::Display) -> ConfigError {
        ConfigError::Value {
            key: key.to_string(),
            value: value.to_string(),
            settings_path: self.settings_path.clone(),
            defaults_path: self.defaults_path.clone(),
        }
    }

    /// Key-not-found error for `key` carrying both searched paths.
    pub fn key_error(&self, key: &str) -> ConfigError {
        ConfigError::KeyNotFound {
            key: key.to_string(),
            settings_path: self.settings_path.clone(),
            defaults_path: self.defaults_path.clone(),
        }
    }

    /// Write settings and defaults into `root`.
    ///
    /// The settings subtree is always written. Default keys are written only
    /// where `root` does not hold them yet, descending into nested objects.
    pub fn save(&self, root: &mut Value) {
        insert(root, &self.settings_path, self.settings.clone());
        if let Value::Object(defaults) = &self.defaults {
            for (key, value) in defaults {
                insert_missing(root, &format!("{}.{}", self.defaults_path, key), value);
            }
        }
    }

    /// Settings subtree as loaded.
    pub fn settings_tree(&self) -> &Value {
        &self.settings
    }

    /// Defaults subtree, including materialized fallbacks.
    pub fn defaults_tree(&self) -> &Value {
        &self.defaults
    }

    fn raw(&self, key: &str) -> Option<&Value> {
        lookup(&self.settings, key)
            .or_else(|| lookup(&self.defaults, key))
            .filter(|v| !v.is_null())
    }

    fn materialize<T: Serialize + ?Sized>(&mut self, key: &str, default: &T) -> Result<(), ConfigError> {
        let value = serde_json::to_value(default).map_err(|err| self.value_error(key, err))?;
        trace!(key, value = %value, defaults = %self.defaults_path, "Using default");
        insert(&mut self.defaults, key, value);
        Ok(())
    }

    fn convert<T: DeserializeOwned>(&self, key: &str, value: &Value) -> Result<T, ConfigError> {
        if let Ok(converted) = serde_json::from_value(value.clone()) {
            return Ok(converted);
        }
        // Textual literals ("1000", "true") read like their JSON counterparts
        if let Value::String(literal) = value {
            if let Ok(converted) = serde_json::from_str(literal.trim()) {
                return Ok(converted);
            }
        }
        Err(self.value_error(key, display(value)))
    }

    fn translate_value<T: Copy>(
        &self,
        key: &str,
        value: &Value,
        table: &Translator<T>,
    ) -> Result<T, ConfigError> {
        text(value)
            .and_then(|name| table.lookup(&name))
            .ok_or_else(|| ConfigError::Translation {
                key: key.to_string(),
                value: display(value),
                allowed: table.allowed(),
                settings_path: self.settings_path.clone(),
                defaults_path: self.defaults_path.clone(),
            })
    }
}

/// Resolve a dotted `key` in `tree`. A literal key containing dots wins over
/// the nested interpretation.
pub fn lookup<'a>(tree: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(value) = tree.get(key) {
        return Some(value);
    }
    let (head, rest) = key.split_once('.')?;
    lookup(tree.get(head)?, rest)
}

/// Insert `value` at dotted `key`, creating intermediate objects.
pub fn insert(tree: &mut Value, key: &str, value: Value) {
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let Value::Object(map) = tree else {
        return;
    };
    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            insert(child, rest, value);
        }
    }
}

fn insert_missing(tree: &mut Value, key: &str, value: &Value) {
    match (value, lookup(tree, key).map(Value::is_object)) {
        (_, None) => insert(tree, key, value.clone()),
        (Value::Object(children), Some(true)) => {
            for (child, child_value) in children {
                insert_missing(tree, &format!("{key}.{child}"), child_value);
            }
        }
        _ => {}
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn display(value: &Value) -> String {
    text(value).unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COLORS: Translator<u32> = Translator::new(&[("red", 0x1), ("green", 0x2), ("blue", 0x4)]);

    fn root() -> Value {
        json!({
            "board": {
                "model": "V895",
                "width": 20,
                "timeout": "1500",
                "threshold": { "CH00": -30.5 },
                "colors": ["red", "blue"],
                "color": "green",
                "enabled": true
            },
            "defaults": {
                "V895": { "coincidence": 2 }
            }
        })
    }

    #[test]
    fn test_load_requires_model() {
        let err = Settings::load(&json!({ "board": { "width": 1 } }), "board").unwrap_err();
        assert!(matches!(err, ConfigError::MissingModel { .. }));

        let err = Settings::load(&json!({}), "board").unwrap_err();
        assert!(matches!(err, ConfigError::Path { .. }));
    }

    #[test]
    fn test_settings_then_defaults() {
        let settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.defaults_path(), "defaults.V895");
        assert_eq!(settings.get::<u16>("width").unwrap(), 20);
        assert_eq!(settings.get::<u16>("coincidence").unwrap(), 2);
        assert_eq!(settings.get::<f64>("threshold.CH00").unwrap(), -30.5);
    }

    #[test]
    fn test_missing_key() {
        let settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.get_optional::<f64>("threshold.CH03").unwrap(), None);

        let err = settings.get::<f64>("threshold.CH03").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot find threshold.CH03 (in board or defaults.V895)"
        );
    }

    #[test]
    fn test_string_literals_convert() {
        let settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.get::<u64>("timeout").unwrap(), 1500);

        let err = settings.get::<u64>("color").unwrap_err();
        assert!(matches!(err, ConfigError::Value { .. }));
        assert_eq!(err.key(), Some("color"));
    }

    #[test]
    fn test_get_or_materializes_default() {
        let mut settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.get_or("deadtime", 150u32).unwrap(), 150);
        assert_eq!(settings.defaults_tree()["deadtime"], json!(150));
        // present keys do not touch the defaults tree
        assert_eq!(settings.get_or("width", 5u16).unwrap(), 20);
        assert!(settings.defaults_tree().get("width").is_none());
    }

    #[test]
    fn test_translate() {
        let mut settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.translate("color", &COLORS).unwrap(), 0x2);
        assert_eq!(settings.translate_or("missing", "blue", &COLORS).unwrap(), 0x4);

        let err = settings.translate("width", &COLORS).unwrap_err();
        match err {
            ConfigError::Translation { allowed, value, .. } => {
                assert_eq!(allowed, "red, green, blue");
                assert_eq!(value, "20");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bitpattern() {
        let mut settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.bitpattern("colors", &COLORS).unwrap(), 0x5);
        assert_eq!(settings.bitpattern("color", &COLORS).unwrap(), 0x2);
        assert_eq!(settings.bitpattern_optional("nothing", &COLORS).unwrap(), None);
        assert_eq!(
            settings.bitpattern_or("other", &["red", "green"], &COLORS).unwrap(),
            0x3
        );
    }

    #[test]
    fn test_bool_translates_by_text() {
        const BINARY: Translator<u32> = Translator::new(&[("false", 0), ("true", 1)]);
        let settings = Settings::load(&root(), "board").unwrap();
        assert_eq!(settings.translate("enabled", &BINARY).unwrap(), 1);
    }

    #[test]
    fn test_save_keeps_existing_defaults() {
        let mut settings = Settings::load(&root(), "board").unwrap();
        settings.get_or("deadtime", 150u32).unwrap();
        settings.get_or("coincidence", 9u32).unwrap();

        let mut out = json!({ "defaults": { "V895": { "coincidence": 3 } } });
        settings.save(&mut out);

        assert_eq!(out["board"]["width"], json!(20));
        assert_eq!(out["defaults"]["V895"]["deadtime"], json!(150));
        assert_eq!(out["defaults"]["V895"]["coincidence"], json!(3));
    }

    #[test]
    fn test_save_merges_nested_defaults() {
        let mut settings = Settings::load(&root(), "board").unwrap();
        settings.get_or("threshold.CH07", -40).unwrap();

        let mut out = json!({ "defaults": { "V895": { "threshold": { "CH01": -10 } } } });
        settings.save(&mut out);

        assert_eq!(out["defaults"]["V895"]["threshold"]["CH01"], json!(-10));
        assert_eq!(out["defaults"]["V895"]["threshold"]["CH07"], json!(-40));
        assert_eq!(out["defaults"]["V895"]["coincidence"], json!(2));
    }

    #[test]
    fn test_insert_nested() {
        let mut tree = json!({});
        insert(&mut tree, "a.b.c", json!(1));
        assert_eq!(lookup(&tree, "a.b.c"), Some(&json!(1)));
    }
}
