//! Configuration file loading using Figment
//!
//! Experiment configuration files are settings trees: a `bridge`, an `ADC`,
//! an `experiment` section and optional `defaults.<model>` sections. They
//! are read from JSON or TOML into a [`serde_json::Value`] that the device
//! drivers resolve with [`vme_core::Settings`].
//!
//! # Example
//! ```no_run
//! use vme_daq::config::load_tree;
//!
//! let tree = load_tree("config/example.json")?;
//! println!("bridge model: {}", tree["bridge"]["model"]);
//! # Ok::<(), vme_core::ConfigError>(())
//! ```

use std::path::Path;

use figment::{
    providers::{Format, Json, Toml},
    Figment,
};
use serde_json::Value;
use tracing::debug;
use vme_core::ConfigError;

/// Supported file formats, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// `.json`
    Json,
    /// `.toml`
    Toml,
}

impl FileFormat {
    /// Format of `path`, if its extension is known.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Read the settings tree in `path`.
///
/// # Errors
///
/// [`ConfigError::Path`] for an unknown extension, [`ConfigError::Load`]
/// when the file is missing or malformed.
pub fn load_tree(path: impl AsRef<Path>) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path).ok_or_else(|| ConfigError::Path {
        path: path.display().to_string(),
    })?;
    if !path.is_file() {
        return Err(ConfigError::Load {
            source_name: path.display().to_string(),
            message: "file not found".to_string(),
        });
    }

    let figment = match format {
        FileFormat::Json => Figment::new().merge(Json::file(path)),
        FileFormat::Toml => Figment::new().merge(Toml::file(path)),
    };
    let tree: Value = figment.extract().map_err(|err| ConfigError::Load {
        source_name: path.display().to_string(),
        message: err.to_string(),
    })?;

    debug!(path = %path.display(), ?format, "Loaded configuration");
    Ok(tree)
}
