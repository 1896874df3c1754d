use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

/// File name marking a directory as a package.
pub const BUILD_FILE: &str = "BUILD.toml";

/// A parsed `BUILD.toml`: the targets declared by one package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
    #[serde(default, rename = "target", skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<RawTarget>,
}

/// One `[[target]]` table before rule-specific validation.
///
/// Attribute values stay as untyped TOML; the engine checks them against
/// the schema of `rule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTarget {
    pub name: String,
    pub rule: String,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, toml::Value>,
}

impl BuildFile {
    /// Read and parse a `BUILD.toml` from the given path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains invalid TOML.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Parse `BUILD.toml` text. `origin` is used in errors.
    ///
    /// # Errors
    /// Returns an error if the text is invalid TOML or a target name is empty.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file: BuildFile = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.display().to_string(),
            source: e,
        })?;
        for target in &file.targets {
            if target.name.is_empty() || target.name.contains(['/', ':']) {
                return Err(ConfigError::Invalid {
                    path: origin.display().to_string(),
                    message: format!(
                        "target name `{}` must be non-empty and contain no `/` or `:`",
                        target.name
                    ),
                });
            }
        }
        Ok(file)
    }

    /// Serialize to human-readable TOML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize {
            what: BUILD_FILE.to_owned(),
            source,
        })
    }
}
