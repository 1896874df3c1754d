use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// The `kiln.toml` repository configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub project: ProjectSection,
    pub build: BuildSection,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectSection {
    /// Cell name used as the prefix of every target id.
    pub cell: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            cell: "root".to_owned(),
        }
    }
}

/// How cached outputs are placed into the output directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterializeMode {
    Copy,
    #[default]
    Hardlink,
}

/// The `[build]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    /// Worker threads; defaults to the host CPU count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub keep_going: bool,
    /// Absolute path of the artifact cache; defaults to `<repo>/.kiln/cache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_max_bytes: Option<u64>,
    pub materialize_mode: MaterializeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_default_timeout_ms: Option<u64>,
    pub kill_grace_ms: u64,
    pub lru_capacity: usize,
    pub event_buffer: usize,
    /// Repository-relative directory receiving materialized outputs.
    pub output_dir: String,
    /// Mixed into every rule key; changing it invalidates the whole cache.
    pub rule_key_seed: String,
    pub keep_sandboxes: bool,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            concurrency: None,
            keep_going: false,
            cache_dir: None,
            cache_max_bytes: None,
            materialize_mode: MaterializeMode::default(),
            action_default_timeout_ms: None,
            kill_grace_ms: 2000,
            lru_capacity: 1024,
            event_buffer: 4096,
            output_dir: "kiln-out".to_owned(),
            rule_key_seed: String::new(),
            keep_sandboxes: false,
        }
    }
}

/// A pinned tool in the `[tools]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Path to the executable, absolute or relative to the repository root.
    pub path: PathBuf,
    /// Optional version label; keyed alongside the binary digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Config {
    /// Read, parse and validate a `kiln.toml` from the given path.
    /// Returns the default configuration if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate configuration text. `origin` is used in errors.
    ///
    /// # Errors
    /// Returns an error if the text is invalid TOML or fails validation.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.display().to_string(),
            source: e,
        })?;
        config.validate(origin)?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: origin.display().to_string(),
            message,
        };

        if !is_valid_cell(&self.project.cell) {
            return Err(invalid(format!(
                "project.cell `{}` must be non-empty and use only [A-Za-z0-9_-]",
                self.project.cell
            )));
        }
        let build = &self.build;
        if build.concurrency == Some(0) {
            return Err(invalid("build.concurrency must be at least 1".to_owned()));
        }
        if let Some(dir) = &build.cache_dir {
            if !dir.is_absolute() {
                return Err(invalid(format!(
                    "build.cache_dir `{}` must be an absolute path",
                    dir.display()
                )));
            }
        }
        if build.lru_capacity == 0 {
            return Err(invalid("build.lru_capacity must be at least 1".to_owned()));
        }
        if build.event_buffer == 0 {
            return Err(invalid("build.event_buffer must be at least 1".to_owned()));
        }
        let out = Path::new(&build.output_dir);
        if build.output_dir.is_empty()
            || out.is_absolute()
            || out.components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(invalid(format!(
                "build.output_dir `{}` must be a relative path inside the repository",
                build.output_dir
            )));
        }
        for (name, tool) in &self.tools {
            if name.is_empty() || name.contains(['/', ' ']) {
                return Err(invalid(format!("tool name `{name}` is not valid")));
            }
            if tool.path.as_os_str().is_empty() {
                return Err(invalid(format!("tools.{name}.path must not be empty")));
            }
        }
        Ok(())
    }

    /// Worker count, falling back to the host's available parallelism.
    pub fn concurrency(&self) -> usize {
        self.build.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    /// Absolute cache directory for a repository rooted at `repo_root`.
    pub fn cache_dir(&self, repo_root: &Path) -> PathBuf {
        self.build
            .cache_dir
            .clone()
            .unwrap_or_else(|| repo_root.join(".kiln").join("cache"))
    }

    /// Absolute output directory for a repository rooted at `repo_root`.
    pub fn output_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.build.output_dir)
    }

    /// Serialize to human-readable TOML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize {
            what: "kiln.toml".to_owned(),
            source,
        })
    }
}

fn is_valid_cell(cell: &str) -> bool {
    !cell.is_empty()
        && cell
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config, ConfigError> {
        Config::parse(content, Path::new("kiln.toml"))
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.project.cell, "root");
        assert_eq!(config.build.kill_grace_ms, 2000);
        assert_eq!(config.build.lru_capacity, 1024);
        assert_eq!(config.build.event_buffer, 4096);
        assert_eq!(config.build.output_dir, "kiln-out");
        assert_eq!(config.build.materialize_mode, MaterializeMode::Hardlink);
        assert!(!config.build.keep_going);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(&dir.path().join("kiln.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_full_build_section() {
        let config = parse(
            r#"
[project]
cell = "mono"

[build]
concurrency = 4
keep_going = true
cache_dir = "/var/cache/kiln"
cache_max_bytes = 1048576
materialize_mode = "copy"
action_default_timeout_ms = 60000
kill_grace_ms = 500
rule_key_seed = "v2"

[tools]
cc = { path = "/usr/bin/cc", version = "13.2" }
"#,
        )
        .unwrap();
        assert_eq!(config.project.cell, "mono");
        assert_eq!(config.concurrency(), 4);
        assert!(config.build.keep_going);
        assert_eq!(config.cache_dir(Path::new("/repo")), PathBuf::from("/var/cache/kiln"));
        assert_eq!(config.build.cache_max_bytes, Some(1_048_576));
        assert_eq!(config.build.materialize_mode, MaterializeMode::Copy);
        assert_eq!(config.build.action_default_timeout_ms, Some(60_000));
        assert_eq!(config.build.kill_grace_ms, 500);
        assert_eq!(config.build.rule_key_seed, "v2");
        let cc = config.tools.get("cc").unwrap();
        assert_eq!(cc.path, PathBuf::from("/usr/bin/cc"));
        assert_eq!(cc.version.as_deref(), Some("13.2"));
    }

    #[test]
    fn default_cache_dir_is_under_repo() {
        let config = Config::default();
        assert_eq!(
            config.cache_dir(Path::new("/repo")),
            PathBuf::from("/repo/.kiln/cache")
        );
        assert_eq!(
            config.output_dir(Path::new("/repo")),
            PathBuf::from("/repo/kiln-out")
        );
    }

    #[test]
    fn default_concurrency_is_positive() {
        assert!(Config::default().concurrency() >= 1);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = parse("[build]\nconcurrency = 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn rejects_relative_cache_dir() {
        let err = parse("[build]\ncache_dir = \"cache\"\n").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn rejects_escaping_output_dir() {
        assert!(parse("[build]\noutput_dir = \"../out\"\n").is_err());
        assert!(parse("[build]\noutput_dir = \"/tmp/out\"\n").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(parse("[build]\nconcurency = 2\n").is_err());
        assert!(parse("[bogus]\nx = 1\n").is_err());
    }

    #[test]
    fn rejects_unknown_materialize_mode() {
        assert!(parse("[build]\nmaterialize_mode = \"symlink\"\n").is_err());
    }

    #[test]
    fn rejects_bad_cell() {
        assert!(parse("[project]\ncell = \"a/b\"\n").is_err());
        assert!(parse("[project]\ncell = \"\"\n").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = Config::default();
        config.build.concurrency = Some(2);
        config.tools.insert(
            "protoc".to_owned(),
            ToolSpec {
                path: PathBuf::from("tools/protoc"),
                version: None,
            },
        );
        let text = config.to_toml_string().unwrap();
        assert_eq!(parse(&text).unwrap(), config);
    }
}
