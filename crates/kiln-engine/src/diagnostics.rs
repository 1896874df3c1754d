//! Diagnostic bundles for internal errors.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::EngineError;

/// Directory under the output root receiving bundles.
pub const DIAGNOSTICS_DIR: &str = ".diagnostics";

#[derive(Debug, Serialize)]
struct Bundle<'a> {
    error: String,
    debug: String,
    kiln_version: &'a str,
    host: String,
    os: &'a str,
    arch: &'a str,
    created_at: u64,
    targets: &'a [String],
    config: Option<String>,
}

/// Write a bundle describing `error` and return its path.
///
/// The bundle is a JSON file holding the error, engine version, host,
/// requested targets and the repository configuration as read.
///
/// # Errors
/// Returns an error if the bundle cannot be written.
pub fn write_bundle(
    output_root: &Path,
    repo_root: &Path,
    error: &EngineError,
    targets: &[String],
) -> Result<PathBuf, EngineError> {
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let bundle = Bundle {
        error: error.to_string(),
        debug: format!("{error:?}"),
        kiln_version: crate::KILN_VERSION,
        host: kiln_util::process::hostname(),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        created_at,
        targets,
        config: std::fs::read_to_string(repo_root.join("kiln.toml")).ok(),
    };
    let json = serde_json::to_vec_pretty(&bundle).map_err(|e| EngineError::Metadata {
        message: e.to_string(),
    })?;

    let dir = output_root.join(DIAGNOSTICS_DIR);
    kiln_util::fs::ensure_dir(&dir)?;
    let path = dir.join(format!("internal-{created_at}-{}.json", std::process::id()));
    std::fs::write(&path, json).map_err(|source| EngineError::io(&path, source))?;
    Ok(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bundle_records_error_and_config() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("kiln.toml"), "[build]\nkeep_going = true\n").unwrap();
        let out = repo.path().join("kiln-out");
        let error = EngineError::Internal {
            message: "node 7 has no result".to_owned(),
        };
        let path = write_bundle(&out, repo.path(), &error, &["//...".to_owned()]).unwrap();
        assert!(path.starts_with(out.join(".diagnostics")));

        let bundle: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(bundle["error"], "internal error: node 7 has no result");
        assert_eq!(bundle["targets"][0], "//...");
        assert!(bundle["config"].as_str().unwrap().contains("keep_going"));
    }

    #[test]
    fn missing_config_is_null() {
        let repo = tempfile::tempdir().unwrap();
        let error = EngineError::Internal {
            message: "x".to_owned(),
        };
        let path = write_bundle(&repo.path().join("out"), repo.path(), &error, &[]).unwrap();
        let bundle: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(bundle["config"].is_null());
    }
}
