//! Repository scaffolding for `kiln init`.

use std::path::Path;

use kiln_config::Config;

use crate::error::EngineError;

const SAMPLE_BUILD: &str = r#"[[target]]
name = "hello"
rule = "export_file"
src = "hello.txt"

[[target]]
name = "shout"
rule = "genrule"
srcs = [":hello"]
outs = ["shout.txt"]
cmd = "tr a-z A-Z < $SRCS > $OUT"
"#;

/// Scaffold a new Kiln repository in `dir`.
///
/// Creates the directory (if it doesn't exist), a `kiln.toml` with default
/// settings, a sample `BUILD.toml` with two targets, its input file, and a
/// `.gitignore` for the output and cache directories.
///
/// # Errors
/// Returns an error if:
/// - A `kiln.toml` already exists in `dir`
/// - The directory or files cannot be created
/// - The configuration cannot be serialized
pub fn init_repo(dir: &Path) -> Result<(), EngineError> {
    let config_path = dir.join("kiln.toml");
    if config_path.exists() {
        return Err(EngineError::ProjectExists {
            path: config_path.display().to_string(),
        });
    }
    kiln_util::fs::ensure_dir(dir)?;

    let config = Config::default();
    write(&config_path, &config.to_toml_string()?)?;
    write(&dir.join("BUILD.toml"), SAMPLE_BUILD)?;
    write(&dir.join("hello.txt"), "hello from kiln\n")?;
    write(
        &dir.join(".gitignore"),
        &format!("/{}/\n/.kiln/\n", config.build.output_dir),
    )?;
    Ok(())
}

fn write(path: &Path, content: &str) -> Result<(), EngineError> {
    std::fs::write(path, content).map_err(|source| EngineError::io(path, source))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;
    use crate::graph::TargetGraph;

    #[test]
    fn init_creates_loadable_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fresh");
        init_repo(&dir).unwrap();

        assert!(dir.join("kiln.toml").is_file());
        assert!(dir.join("hello.txt").is_file());
        let config = Config::from_path(&dir.join("kiln.toml")).unwrap();
        assert_eq!(config, Config::default());

        let graph = TargetGraph::load(&dir, &config).unwrap();
        assert_eq!(graph.len(), 2);
        let gitignore = fs::read_to_string(dir.join(".gitignore")).unwrap();
        assert!(gitignore.contains("/kiln-out/"));
    }

    #[test]
    fn init_refuses_existing_repo() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("kiln.toml"), "").unwrap();
        let err = init_repo(tmp.path()).unwrap_err();
        assert!(matches!(err, EngineError::ProjectExists { .. }));
        assert!(!tmp.path().join("BUILD.toml").exists());
    }
}
