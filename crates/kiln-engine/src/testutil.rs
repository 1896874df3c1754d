//! Shared fixtures for unit tests.

#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use kiln_config::Config;
use kiln_util::hash::sha256_bytes;

use crate::graph::TargetGraph;
use crate::tools::{StaticToolResolver, ToolIdentity};

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

pub fn load_graph(root: &Path) -> TargetGraph {
    TargetGraph::load(root, &Config::default()).unwrap()
}

fn tool(name: &str, path: &str) -> ToolIdentity {
    ToolIdentity {
        name: name.to_owned(),
        path: PathBuf::from(path),
        digest: sha256_bytes(name.as_bytes()),
        version: None,
    }
}

/// `sh`, `cp`, `cat` and `true` at their usual system locations.
pub fn static_tools() -> StaticToolResolver {
    StaticToolResolver::new()
        .with(tool("sh", "/bin/sh"))
        .with(tool("cp", "/bin/cp"))
        .with(tool("cat", "/bin/cat"))
        .with(tool("true", "/bin/true"))
}
