//! Error types for kiln-engine.

/// Errors produced by engine operations.
///
/// Action failures are not errors: they are recorded on the failing node and
/// reported in the build summary. Everything here stops the invocation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A filesystem operation failed.
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// A utility operation failed.
    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),

    /// A configuration file is unreadable or invalid.
    #[error("{0}")]
    Config(#[from] kiln_config::ConfigError),

    /// A declared source file does not exist.
    #[error("{target}: source `{path}` does not exist")]
    MissingInput { target: String, path: String },

    /// A tool could not be located or fingerprinted.
    #[error("tool `{tool}` is unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    /// A target attribute has the wrong type or an illegal value.
    #[error("{target}: attribute `{attr}` {message}")]
    MalformedAttribute {
        target: String,
        attr: String,
        message: String,
    },

    /// A target names a rule kind that does not exist.
    #[error("{target}: unknown rule `{rule}` (expected one of: genrule, command, export_file)")]
    UnknownRule { target: String, rule: String },

    /// A target id or reference cannot be parsed.
    #[error("invalid target `{value}`: {reason}")]
    InvalidTargetId { value: String, reason: String },

    /// The target or action graph contains a cycle.
    #[error("dependency cycle detected: {cycle}")]
    GraphCycle { cycle: String },

    /// Two actions declare the same output path.
    #[error("output `{path}` is declared by both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    /// A dependency refers to a target or output that does not exist.
    #[error("{from} depends on {missing}, which does not exist")]
    DanglingDependency { from: String, missing: String },

    /// Two targets share the same id.
    #[error("target {target} is defined more than once")]
    DuplicateTarget { target: String },

    /// A requested target does not exist.
    #[error("no target matches `{target}`")]
    UnknownTarget { target: String },

    /// A cache entry exists but cannot be decoded.
    #[error("cache entry {key} is corrupt: {message}")]
    CacheCorrupt { key: String, message: String },

    /// No cache entry exists for a key that was expected to be present.
    #[error("no cache entry for {key}")]
    CacheEntryMissing { key: String },

    /// Cache metadata serialization/deserialization failed.
    #[error("cannot process metadata: {message}")]
    Metadata { message: String },

    /// The invocation was cancelled.
    #[error("build cancelled")]
    Cancelled,

    /// A repository already exists at the target path.
    #[error("kiln.toml already exists at {path}; refusing to initialize over an existing repository")]
    ProjectExists { path: String },

    /// An engine invariant was violated.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad target descriptions, attributes, sources, or tools.
    Input,
    /// Structural problems in the target or action graph.
    Graph,
    /// Invalid configuration or command-line usage.
    Config,
    /// Artifact store failures outside of an action.
    Cache,
    /// The invocation was cancelled.
    Cancelled,
    /// Filesystem trouble or an invariant violation.
    Internal,
}

impl EngineError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingInput { .. }
            | Self::ToolUnavailable { .. }
            | Self::MalformedAttribute { .. }
            | Self::UnknownRule { .. }
            | Self::InvalidTargetId { .. } => ErrorKind::Input,
            Self::GraphCycle { .. }
            | Self::DuplicateOutput { .. }
            | Self::DanglingDependency { .. }
            | Self::DuplicateTarget { .. }
            | Self::UnknownTarget { .. } => ErrorKind::Graph,
            Self::Config(_) | Self::ProjectExists { .. } => ErrorKind::Config,
            Self::CacheCorrupt { .. } | Self::CacheEntryMissing { .. } | Self::Metadata { .. } => {
                ErrorKind::Cache
            }
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io { .. } | Self::Util(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Process exit code for an invocation that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Cancelled => 130,
            ErrorKind::Input | ErrorKind::Graph | ErrorKind::Config | ErrorKind::Internal => 2,
            ErrorKind::Cache => 1,
        }
    }

    /// Whether this error should produce a diagnostic bundle.
    pub fn wants_diagnostics(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}
