//! Parse and validate `kiln.toml` and `BUILD.toml`.

pub mod config;
pub mod error;
pub mod targets;

pub use config::{BuildSection, Config, MaterializeMode, ToolSpec};
pub use error::ConfigError;
pub use targets::{BuildFile, RawTarget};
