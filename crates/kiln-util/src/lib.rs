#![forbid(unsafe_code)]
//! Fingerprinting, filesystem, and process primitives for Kiln.

pub mod cancel;
pub mod error;
pub mod fs;
pub mod hash;
pub mod path;
pub mod process;

pub use cancel::CancelToken;
pub use hash::{Digest, Fingerprint, Fingerprintable};
pub use path::RepoPath;
