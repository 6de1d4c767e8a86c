//! The one piece of global mutable state in the agent: a set-once version
//! string, reported in logs and in a couple of sample outputs. Anything
//! beyond this is threaded explicitly through the pipeline rather than
//! kept in statics.

use std::sync::OnceLock;

static VERSION: OnceLock<String> = OnceLock::new();

/// Records the running agent's version. Fails if a version has already
/// been set; an embedding binary should call this once, near the start of
/// `main`.
pub fn set(version: impl Into<String>) -> Result<(), String> {
    let version = version.into();
    VERSION.set(version.clone()).map_err(|_| version)
}

/// Returns the previously [`set`] version, or `"unknown"` if none was set.
pub fn get() -> &'static str {
    VERSION.get().map(String::as_str).unwrap_or("unknown")
}
