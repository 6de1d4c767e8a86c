//! Error types for the two seams a caller is expected to match on:
//! configuration loading and agent startup. Everything else in the core
//! (gather/write/flush glue) propagates `anyhow::Result`, matching how the
//! reference inputs and outputs report their own failures.

use thiserror::Error;

/// Fatal failures that can occur while bringing an [`crate::agent::Agent`]
/// up. Each of these aborts startup; see the error handling design in
/// `SPEC_FULL.md` §7.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to initialize {0}")]
    Init(String, #[source] anyhow::Error),

    #[error("failed to connect output {0} after one retry")]
    Connect(String, #[source] anyhow::Error),
}
