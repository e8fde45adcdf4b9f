use std::process::ExitStatus;

use thiserror::Error;

/// Error domain for the whole agent. The HTTP handler is the single place
/// where these are translated into wire responses.
#[derive(Debug, Error)]
pub enum AgentErr {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no command registered for resource `{resource}`")]
    Resolution { resource: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process `{program}` failed: {status}")]
    Pipeline { program: String, status: ExitStatus },

    #[error("failed to acquire execution permit: {0}")]
    Admission(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
