use thiserror::Error;

/// Failure classification for one pipeline invocation. Every variant is a
/// terminal, structured outcome for that request; nothing here should ever
/// take down the host process.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The language-model call failed, timed out, or returned an
    /// empty/unusable response.
    #[error("language model request failed: {0}")]
    Upstream(String),

    /// The generated script raised an engine error while running,
    /// including exhaustion of the wall-clock budget.
    #[error("script execution failed: {0}")]
    Execution(String),

    /// The script ran to completion but the output binding is missing or
    /// not a readable table.
    #[error("script produced no usable table: {0}")]
    InvalidOutput(String),

    /// The script produced a valid table with zero rows and the caller
    /// opted into treating that as a failure.
    #[error("script produced an empty table")]
    EmptyResult,
}

impl PipelineError {
    /// Stable identifier for wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Upstream(_) => "upstream_error",
            PipelineError::Execution(_) => "execution_error",
            PipelineError::InvalidOutput(_) => "invalid_output",
            PipelineError::EmptyResult => "empty_result",
        }
    }
}
