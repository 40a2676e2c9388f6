use std::path::PathBuf;

use thiserror::Error;

/// Reasons a model load attempt can fail. All of them leave the manager without a handle.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model not found: {0}")]
    NotFound(PathBuf),

    #[error("incompatible model format: {0}")]
    IncompatibleFormat(String),

    #[error("insufficient memory to load model: {0}")]
    InsufficientMemory(String),

    #[error("model load failed: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Cooperative stop requested by the control surface.
    #[error("generation cancelled")]
    Cancelled,

    #[error("insufficient memory during generation: {0}")]
    InsufficientMemory(String),

    #[error("generation failed: {0}")]
    RuntimeFailure(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("unexpected generation error: {0}")]
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),
}

/// Failures of optional engine features.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned synchronously by orchestrator commands, before any work is dispatched.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("a model load or generation is already running")]
    Busy,

    #[error("no model loaded")]
    NoModel,

    #[error(transparent)]
    InvalidRequest(#[from] GenerationError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to clear the gallery: {0}")]
    Gallery(#[from] PersistError),

    #[error("failed to clear the prompt history: {0}")]
    History(#[from] HistoryError),
}

/// Maps an engine-side failure message onto the generation taxonomy.
pub(crate) fn classify_generation_failure(err: &anyhow::Error) -> GenerationError {
    let message = format!("{err:#}");
    if is_out_of_memory(&message) {
        GenerationError::InsufficientMemory(message)
    } else {
        GenerationError::RuntimeFailure(message)
    }
}

pub(crate) fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory") || lower.contains("cuda_error_out_of_memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_messages_are_classified() {
        let err = anyhow::anyhow!("CUDA out of memory. Tried to allocate 2.00 GiB");
        assert!(matches!(
            classify_generation_failure(&err),
            GenerationError::InsufficientMemory(_)
        ));

        let err = anyhow::anyhow!("shape mismatch in unet");
        assert!(matches!(
            classify_generation_failure(&err),
            GenerationError::RuntimeFailure(_)
        ));
    }
}
