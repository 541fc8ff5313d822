use std::fmt;

use iris_abi::EngineError;
use thiserror::Error;

/// Which native call of the load sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    Model,
    Context,
    Batch,
    Sampler,
    EndOfTurnMarker,
}

impl fmt::Display for LoadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadStep::Model => "load-model",
            LoadStep::Context => "create-context",
            LoadStep::Batch => "create-batch",
            LoadStep::Sampler => "create-sampler",
            LoadStep::EndOfTurnMarker => "fetch-end-of-turn-marker",
        };
        f.write_str(s)
    }
}

/// A load attempt failed; nothing from it is retained and the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model load failed at {step}: {source}")]
pub struct LoadError {
    pub step: LoadStep,
    #[source]
    pub source: EngineError,
}

/// Contract violations: the call is not valid in the current lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidState {
    #[error("a model is already loaded; unload it first")]
    AlreadyLoaded,

    #[error("a model load is already in progress")]
    LoadInProgress,

    #[error("no model is loaded")]
    NotLoaded,

    #[error("a generation is already in flight; use try_enqueue or submit")]
    GenerationInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("invalid state: {0}")]
    InvalidState(#[from] InvalidState),

    /// Backpressure: surface to the user, don't retry automatically.
    #[error("admission queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The engine failed mid-generation or during an auxiliary call.
    #[error("engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("engine worker is not running")]
    WorkerUnavailable,

    #[error("failed to spawn engine worker: {0}")]
    WorkerSpawn(String),
}

impl CoordinatorError {
    /// Soft errors are advisory (show a hint, keep the UI usable).
    pub fn is_soft(&self) -> bool {
        matches!(self, CoordinatorError::QueueFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
