//! Iris core: coordinates many callers onto one single-threaded inference
//! engine.
//!
//! - [`RequestCoordinator`] is the entry point.
//! - Admission is bounded ([`AdmissionQueue`]) and observed by a sliding
//!   window limiter ([`RateLimitWindow`]).
//! - Token pacing follows [`ThermalPolicy`].
//! - Each generation is a [`StreamingSession`] driven on the engine worker.

pub mod admission;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod global;
pub mod lifecycle;
pub mod rate_limit;
pub mod scripted;
pub mod session;
pub mod thermal;

pub use admission::{AdmissionQueue, Enqueue};
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoordinatorConfig;
pub use coordinator::{Admission, RequestCoordinator, Reservation, TokenStream};
pub use error::{CoordinatorError, InvalidState, LoadError, LoadStep, Result};
pub use lifecycle::{LoadRequest, LoadedModel, ModelInfo, ModelLifecycle};
pub use rate_limit::{RateLimitConfig, RateLimitWindow};
pub use scripted::ScriptedEngine;
pub use session::{
    EndOfTurnDetector, FinishReason, SessionId, SessionLimits, SessionOutcome, SessionState,
    SessionStats, StreamingSession, Termination,
};
pub use thermal::{compute_stream_delay, DegradationDelays, ThermalPolicy, ThermalSignal};

pub use iris_abi::{EngineError, NativeEngine, SamplingParams};
