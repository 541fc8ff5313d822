//! `Idle` ⇄ `Loaded` state machine over the engine's native handles.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use iris_abi::{
    BatchHandle, ContextHandle, ContextParams, EngineError, EngineHandle, ModelHandle,
    NativeEngine, SamplerHandle, SamplingParams,
};
use serde::Serialize;

use crate::error::{InvalidState, LoadError, LoadStep, Result};

/// Upper bound for the automatic thread count; phones throttle past this.
pub const MAX_AUTO_THREADS: usize = 4;

/// `0` = auto: physical cores, at most `MAX_AUTO_THREADS`.
pub fn resolve_threads(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    num_cpus::get_physical().clamp(1, MAX_AUTO_THREADS)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub n_threads: usize,
    pub seed: Option<u64>,
    pub sampling: SamplingParams,
}

impl LoadRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            n_threads: 0,
            seed: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// What callers may know about the loaded model. Handles stay private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub path: PathBuf,
    pub end_of_turn_marker: String,
    pub n_threads: usize,
    pub context_size: usize,
    pub loaded_at: SystemTime,
    pub load_ms: u64,
}

static MODEL_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_model_id(at: SystemTime) -> String {
    let ms = at.duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    let seq = MODEL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("model_{ms}_{seq}")
}

#[derive(Debug)]
pub struct LoadedModel {
    handle: EngineHandle,
    end_of_turn_marker: String,
    info: ModelInfo,
    /// The KV cache holds leftovers from an interrupted session or an embedding.
    dirty: bool,
}

impl LoadedModel {
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn end_of_turn_marker(&self) -> &str {
        &self.end_of_turn_marker
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn needs_reset(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

#[derive(Debug, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Loaded(LoadedModel),
}

/// Handles created so far by an in-progress load.
#[derive(Default)]
struct Partial {
    model: Option<ModelHandle>,
    context: Option<ContextHandle>,
    batch: Option<BatchHandle>,
    sampler: Option<SamplerHandle>,
}

impl Partial {
    fn release<E: NativeEngine + ?Sized>(self, engine: &mut E) {
        if let Some(s) = self.sampler {
            engine.free_sampler(s);
        }
        if let Some(b) = self.batch {
            engine.free_batch(b);
        }
        if let Some(c) = self.context {
            engine.free_context(c);
        }
        if let Some(m) = self.model {
            engine.free_model(m);
        }
    }
}

fn at(step: LoadStep) -> impl FnOnce(EngineError) -> LoadError {
    move |source| LoadError { step, source }
}

#[derive(Debug)]
pub struct ModelLifecycle {
    state: LifecycleState,
    context_size: usize,
    batch_size: usize,
}

impl ModelLifecycle {
    pub fn new(context_size: usize, batch_size: usize) -> Self {
        Self {
            state: LifecycleState::Idle,
            context_size,
            batch_size,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LifecycleState::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&LoadedModel> {
        match &self.state {
            LifecycleState::Loaded(m) => Some(m),
            LifecycleState::Idle => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut LoadedModel> {
        match &mut self.state {
            LifecycleState::Loaded(m) => Some(m),
            LifecycleState::Idle => None,
        }
    }

    /// Model → context → batch → sampler → end-of-turn marker.
    ///
    /// All or nothing: on failure every handle created so far is freed and
    /// the state stays `Idle`.
    pub fn load<E: NativeEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        request: &LoadRequest,
    ) -> Result<ModelInfo> {
        if self.is_loaded() {
            return Err(InvalidState::AlreadyLoaded.into());
        }

        let started = Instant::now();
        let params = ContextParams {
            n_ctx: self.context_size,
            n_threads: resolve_threads(request.n_threads),
            seed: request.seed,
        };

        let mut partial = Partial::default();
        let (handle, marker) = match self.create(engine, request, &params, &mut partial) {
            Ok(done) => done,
            Err(err) => {
                partial.release(engine);
                tracing::error!(
                    path = %request.path.display(),
                    step = %err.step,
                    error = %err.source,
                    "model load failed"
                );
                return Err(err.into());
            }
        };

        let loaded_at = SystemTime::now();
        let info = ModelInfo {
            id: next_model_id(loaded_at),
            path: request.path.clone(),
            end_of_turn_marker: marker.clone(),
            n_threads: params.n_threads,
            context_size: params.n_ctx,
            loaded_at,
            load_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            model = %info.id,
            path = %info.path.display(),
            n_threads = info.n_threads,
            n_ctx = info.context_size,
            load_ms = info.load_ms,
            "model loaded"
        );

        self.state = LifecycleState::Loaded(LoadedModel {
            handle,
            end_of_turn_marker: marker,
            info: info.clone(),
            dirty: false,
        });
        Ok(info)
    }

    fn create<E: NativeEngine + ?Sized>(
        &self,
        engine: &mut E,
        request: &LoadRequest,
        params: &ContextParams,
        partial: &mut Partial,
    ) -> std::result::Result<(EngineHandle, String), LoadError> {
        let model = engine
            .load_model(&request.path)
            .map_err(at(LoadStep::Model))?;
        partial.model = Some(model);

        let context = engine
            .new_context(model, params)
            .map_err(at(LoadStep::Context))?;
        partial.context = Some(context);

        let batch = engine
            .new_batch(self.batch_size)
            .map_err(at(LoadStep::Batch))?;
        partial.batch = Some(batch);

        let sampler = engine
            .new_sampler(&request.sampling.normalized())
            .map_err(at(LoadStep::Sampler))?;
        partial.sampler = Some(sampler);

        let marker = engine
            .end_of_turn_marker(model)
            .map_err(at(LoadStep::EndOfTurnMarker))?;

        Ok((
            EngineHandle {
                model,
                context,
                batch,
                sampler,
            },
            marker,
        ))
    }

    /// Frees everything in reverse creation order. `None` if already idle.
    pub fn unload<E: NativeEngine + ?Sized>(&mut self, engine: &mut E) -> Option<ModelInfo> {
        let LifecycleState::Loaded(m) = std::mem::take(&mut self.state) else {
            return None;
        };

        engine.free_sampler(m.handle.sampler);
        engine.free_batch(m.handle.batch);
        engine.free_context(m.handle.context);
        engine.free_model(m.handle.model);

        tracing::info!(model = %m.info.id, "model unloaded");
        Some(m.info)
    }
}
