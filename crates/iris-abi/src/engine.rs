use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::sampling::SamplingParams;

macro_rules! handle_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub usize);

        impl From<usize> for $name {
            #[inline]
            fn from(value: usize) -> Self {
                $name(value)
            }
        }

        impl From<$name> for usize {
            #[inline]
            fn from(handle: $name) -> usize {
                handle.0
            }
        }
    };
}

handle_newtype!(
    /// Opaque id of a loaded model (weights).
    ModelHandle
);
handle_newtype!(
    /// Opaque id of an inference context (KV cache + threads).
    ContextHandle
);
handle_newtype!(
    /// Opaque id of a token batch buffer.
    BatchHandle
);
handle_newtype!(
    /// Opaque id of a sampler chain.
    SamplerHandle
);

/// Everything the engine allocated for one loaded model.
/// Exactly one owner at a time; never cloned.
#[derive(Debug, PartialEq, Eq)]
pub struct EngineHandle {
    pub model: ModelHandle,
    pub context: ContextHandle,
    pub batch: BatchHandle,
    pub sampler: SamplerHandle,
}

/// Position in the context window (prompt tokens + generated tokens so far).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor(pub usize);

impl Cursor {
    #[inline]
    pub fn position(self) -> usize {
        self.0
    }

    #[inline]
    pub fn advance(&mut self) {
        self.0 += 1;
    }
}

/// Parameters for `NativeEngine::new_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: usize,
    /// Already resolved by the caller; engines should treat 0 as "engine default".
    pub n_threads: usize,
    /// `None` = time-based seed.
    pub seed: Option<u64>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_threads: 0,
            seed: None,
        }
    }
}

/// The single native inference engine.
///
/// Every call blocks until the engine is done with it. Implementations are not
/// expected to be reentrant: the coordinator calls them from one thread only,
/// so `Send` is all that's required.
pub trait NativeEngine: Send {
    /// Process-level runtime setup, called once before the first load.
    fn backend_init(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Process-level runtime teardown, called once on shutdown.
    fn backend_free(&mut self) {}

    fn load_model(&mut self, path: &Path) -> EngineResult<ModelHandle>;

    fn free_model(&mut self, model: ModelHandle);

    fn new_context(
        &mut self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> EngineResult<ContextHandle>;

    fn free_context(&mut self, context: ContextHandle);

    fn new_batch(&mut self, max_tokens: usize) -> EngineResult<BatchHandle>;

    fn free_batch(&mut self, batch: BatchHandle);

    fn new_sampler(&mut self, params: &SamplingParams) -> EngineResult<SamplerHandle>;

    fn free_sampler(&mut self, sampler: SamplerHandle);

    /// Model-specific end-of-turn text (e.g. `<|im_end|>`). May be empty.
    fn end_of_turn_marker(&mut self, model: ModelHandle) -> EngineResult<String>;

    /// Tokenize and decode `prompt`; returns the cursor just past the prompt.
    fn init_generation(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        prompt: &str,
        max_len: usize,
    ) -> EngineResult<Cursor>;

    /// Sample and decode one token, advancing `cursor`.
    /// `Ok(None)` means the model chose to stop (natural end of sequence).
    fn next_token(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        sampler: SamplerHandle,
        max_len: usize,
        cursor: &mut Cursor,
    ) -> EngineResult<Option<String>>;

    /// Drop all conversation state held in the context's KV cache.
    fn reset_cache(&mut self, context: ContextHandle);

    /// Pooled embedding of `text`. Optional.
    fn embed(&mut self, _context: ContextHandle, _text: &str) -> EngineResult<Vec<f32>> {
        Err(EngineError::Unsupported("embed"))
    }
}

impl<E: NativeEngine + ?Sized> NativeEngine for Box<E> {
    fn backend_init(&mut self) -> EngineResult<()> {
        (**self).backend_init()
    }

    fn backend_free(&mut self) {
        (**self).backend_free()
    }

    fn load_model(&mut self, path: &Path) -> EngineResult<ModelHandle> {
        (**self).load_model(path)
    }

    fn free_model(&mut self, model: ModelHandle) {
        (**self).free_model(model)
    }

    fn new_context(
        &mut self,
        model: ModelHandle,
        params: &ContextParams,
    ) -> EngineResult<ContextHandle> {
        (**self).new_context(model, params)
    }

    fn free_context(&mut self, context: ContextHandle) {
        (**self).free_context(context)
    }

    fn new_batch(&mut self, max_tokens: usize) -> EngineResult<BatchHandle> {
        (**self).new_batch(max_tokens)
    }

    fn free_batch(&mut self, batch: BatchHandle) {
        (**self).free_batch(batch)
    }

    fn new_sampler(&mut self, params: &SamplingParams) -> EngineResult<SamplerHandle> {
        (**self).new_sampler(params)
    }

    fn free_sampler(&mut self, sampler: SamplerHandle) {
        (**self).free_sampler(sampler)
    }

    fn end_of_turn_marker(&mut self, model: ModelHandle) -> EngineResult<String> {
        (**self).end_of_turn_marker(model)
    }

    fn init_generation(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        prompt: &str,
        max_len: usize,
    ) -> EngineResult<Cursor> {
        (**self).init_generation(context, batch, prompt, max_len)
    }

    fn next_token(
        &mut self,
        context: ContextHandle,
        batch: BatchHandle,
        sampler: SamplerHandle,
        max_len: usize,
        cursor: &mut Cursor,
    ) -> EngineResult<Option<String>> {
        (**self).next_token(context, batch, sampler, max_len, cursor)
    }

    fn reset_cache(&mut self, context: ContextHandle) {
        (**self).reset_cache(context)
    }

    fn embed(&mut self, context: ContextHandle, text: &str) -> EngineResult<Vec<f32>> {
        (**self).embed(context, text)
    }
}
