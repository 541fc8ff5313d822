//! In-process engine that replays canned output.
//!
//! Useful for UI previews without a model file, and for driving the
//! coordinator deterministically in tests. A [`EngineProbe`] taken before the
//! engine is moved into the coordinator keeps visibility into every call.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use iris_abi::{
    BatchHandle, ContextHandle, ContextParams, Cursor, EngineError, EngineResult, ModelHandle,
    NativeEngine, SamplerHandle, SamplingParams,
};

pub const DEFAULT_MARKER: &str = "<|im_end|>";

const HOLD_LIMIT: Duration = Duration::from_secs(30);

/// Where to inject a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    BackendInit,
    LoadModel,
    NewContext,
    NewBatch,
    NewSampler,
    EndOfTurnMarker,
    InitGeneration,
    /// While producing the token with this 0-based index.
    NextToken(usize),
    Embed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    BackendInit,
    BackendFree,
    LoadModel(std::path::PathBuf),
    FreeModel,
    NewContext { n_threads: usize },
    FreeContext,
    NewBatch,
    FreeBatch,
    NewSampler,
    FreeSampler,
    EndOfTurnMarker,
    InitGeneration(String),
    NextToken,
    ResetCache,
    Embed(String),
}

impl EngineCall {
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            EngineCall::FreeModel
                | EngineCall::FreeContext
                | EngineCall::FreeBatch
                | EngineCall::FreeSampler
        )
    }
}

#[derive(Default)]
struct ProbeState {
    calls: Vec<EngineCall>,
    live: HashSet<usize>,
    held: bool,
    released: bool,
}

/// Shared view into a [`ScriptedEngine`].
#[derive(Clone, Default)]
pub struct EngineProbe {
    inner: Arc<(Mutex<ProbeState>, Condvar)>,
}

impl EngineProbe {
    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &EngineCall) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::InitGeneration(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Handles allocated and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.state().live.len()
    }

    /// Block until the engine parks at its hold point, or `timeout` passes.
    pub fn wait_until_held(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.state();
        while !s.held {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            s = self
                .inner
                .1
                .wait_timeout(s, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Let a held engine continue.
    pub fn release(&self) {
        self.state().released = true;
        self.inner.1.notify_all();
    }

    fn record(&self, call: EngineCall) {
        self.state().calls.push(call);
    }

    /// Parks until released. Gives up after `HOLD_LIMIT` so a failed test
    /// can't wedge the worker forever.
    fn hold(&self) {
        let deadline = Instant::now() + HOLD_LIMIT;
        let mut s = self.state();
        s.held = true;
        self.inner.1.notify_all();
        while !s.released {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            s = self
                .inner
                .1
                .wait_timeout(s, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        s.held = false;
        s.released = false;
    }
}

type TokenHook = Box<dyn FnMut(usize) + Send>;

pub struct ScriptedEngine {
    marker: String,
    default_response: Vec<String>,
    queued: VecDeque<Vec<String>>,
    current: Vec<String>,
    index: usize,
    endless: bool,
    fail: Option<FailAt>,
    fail_once: bool,
    hold_at: Option<usize>,
    hook: Option<TokenHook>,
    next_handle: usize,
    probe: EngineProbe,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Replies `Hello`, `,`, ` world`, `!`, ` 👋` to every prompt.
    pub fn new() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            default_response: ["Hello", ",", " world", "!", " 👋"]
                .into_iter()
                .map(String::from)
                .collect(),
            queued: VecDeque::new(),
            current: Vec::new(),
            index: 0,
            endless: false,
            fail: None,
            fail_once: false,
            hold_at: None,
            hook: None,
            next_handle: 1,
            probe: EngineProbe::default(),
        }
    }

    pub fn probe(&self) -> EngineProbe {
        self.probe.clone()
    }

    /// Chunks returned for every generation without a queued script.
    pub fn with_response<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_response = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// One-shot script for the next generation; scripts are used in order.
    pub fn then_response<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queued.push_back(chunks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Keep producing filler tokens once the script runs out.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn fail_at(mut self, at: FailAt) -> Self {
        self.fail = Some(at);
        self
    }

    /// The injected failure fires only once.
    pub fn fail_once(mut self) -> Self {
        self.fail_once = true;
        self
    }

    /// Park inside `next_token` before producing token `index` until
    /// [`EngineProbe::release`]. Fires once.
    pub fn hold_at(mut self, index: usize) -> Self {
        self.hold_at = Some(index);
        self
    }

    /// Called with the token index each time a token is produced.
    pub fn on_token<F>(mut self, hook: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    fn check(&mut self, at: FailAt) -> EngineResult<()> {
        if self.fail != Some(at) {
            return Ok(());
        }
        if self.fail_once {
            self.fail = None;
        }
        Err(EngineError::native(format!("scripted failure at {at:?}")))
    }

    fn alloc(&mut self) -> usize {
        let id = self.next_handle;
        self.next_handle += 1;
        self.probe.state().live.insert(id);
        id
    }

    fn release_handle(&mut self, id: usize) {
        self.probe.state().live.remove(&id);
    }
}

impl NativeEngine for ScriptedEngine {
    fn backend_init(&mut self) -> EngineResult<()> {
        self.probe.record(EngineCall::BackendInit);
        self.check(FailAt::BackendInit)
    }

    fn backend_free(&mut self) {
        self.probe.record(EngineCall::BackendFree);
    }

    fn load_model(&mut self, path: &Path) -> EngineResult<ModelHandle> {
        self.probe.record(EngineCall::LoadModel(path.to_path_buf()));
        self.check(FailAt::LoadModel)?;
        Ok(ModelHandle(self.alloc()))
    }

    fn free_model(&mut self, model: ModelHandle) {
        self.probe.record(EngineCall::FreeModel);
        self.release_handle(model.0);
    }

    fn new_context(
        &mut self,
        _model: ModelHandle,
        params: &ContextParams,
    ) -> EngineResult<ContextHandle> {
        self.probe.record(EngineCall::NewContext {
            n_threads: params.n_threads,
        });
        self.check(FailAt::NewContext)?;
        Ok(ContextHandle(self.alloc()))
    }

    fn free_context(&mut self, context: ContextHandle) {
        self.probe.record(EngineCall::FreeContext);
        self.release_handle(context.0);
    }

    fn new_batch(&mut self, _max_tokens: usize) -> EngineResult<BatchHandle> {
        self.probe.record(EngineCall::NewBatch);
        self.check(FailAt::NewBatch)?;
        Ok(BatchHandle(self.alloc()))
    }

    fn free_batch(&mut self, batch: BatchHandle) {
        self.probe.record(EngineCall::FreeBatch);
        self.release_handle(batch.0);
    }

    fn new_sampler(&mut self, _params: &SamplingParams) -> EngineResult<SamplerHandle> {
        self.probe.record(EngineCall::NewSampler);
        self.check(FailAt::NewSampler)?;
        Ok(SamplerHandle(self.alloc()))
    }

    fn free_sampler(&mut self, sampler: SamplerHandle) {
        self.probe.record(EngineCall::FreeSampler);
        self.release_handle(sampler.0);
    }

    fn end_of_turn_marker(&mut self, _model: ModelHandle) -> EngineResult<String> {
        self.probe.record(EngineCall::EndOfTurnMarker);
        self.check(FailAt::EndOfTurnMarker)?;
        Ok(self.marker.clone())
    }

    fn init_generation(
        &mut self,
        _context: ContextHandle,
        _batch: BatchHandle,
        prompt: &str,
        max_len: usize,
    ) -> EngineResult<Cursor> {
        self.probe
            .record(EngineCall::InitGeneration(prompt.to_string()));
        self.check(FailAt::InitGeneration)?;

        let n_prompt = prompt.split_whitespace().count().max(1);
        if n_prompt >= max_len {
            return Err(EngineError::native(format!(
                "prompt of {n_prompt} tokens does not fit a context of {max_len}"
            )));
        }
        self.current = self
            .queued
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone());
        self.index = 0;
        Ok(Cursor(n_prompt))
    }

    fn next_token(
        &mut self,
        _context: ContextHandle,
        _batch: BatchHandle,
        _sampler: SamplerHandle,
        _max_len: usize,
        cursor: &mut Cursor,
    ) -> EngineResult<Option<String>> {
        self.probe.record(EngineCall::NextToken);
        let i = self.index;
        self.check(FailAt::NextToken(i))?;

        if self.hold_at == Some(i) {
            self.hold_at = None;
            self.probe.hold();
        }

        let chunk = match self.current.get(i) {
            Some(c) => c.clone(),
            None if self.endless => format!(" t{i}"),
            None => return Ok(None),
        };
        if let Some(hook) = self.hook.as_mut() {
            hook(i);
        }
        self.index += 1;
        cursor.advance();
        Ok(Some(chunk))
    }

    fn reset_cache(&mut self, _context: ContextHandle) {
        self.probe.record(EngineCall::ResetCache);
    }

    fn embed(&mut self, _context: ContextHandle, text: &str) -> EngineResult<Vec<f32>> {
        self.probe.record(EngineCall::Embed(text.to_string()));
        self.check(FailAt::Embed)?;

        // Byte histogram folded into 8 buckets, L2-normalized.
        let mut v = vec![0.0f32; 8];
        for b in text.bytes() {
            v[usize::from(b) % 8] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}
