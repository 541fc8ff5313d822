//! One generation, from prompt to a terminal state.
//!
//! `Idle → Generating → {Completed | Cancelled | Failed}`. A session is never
//! reused: the coordinator builds a fresh one per request.

mod eot;

use std::fmt;
use std::time::{Duration, Instant};

use iris_abi::{Cursor, EngineError, NativeEngine};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::lifecycle::LoadedModel;
use crate::thermal::{ThermalPolicy, ThrottleFlags};

pub use eot::EndOfTurnDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Stop once the cursor reaches this position.
    pub context_size: usize,
    /// The loop keeps going while `emitted <= max_new_tokens`.
    pub max_new_tokens: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            context_size: 4096,
            max_new_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinishReason {
    /// The model chose to stop.
    EndOfSequence,
    /// The end-of-turn marker showed up in the output. The turn may be cut short.
    EndOfTurn,
    TokenLimit,
    ContextLimit,
}

impl FinishReason {
    pub fn is_incomplete(self) -> bool {
        self == FinishReason::EndOfTurn
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating {
        cursor: Cursor,
        eot: EndOfTurnDetector,
    },
    Completed(FinishReason),
    Cancelled,
    Failed(EngineError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed(_) | SessionState::Cancelled | SessionState::Failed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed(FinishReason),
    Cancelled,
    Failed(EngineError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub emitted: usize,
    pub prompt_tokens: usize,
    pub final_cursor: usize,
    /// Chunks that were held back by pacing.
    pub delayed_tokens: usize,
    pub total_delay: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub termination: Termination,
    pub stats: SessionStats,
}

impl SessionOutcome {
    pub(crate) fn cancelled(session: SessionId) -> Self {
        Self {
            session,
            termination: Termination::Cancelled,
            stats: SessionStats::default(),
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.termination {
            Termination::Completed(r) => Some(r),
            _ => None,
        }
    }

    /// Stopped on the end-of-turn marker rather than a natural end.
    pub fn is_incomplete(&self) -> bool {
        self.finish_reason().is_some_and(FinishReason::is_incomplete)
    }

    pub fn is_cancelled(&self) -> bool {
        self.termination == Termination::Cancelled
    }

    pub fn error(&self) -> Option<&EngineError> {
        match &self.termination {
            Termination::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// What a session reads from its surroundings.
#[derive(Clone, Copy)]
pub struct SessionEnv<'a> {
    pub limits: SessionLimits,
    pub policy: ThermalPolicy,
    pub flags: &'a dyn ThrottleFlags,
    pub clock: &'a dyn Clock,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Ready for the caller. Pacing delay, if any, has already elapsed.
    Chunk(String),
    Finished,
}

pub struct StreamingSession<'a, E: NativeEngine + ?Sized> {
    id: SessionId,
    engine: &'a mut E,
    model: &'a mut LoadedModel,
    env: SessionEnv<'a>,
    cancel: CancelToken,
    state: SessionState,
    stats: SessionStats,
    started: Option<Instant>,
}

impl<'a, E: NativeEngine + ?Sized> StreamingSession<'a, E> {
    pub fn new(
        id: SessionId,
        engine: &'a mut E,
        model: &'a mut LoadedModel,
        env: SessionEnv<'a>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            engine,
            model,
            env,
            cancel,
            state: SessionState::Idle,
            stats: SessionStats::default(),
            started: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Feed the prompt to the engine. Returns true if generation began.
    pub fn start(&mut self, prompt: &str) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.started = Some(self.env.clock.now());

        let h = self.model.handle();
        let (context, batch) = (h.context, h.batch);

        if self.model.needs_reset() {
            tracing::debug!(session = %self.id, "clearing cache left by an interrupted call");
            self.engine.reset_cache(context);
            self.model.set_dirty(false);
        }

        match self
            .engine
            .init_generation(context, batch, prompt, self.env.limits.context_size)
        {
            Ok(cursor) => {
                self.stats.prompt_tokens = cursor.position();
                self.stats.final_cursor = cursor.position();
                self.state = SessionState::Generating {
                    cursor,
                    eot: EndOfTurnDetector::new(self.model.end_of_turn_marker()),
                };
                tracing::info!(
                    session = %self.id,
                    prompt_tokens = cursor.position(),
                    "session started"
                );
                true
            }
            Err(e) => {
                // The engine may have decoded part of the prompt.
                self.model.set_dirty(true);
                self.finish(Termination::Failed(e));
                false
            }
        }
    }

    /// One loop iteration. Returns `Finished` once the session is terminal.
    pub fn step(&mut self) -> Step {
        let SessionState::Generating { cursor, eot } = &mut self.state else {
            return Step::Finished;
        };

        if self.cancel.is_cancelled() {
            return self.finish(Termination::Cancelled);
        }
        if cursor.position() >= self.env.limits.context_size {
            return self.finish(Termination::Completed(FinishReason::ContextLimit));
        }
        // Inclusive bound: a session may emit `max_new_tokens + 1` chunks.
        if self.stats.emitted > self.env.limits.max_new_tokens {
            return self.finish(Termination::Completed(FinishReason::TokenLimit));
        }

        let h = self.model.handle();
        let (context, batch, sampler) = (h.context, h.batch, h.sampler);
        let chunk = match self.engine.next_token(
            context,
            batch,
            sampler,
            self.env.limits.context_size,
            cursor,
        ) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return self.finish(Termination::Completed(FinishReason::EndOfSequence)),
            Err(e) => return self.finish(Termination::Failed(e)),
        };
        self.stats.final_cursor = cursor.position();

        if eot.push(&chunk) {
            return self.finish(Termination::Completed(FinishReason::EndOfTurn));
        }

        if self.cancel.is_cancelled() {
            return self.finish(Termination::Cancelled);
        }

        // Pacing applies between chunks, never before the first one.
        if self.stats.emitted > 0 {
            let delay = self.env.policy.compute_stream_delay(
                self.env.flags.is_rate_limited(),
                self.env.flags.is_thermal_throttled(),
            );
            if !delay.is_zero() {
                tracing::trace!(
                    session = %self.id,
                    delay_ms = delay.as_millis() as u64,
                    "pacing"
                );
                self.env.clock.sleep(delay);
                self.stats.delayed_tokens += 1;
                self.stats.total_delay += delay;

                if self.cancel.is_cancelled() {
                    return self.finish(Termination::Cancelled);
                }
            }
        }

        self.stats.emitted += 1;
        tracing::trace!(
            session = %self.id,
            cursor = self.stats.final_cursor,
            emitted = self.stats.emitted,
            "token"
        );
        Step::Chunk(chunk)
    }

    fn finish(&mut self, termination: Termination) -> Step {
        let context = self.model.handle().context;
        if let Some(t0) = self.started {
            self.stats.elapsed = self.env.clock.now().saturating_duration_since(t0);
        }
        let elapsed_ms = self.stats.elapsed.as_millis() as u64;

        self.state = match termination {
            Termination::Completed(reason) => {
                self.engine.reset_cache(context);
                self.model.set_dirty(false);
                tracing::info!(
                    session = %self.id,
                    ?reason,
                    emitted = self.stats.emitted,
                    delayed = self.stats.delayed_tokens,
                    elapsed_ms,
                    "session completed"
                );
                SessionState::Completed(reason)
            }
            Termination::Cancelled => {
                self.model.set_dirty(true);
                tracing::warn!(session = %self.id, emitted = self.stats.emitted, "session cancelled");
                SessionState::Cancelled
            }
            Termination::Failed(e) => {
                self.model.set_dirty(true);
                tracing::warn!(session = %self.id, error = %e, emitted = self.stats.emitted, "session failed");
                SessionState::Failed(e)
            }
        };
        Step::Finished
    }

    /// `None` until the session is terminal.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        let termination = match &self.state {
            SessionState::Completed(r) => Termination::Completed(*r),
            SessionState::Cancelled => Termination::Cancelled,
            SessionState::Failed(e) => Termination::Failed(e.clone()),
            SessionState::Idle | SessionState::Generating { .. } => return None,
        };
        Some(SessionOutcome {
            session: self.id,
            termination,
            stats: self.stats.clone(),
        })
    }

    /// Drive the session to completion, handing each chunk to `emit`.
    /// `emit` returning false (nobody listening) cancels the session.
    pub fn run<F>(mut self, prompt: &str, mut emit: F) -> SessionOutcome
    where
        F: FnMut(String) -> bool,
    {
        if self.state == SessionState::Idle {
            self.start(prompt);
        }
        while let Step::Chunk(chunk) = self.step() {
            if !emit(chunk) {
                tracing::debug!(session = %self.id, "receiver dropped");
                self.cancel.cancel();
            }
        }
        let id = self.id;
        self.outcome()
            .unwrap_or_else(|| SessionOutcome::cancelled(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::{LoadRequest, ModelLifecycle};
    use crate::scripted::{EngineCall, FailAt, ScriptedEngine};
    use crate::thermal::{StaticFlags, ThermalSignal};

    const MS_100: Duration = Duration::from_millis(100);

    struct Rig {
        engine: ScriptedEngine,
        lifecycle: ModelLifecycle,
        clock: ManualClock,
        limits: SessionLimits,
    }

    impl Rig {
        fn new(engine: ScriptedEngine) -> Self {
            let mut engine = engine;
            let mut lifecycle = ModelLifecycle::new(4096, 512);
            lifecycle.load(&mut engine, &LoadRequest::new("/m")).unwrap();
            Self {
                engine,
                lifecycle,
                clock: ManualClock::new(),
                limits: SessionLimits::default(),
            }
        }

        fn run(
            &mut self,
            prompt: &str,
            flags: &dyn ThrottleFlags,
            cancel: CancelToken,
        ) -> (Vec<String>, SessionOutcome) {
            let env = SessionEnv {
                limits: self.limits,
                policy: ThermalPolicy::default(),
                flags,
                clock: &self.clock,
            };
            let model = self.lifecycle.loaded_mut().unwrap();
            let session = StreamingSession::new(SessionId(1), &mut self.engine, model, env, cancel);
            let mut out = Vec::new();
            let outcome = session.run(prompt, |c| {
                out.push(c);
                true
            });
            (out, outcome)
        }
    }

    #[test]
    fn clean_run_emits_every_chunk_without_delay() {
        let mut rig = Rig::new(ScriptedEngine::new());
        let probe = rig.engine.probe();

        let (out, outcome) = rig.run("hello", &StaticFlags::default(), CancelToken::new());

        assert_eq!(out.len(), 5);
        assert_eq!(outcome.finish_reason(), Some(FinishReason::EndOfSequence));
        assert!(!outcome.is_incomplete());
        assert!(rig.clock.sleeps().is_empty());
        assert_eq!(outcome.stats.emitted, 5);
        assert_eq!(outcome.stats.total_delay, Duration::ZERO);
        assert_eq!(probe.calls().last(), Some(&EngineCall::ResetCache));
    }

    #[test]
    fn marker_split_across_chunks_ends_turn_without_leaking_it() {
        let engine = ScriptedEngine::new().with_response(["Hi", " there", "<|im", "_end|>", "never"]);
        let mut rig = Rig::new(engine);

        let (out, outcome) = rig.run("hello", &StaticFlags::default(), CancelToken::new());

        assert_eq!(outcome.finish_reason(), Some(FinishReason::EndOfTurn));
        assert!(outcome.is_incomplete());
        assert!(out.iter().all(|c| !c.contains("<|im_end|>")));
        assert!(!out.iter().any(|c| c == "never"));
        assert_eq!(out, ["Hi", " there", "<|im"]);
    }

    #[test]
    fn token_limit_stops_an_endless_model() {
        let mut rig = Rig::new(ScriptedEngine::new().endless());
        rig.limits.max_new_tokens = 3;

        let (out, outcome) = rig.run("go", &StaticFlags::default(), CancelToken::new());
        assert_eq!(out.len(), 4);
        assert_eq!(outcome.stats.emitted, 4);
        assert_eq!(outcome.finish_reason(), Some(FinishReason::TokenLimit));
    }

    #[test]
    fn zero_token_cap_still_lets_one_chunk_through() {
        let mut rig = Rig::new(ScriptedEngine::new().endless());
        rig.limits.max_new_tokens = 0;

        let (out, outcome) = rig.run("go", &StaticFlags::default(), CancelToken::new());
        assert_eq!(out.len(), 1);
        assert_eq!(outcome.finish_reason(), Some(FinishReason::TokenLimit));
    }

    #[test]
    fn context_limit_counts_prompt_tokens() {
        let mut rig = Rig::new(ScriptedEngine::new().endless());
        rig.limits.context_size = 10;

        let (out, outcome) = rig.run("two words", &StaticFlags::default(), CancelToken::new());
        assert_eq!(out.len(), 8);
        assert_eq!(outcome.finish_reason(), Some(FinishReason::ContextLimit));
        assert_eq!(outcome.stats.prompt_tokens, 2);
        assert_eq!(outcome.stats.final_cursor, 10);
    }

    #[test]
    fn thermal_flip_mid_stream_delays_only_later_tokens() {
        let thermal = ThermalSignal::new();
        let hot = thermal.clone();
        let engine = ScriptedEngine::new().on_token(move |i| {
            if i == 2 {
                hot.set(true);
            }
        });
        let mut rig = Rig::new(engine);
        let clock = rig.clock.clone();

        let env = SessionEnv {
            limits: rig.limits,
            policy: ThermalPolicy::default(),
            flags: &thermal,
            clock: &clock,
        };
        let model = rig.lifecycle.loaded_mut().unwrap();
        let session =
            StreamingSession::new(SessionId(7), &mut rig.engine, model, env, CancelToken::new());

        let mut emitted_at = Vec::new();
        let outcome = session.run("hello", |_| {
            emitted_at.push(clock.elapsed());
            true
        });

        assert_eq!(outcome.stats.emitted, 5);
        assert_eq!(
            emitted_at,
            [Duration::ZERO, Duration::ZERO, MS_100, MS_100 * 2, MS_100 * 3]
        );
        assert_eq!(clock.sleeps(), [MS_100; 3]);
        assert_eq!(outcome.stats.delayed_tokens, 3);
    }

    #[test]
    fn both_flags_pace_every_chunk_but_the_first() {
        let mut rig = Rig::new(ScriptedEngine::new());
        let flags = StaticFlags {
            rate_limited: true,
            thermal: true,
        };
        let (out, _) = rig.run("hello", &flags, CancelToken::new());
        assert_eq!(out.len(), 5);
        assert_eq!(rig.clock.sleeps(), [Duration::from_millis(150); 4]);
    }

    #[test]
    fn cancel_stops_within_one_iteration_and_marks_cache_dirty() {
        let mut rig = Rig::new(ScriptedEngine::new().endless());
        let probe = rig.engine.probe();
        let cancel = CancelToken::new();

        let env = SessionEnv {
            limits: rig.limits,
            policy: ThermalPolicy::default(),
            flags: &StaticFlags::default(),
            clock: &rig.clock,
        };
        let model = rig.lifecycle.loaded_mut().unwrap();
        let session = StreamingSession::new(SessionId(2), &mut rig.engine, model, env, cancel.clone());

        let mut out = Vec::new();
        let outcome = session.run("hello", |c| {
            out.push(c);
            if out.len() == 2 {
                cancel.cancel();
            }
            true
        });

        assert_eq!(out.len(), 2);
        assert!(outcome.is_cancelled());
        assert_eq!(probe.count(&EngineCall::ResetCache), 0);
        assert!(rig.lifecycle.loaded().unwrap().needs_reset());

        // The next session clears the leftovers before decoding its prompt.
        let (_, next) = rig.run("again", &StaticFlags::default(), CancelToken::new());
        assert_eq!(next.finish_reason(), Some(FinishReason::TokenLimit));
        let calls = probe.calls();
        let init = calls
            .iter()
            .position(|c| *c == EngineCall::InitGeneration("again".into()))
            .unwrap();
        assert_eq!(calls[init - 1], EngineCall::ResetCache);
    }

    #[test]
    fn dropped_receiver_cancels() {
        let mut rig = Rig::new(ScriptedEngine::new().endless());
        let env = SessionEnv {
            limits: rig.limits,
            policy: ThermalPolicy::default(),
            flags: &StaticFlags::default(),
            clock: &rig.clock,
        };
        let model = rig.lifecycle.loaded_mut().unwrap();
        let session =
            StreamingSession::new(SessionId(3), &mut rig.engine, model, env, CancelToken::new());

        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let outcome = session.run("x", move |_| {
            *counter.lock().unwrap() += 1;
            false
        });
        assert!(outcome.is_cancelled());
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn engine_failure_mid_stream_fails_the_session() {
        let mut rig = Rig::new(ScriptedEngine::new().fail_at(FailAt::NextToken(2)));
        let (out, outcome) = rig.run("hello", &StaticFlags::default(), CancelToken::new());

        assert_eq!(out.len(), 2);
        assert!(outcome.error().is_some());
        assert!(rig.lifecycle.loaded().unwrap().needs_reset());
    }

    #[test]
    fn init_failure_fails_before_any_token() {
        let mut rig = Rig::new(ScriptedEngine::new().fail_at(FailAt::InitGeneration));
        let (out, outcome) = rig.run("hello", &StaticFlags::default(), CancelToken::new());
        assert!(out.is_empty());
        assert!(matches!(outcome.termination, Termination::Failed(_)));
    }

    #[test]
    fn step_api_walks_the_states() {
        let mut rig = Rig::new(ScriptedEngine::new().with_response(["a"]));
        let env = SessionEnv {
            limits: rig.limits,
            policy: ThermalPolicy::default(),
            flags: &StaticFlags::default(),
            clock: &rig.clock,
        };
        let model = rig.lifecycle.loaded_mut().unwrap();
        let mut s = StreamingSession::new(SessionId(4), &mut rig.engine, model, env, CancelToken::new());

        assert_eq!(s.state(), &SessionState::Idle);
        assert!(s.outcome().is_none());
        assert!(s.start("p"));
        assert!(matches!(s.state(), SessionState::Generating { .. }));
        assert!(!s.start("p"));

        assert_eq!(s.step(), Step::Chunk("a".into()));
        assert_eq!(s.step(), Step::Finished);
        assert_eq!(s.state(), &SessionState::Completed(FinishReason::EndOfSequence));
        assert_eq!(s.step(), Step::Finished);
        assert!(s.state().is_terminal());
    }
}
