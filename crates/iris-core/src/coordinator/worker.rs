//! The one thread that talks to the engine.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use iris_abi::NativeEngine;

use super::stream::{PendingRequest, StreamEvent};
use super::{ModelPhase, Shared};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, InvalidState, Result};
use crate::lifecycle::{LoadRequest, ModelInfo, ModelLifecycle};
use crate::session::{SessionEnv, SessionLimits, SessionOutcome, StreamingSession};
use crate::thermal::ThrottleFlags;

pub(crate) const WORKER_THREAD_NAME: &str = "iris-engine";

pub(crate) enum Command {
    Load {
        request: LoadRequest,
        reply: Sender<Result<ModelInfo>>,
    },
    Unload {
        reply: Sender<Option<ModelInfo>>,
    },
    Generate(PendingRequest),
    Embed {
        text: String,
        reply: Sender<Result<Vec<f32>>>,
    },
    Shutdown,
}

/// Pacing flags read live from the coordinator's state.
struct LiveFlags<'a>(&'a Shared);

impl ThrottleFlags for LiveFlags<'_> {
    fn is_rate_limited(&self) -> bool {
        self.0.lock().rate.is_rate_limited()
    }

    fn is_thermal_throttled(&self) -> bool {
        self.0.thermal.is_throttled()
    }
}

struct Worker<E> {
    engine: E,
    lifecycle: ModelLifecycle,
    shared: Arc<Shared>,
    limits: SessionLimits,
}

/// Start the worker and run `backend_init` on it before returning.
pub(crate) fn spawn<E>(
    engine: E,
    shared: Arc<Shared>,
    config: &CoordinatorConfig,
) -> Result<(Sender<Command>, JoinHandle<()>)>
where
    E: NativeEngine + 'static,
{
    let (commands, inbox) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();

    let mut worker = Worker {
        engine,
        lifecycle: ModelLifecycle::new(config.context_size, config.batch_size),
        shared,
        limits: config.session_limits(),
    };

    let handle = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            if let Err(e) = worker.engine.backend_init() {
                tracing::error!(error = %e, "engine backend init failed");
                let _ = ready_tx.send(Err(e));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            worker.run(inbox);
        })
        .map_err(|e| CoordinatorError::WorkerSpawn(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            tracing::debug!("engine worker ready");
            Ok((commands, handle))
        }
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(CoordinatorError::Engine(e))
        }
        Err(_) => {
            let _ = handle.join();
            Err(CoordinatorError::WorkerUnavailable)
        }
    }
}

impl<E: NativeEngine> Worker<E> {
    fn run(mut self, inbox: Receiver<Command>) {
        for command in inbox.iter() {
            match command {
                Command::Load { request, reply } => {
                    let result = self.lifecycle.load(&mut self.engine, &request);
                    self.publish_phase();
                    let _ = reply.send(result);
                }
                Command::Unload { reply } => {
                    let info = self.lifecycle.unload(&mut self.engine);
                    self.publish_phase();
                    let _ = reply.send(info);
                }
                Command::Generate(request) => self.serve(request),
                Command::Embed { text, reply } => {
                    let _ = reply.send(self.embed(&text));
                }
                Command::Shutdown => break,
            }
        }
        self.teardown();
    }

    /// Mirror the real lifecycle state for callers' synchronous checks.
    fn publish_phase(&self) {
        let phase = match self.lifecycle.loaded() {
            Some(m) => ModelPhase::Loaded(m.info().clone()),
            None => ModelPhase::Idle,
        };
        self.shared.lock().phase = phase;
    }

    /// Run `first`, then whatever queued up behind it, in arrival order.
    ///
    /// The next request is claimed before the finished stream is closed, so a
    /// caller seeing the end of its stream also sees the engine as free.
    fn serve(&mut self, first: PendingRequest) {
        let mut next = Some(first);
        while let Some(request) = next {
            let (events, end) = self.run_session(request);
            next = self.shared.next_request();
            let _ = events.send(end);
        }
    }

    fn run_session(&mut self, request: PendingRequest) -> (Sender<StreamEvent>, StreamEvent) {
        let PendingRequest {
            id,
            prompt,
            cancel,
            events,
        } = request;

        let Some(model) = self.lifecycle.loaded_mut() else {
            return (events, StreamEvent::Rejected(InvalidState::NotLoaded.into()));
        };
        if cancel.is_cancelled() {
            tracing::debug!(session = %id, "request cancelled before it started");
            return (events, StreamEvent::End(SessionOutcome::cancelled(id)));
        }

        let flags = LiveFlags(&self.shared);
        let env = SessionEnv {
            limits: self.limits,
            policy: self.shared.policy,
            flags: &flags,
            clock: self.shared.clock.as_ref(),
        };
        let session = StreamingSession::new(id, &mut self.engine, model, env, cancel);
        let outcome = session.run(&prompt, |chunk| events.send(StreamEvent::Chunk(chunk)).is_ok());

        tracing::debug!(
            session = %id,
            emitted = outcome.stats.emitted,
            delayed = outcome.stats.delayed_tokens,
            total_delay_ms = outcome.stats.total_delay.as_millis() as u64,
            "session stats"
        );
        (events, StreamEvent::End(outcome))
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .lifecycle
            .loaded_mut()
            .ok_or(InvalidState::NotLoaded)?;
        let context = model.handle().context;

        self.engine.reset_cache(context);
        let result = self.engine.embed(context, text);
        model.set_dirty(true);
        Ok(result?)
    }

    fn teardown(mut self) {
        let stranded = self.shared.abandon_queue();
        for request in stranded {
            request.reject(CoordinatorError::WorkerUnavailable);
        }

        self.lifecycle.unload(&mut self.engine);
        self.publish_phase();
        self.engine.backend_free();
        tracing::info!("engine worker stopped");
    }
}
