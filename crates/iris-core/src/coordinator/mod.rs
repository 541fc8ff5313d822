//! The facade callers talk to.
//!
//! Any number of threads may call in. Bookkeeping (admission queue, rate
//! window, lifecycle mirror) sits behind one mutex; everything that touches
//! the engine is forwarded to a single worker thread.

mod stream;
mod worker;

use std::path::Path;
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use iris_abi::{NativeEngine, SamplingParams};

use self::stream::PendingRequest;
use self::worker::Command;
use crate::admission::{AdmissionQueue, Enqueue};
use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, InvalidState, Result};
use crate::lifecycle::{LoadRequest, ModelInfo};
use crate::rate_limit::RateLimitWindow;
use crate::session::SessionId;
use crate::thermal::{ThermalPolicy, ThermalSignal};

pub use self::stream::TokenStream;

/// Result of [`RequestCoordinator::try_enqueue`].
pub enum Admission {
    /// The engine is held for this caller; start with [`Reservation::generate`].
    Admitted(Reservation),
    /// Waiting behind the current generation; starts on its own.
    Queued(TokenStream),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued(_))
    }

    pub fn into_stream(self) -> Option<TokenStream> {
        match self {
            Admission::Queued(s) => Some(s),
            Admission::Admitted(_) => None,
        }
    }

    pub fn into_reservation(self) -> Option<Reservation> {
        match self {
            Admission::Admitted(r) => Some(r),
            Admission::Queued(_) => None,
        }
    }
}

/// The engine slot granted by an `Admitted` answer.
///
/// While it is held, other admissions queue behind it. Dropping it unused
/// gives the slot to the next queued request, or frees the engine.
pub struct Reservation {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    armed: bool,
}

impl Reservation {
    /// Start the generation this slot was reserved for.
    pub fn generate(mut self, prompt: impl Into<String>) -> Result<TokenStream> {
        let mut st = self.shared.lock();
        if !matches!(st.phase, ModelPhase::Loaded(_)) {
            return Err(InvalidState::NotLoaded.into());
        }

        let (request, stream) = st.new_request(prompt.into());
        st.begin(&request);
        drop(st);
        self.armed = false;

        dispatch(&self.shared, &self.commands, request)?;
        Ok(stream)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("unused reservation released");
        if let Some(request) = self.shared.next_request() {
            let _ = dispatch(&self.shared, &self.commands, request);
        }
    }
}

/// Hand `request` to the worker. On failure the engine is marked free again.
fn dispatch(shared: &Shared, commands: &Sender<Command>, request: PendingRequest) -> Result<()> {
    let id = request.id;
    if let Err(SendError(command)) = commands.send(Command::Generate(request)) {
        let mut st = shared.lock();
        st.admission.set_generating(false);
        st.current = None;
        drop(st);
        if let Command::Generate(request) = command {
            request.reject(CoordinatorError::WorkerUnavailable);
        }
        return Err(CoordinatorError::WorkerUnavailable);
    }
    tracing::debug!(session = %id, "dispatched to engine worker");
    Ok(())
}

/// Caller-side view of the worker's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ModelPhase {
    Idle,
    Loading,
    Loaded(ModelInfo),
}

pub(crate) struct SharedState {
    pub(crate) phase: ModelPhase,
    pub(crate) admission: AdmissionQueue<PendingRequest>,
    pub(crate) rate: RateLimitWindow,
    /// Cancel handle of the generation in flight.
    pub(crate) current: Option<CancelToken>,
    next_session: u64,
}

impl SharedState {
    fn record_attempt(&mut self, clock: &dyn Clock) {
        let limited = self.rate.record_attempt(clock.now());
        tracing::debug!(
            count = self.rate.request_count(),
            limited,
            "admission attempt"
        );
    }

    fn purge_abandoned(&mut self) {
        for request in self.admission.remove_where(PendingRequest::is_abandoned) {
            tracing::debug!(session = %request.id, "dropping abandoned queued request");
            request.finish_cancelled();
        }
    }

    fn new_request(&mut self, prompt: String) -> (PendingRequest, TokenStream) {
        self.next_session += 1;
        PendingRequest::new(SessionId(self.next_session), prompt)
    }

    fn begin(&mut self, request: &PendingRequest) {
        self.admission.set_generating(true);
        self.current = Some(request.cancel.clone());
    }
}

pub(crate) struct Shared {
    state: Mutex<SharedState>,
    pub(crate) thermal: ThermalSignal,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: ThermalPolicy,
}

impl Shared {
    /// All guarded data is plain bookkeeping, so a poisoned lock is still usable.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by the worker when a session ends: hand over the next live
    /// queued request, or mark the engine idle.
    pub(crate) fn next_request(&self) -> Option<PendingRequest> {
        let mut st = self.lock();
        st.current = None;
        while let Some(request) = st.admission.pop_next() {
            if request.is_abandoned() {
                request.finish_cancelled();
                continue;
            }
            tracing::debug!(
                session = %request.id,
                queue_len = st.admission.len(),
                "dequeued"
            );
            st.current = Some(request.cancel.clone());
            return Some(request);
        }
        st.admission.set_generating(false);
        None
    }

    pub(crate) fn abandon_queue(&self) -> Vec<PendingRequest> {
        let mut st = self.lock();
        st.admission.set_generating(false);
        if let Some(token) = st.current.take() {
            token.cancel();
        }
        st.admission.drain().collect()
    }
}

pub struct RequestCoordinator {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: CoordinatorConfig,
}

impl RequestCoordinator {
    pub fn new<E>(engine: E, config: CoordinatorConfig) -> Result<Self>
    where
        E: NativeEngine + 'static,
    {
        Self::with_clock(engine, config, Arc::new(SystemClock))
    }

    pub fn with_clock<E>(engine: E, config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self>
    where
        E: NativeEngine + 'static,
    {
        let config = config.validated();
        let now = clock.now();
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                phase: ModelPhase::Idle,
                admission: AdmissionQueue::new(config.queue_capacity),
                rate: RateLimitWindow::new(config.rate_limit, now),
                current: None,
                next_session: 0,
            }),
            thermal: ThermalSignal::new(),
            clock,
            policy: ThermalPolicy::new(config.degradation),
        });

        let (commands, handle) = worker::spawn(engine, shared.clone(), &config)?;
        tracing::info!(
            queue_capacity = config.queue_capacity,
            context_size = config.context_size,
            "request coordinator started"
        );
        Ok(Self {
            shared,
            commands,
            worker: Mutex::new(Some(handle)),
            config,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ---------- model lifecycle ----------

    /// `threads <= 0` picks a count automatically.
    pub fn load_model(
        &self,
        path: impl AsRef<Path>,
        threads: i32,
        top_k: i32,
        top_p: f32,
        temperature: f32,
    ) -> Result<ModelInfo> {
        let request = LoadRequest::new(path.as_ref())
            .with_threads(usize::try_from(threads).unwrap_or(0))
            .with_sampling(SamplingParams::new(top_k, top_p, temperature));
        self.load(request)
    }

    /// Blocks until the worker has finished (or failed) the load. If a
    /// generation is running, the load waits for it.
    pub fn load(&self, request: LoadRequest) -> Result<ModelInfo> {
        {
            let mut st = self.shared.lock();
            match st.phase {
                ModelPhase::Loaded(_) => return Err(InvalidState::AlreadyLoaded.into()),
                ModelPhase::Loading => return Err(InvalidState::LoadInProgress.into()),
                ModelPhase::Idle => {}
            }
            st.phase = ModelPhase::Loading;
        }

        let (reply, rx) = mpsc::channel();
        let sent = self.commands.send(Command::Load { request, reply });
        match sent.ok().and_then(|()| rx.recv().ok()) {
            Some(result) => result,
            None => {
                self.shared.lock().phase = ModelPhase::Idle;
                Err(CoordinatorError::WorkerUnavailable)
            }
        }
    }

    /// No-op when nothing is loaded. Requests already admitted finish first.
    pub fn unload_model(&self) -> Result<()> {
        {
            let mut st = self.shared.lock();
            match st.phase {
                ModelPhase::Idle => return Ok(()),
                ModelPhase::Loading => return Err(InvalidState::LoadInProgress.into()),
                ModelPhase::Loaded(_) => {}
            }
            st.phase = ModelPhase::Idle;
        }

        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::Unload { reply })
            .map_err(|_| CoordinatorError::WorkerUnavailable)?;
        rx.recv().map_err(|_| CoordinatorError::WorkerUnavailable)?;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.shared.lock().phase, ModelPhase::Loaded(_))
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        match &self.shared.lock().phase {
            ModelPhase::Loaded(info) => Some(info.clone()),
            _ => None,
        }
    }

    // ---------- admission & generation ----------

    /// Admission check. Every call on a loaded model counts toward the rate
    /// limit, including rejected ones. `Err(QueueFull)` is backpressure for
    /// the user.
    ///
    /// `Admitted` reserves the engine, so two callers racing on an idle
    /// coordinator never both get it: the second one is queued.
    pub fn try_enqueue(&self, prompt: impl Into<String>) -> Result<Admission> {
        let mut st = self.shared.lock();
        if !matches!(st.phase, ModelPhase::Loaded(_)) {
            return Err(InvalidState::NotLoaded.into());
        }
        st.record_attempt(self.shared.clock.as_ref());
        st.purge_abandoned();

        let (request, stream) = st.new_request(prompt.into());
        match st.admission.try_enqueue(request) {
            Enqueue::Admitted(_) => {
                st.admission.set_generating(true);
                Ok(Admission::Admitted(Reservation {
                    shared: self.shared.clone(),
                    commands: self.commands.clone(),
                    armed: true,
                }))
            }
            Enqueue::Queued => {
                tracing::debug!(session = %stream.session(), queue_len = st.admission.len(), "queued");
                Ok(Admission::Queued(stream))
            }
            Enqueue::Rejected(_) => {
                let capacity = st.admission.capacity();
                tracing::warn!(capacity, "admission rejected: queue full");
                Err(CoordinatorError::QueueFull { capacity })
            }
        }
    }

    /// Start a generation right now on an idle engine. Fails with
    /// `GenerationInFlight` while another generation runs or an admitted
    /// caller holds a [`Reservation`]; prefer [`submit`](Self::submit) or
    /// `try_enqueue` when callers may race.
    pub fn generate(&self, prompt: impl Into<String>) -> Result<TokenStream> {
        let mut st = self.shared.lock();
        if !matches!(st.phase, ModelPhase::Loaded(_)) {
            return Err(InvalidState::NotLoaded.into());
        }
        if st.admission.is_generating() {
            return Err(InvalidState::GenerationInFlight.into());
        }

        let (request, stream) = st.new_request(prompt.into());
        st.begin(&request);
        drop(st);

        self.dispatch(request)?;
        Ok(stream)
    }

    /// Admission and start in one step: runs now, queues, or fails with
    /// `QueueFull`.
    pub fn submit(&self, prompt: impl Into<String>) -> Result<TokenStream> {
        let mut st = self.shared.lock();
        if !matches!(st.phase, ModelPhase::Loaded(_)) {
            return Err(InvalidState::NotLoaded.into());
        }
        st.record_attempt(self.shared.clock.as_ref());
        st.purge_abandoned();

        let (request, stream) = st.new_request(prompt.into());
        match st.admission.try_enqueue(request) {
            Enqueue::Admitted(request) => {
                st.begin(&request);
                drop(st);
                self.dispatch(request)?;
                Ok(stream)
            }
            Enqueue::Queued => {
                tracing::debug!(session = %stream.session(), queue_len = st.admission.len(), "queued");
                Ok(stream)
            }
            Enqueue::Rejected(_) => {
                let capacity = st.admission.capacity();
                tracing::warn!(capacity, "admission rejected: queue full");
                Err(CoordinatorError::QueueFull { capacity })
            }
        }
    }

    fn dispatch(&self, request: PendingRequest) -> Result<()> {
        dispatch(&self.shared, &self.commands, request)
    }

    /// Request cancellation of the generation in flight. Returns false if
    /// nothing was running. Takes effect at the session's next checkpoint.
    pub fn cancel(&self) -> bool {
        match &self.shared.lock().current {
            Some(token) => {
                token.cancel();
                tracing::info!("cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.shared.lock().admission.is_generating()
    }

    pub fn is_queued(&self) -> bool {
        self.queue_size() > 0
    }

    pub fn queue_size(&self) -> usize {
        let mut st = self.shared.lock();
        st.purge_abandoned();
        st.admission.len()
    }

    // ---------- degradation signals ----------

    pub fn is_rate_limited(&self) -> bool {
        self.shared.lock().rate.is_rate_limited()
    }

    pub fn rate_limit_cooldown_seconds(&self) -> u64 {
        let now = self.shared.clock.now();
        self.shared.lock().rate.cooldown_seconds(now)
    }

    pub fn set_thermal_state(&self, throttled: bool) {
        if self.shared.thermal.set(throttled) != throttled {
            tracing::info!(throttled, "thermal state changed");
        }
    }

    pub fn is_thermal_throttled(&self) -> bool {
        self.shared.thermal.is_throttled()
    }

    /// Handle for a thermal monitor that lives elsewhere.
    pub fn thermal_signal(&self) -> ThermalSignal {
        self.shared.thermal.clone()
    }

    // ---------- auxiliary ----------

    /// Pooled embedding of `text`. Waits behind any running generation.
    pub fn embed(&self, text: impl Into<String>) -> Result<Vec<f32>> {
        if !self.is_loaded() {
            return Err(InvalidState::NotLoaded.into());
        }
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::Embed {
                text: text.into(),
                reply,
            })
            .map_err(|_| CoordinatorError::WorkerUnavailable)?;
        rx.recv().map_err(|_| CoordinatorError::WorkerUnavailable)?
    }

    /// Cancel everything, unload, free the backend and join the worker.
    /// Later calls fail with `WorkerUnavailable` or `NotLoaded`.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        for request in self.shared.abandon_queue() {
            request.reject(CoordinatorError::WorkerUnavailable);
        }
        let _ = self.commands.send(Command::Shutdown);
        if handle.join().is_err() {
            tracing::error!("engine worker panicked");
        }
    }
}

impl Drop for RequestCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
