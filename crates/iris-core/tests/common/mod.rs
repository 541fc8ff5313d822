#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use iris_core::{CoordinatorConfig, ManualClock, RequestCoordinator, ScriptedEngine};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

/// `RUST_LOG=iris_core=trace cargo test -- --nocapture` to watch the worker.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn coordinator(engine: ScriptedEngine) -> (RequestCoordinator, ManualClock) {
    coordinator_with(engine, CoordinatorConfig::default())
}

pub fn coordinator_with(
    engine: ScriptedEngine,
    config: CoordinatorConfig,
) -> (RequestCoordinator, ManualClock) {
    init_tracing();
    let clock = ManualClock::new();
    let c = RequestCoordinator::with_clock(engine, config, Arc::new(clock.clone()))
        .expect("coordinator starts");
    (c, clock)
}

pub fn loaded(engine: ScriptedEngine) -> (RequestCoordinator, ManualClock) {
    let (c, clock) = coordinator(engine);
    c.load_model("/models/tiny.gguf", 2, 40, 0.9, 0.7)
        .expect("model loads");
    (c, clock)
}

/// Poll `cond` until it holds or `WAIT` runs out.
pub fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
