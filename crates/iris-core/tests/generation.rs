mod common;

use std::time::Duration;

use common::{eventually, loaded, WAIT};
use iris_core::scripted::{EngineCall, FailAt};
use iris_core::{CoordinatorError, FinishReason, InvalidState, ScriptedEngine};

#[test]
fn clean_run_yields_five_chunks_without_delay() {
    let (c, clock) = loaded(ScriptedEngine::new());

    let (text, outcome) = c.generate("hello").unwrap().into_text().unwrap();

    assert_eq!(text, "Hello, world! 👋");
    assert_eq!(outcome.stats.emitted, 5);
    assert_eq!(outcome.finish_reason(), Some(FinishReason::EndOfSequence));
    assert!(clock.sleeps().is_empty());
    assert!(!c.is_generating());
}

#[test]
fn each_chunk_arrives_separately() {
    let (c, _) = loaded(ScriptedEngine::new().with_response(["a", "b", "c"]));
    let chunks: Vec<String> = c
        .generate("x")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks, ["a", "b", "c"]);
}

#[test]
fn thermal_throttle_set_mid_stream_paces_later_tokens() {
    let engine = ScriptedEngine::new().hold_at(2);
    let probe = engine.probe();
    let (c, clock) = loaded(engine);

    let mut stream = c.generate("hello").unwrap();
    assert_eq!(stream.next().unwrap().unwrap(), "Hello");
    assert_eq!(stream.next().unwrap().unwrap(), ",");
    assert!(probe.wait_until_held(WAIT));

    c.set_thermal_state(true);
    assert!(c.is_thermal_throttled());
    probe.release();

    let rest: Vec<String> = stream.by_ref().collect::<Result<_, _>>().unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(clock.sleeps(), [Duration::from_millis(100); 3]);
    assert_eq!(stream.outcome().unwrap().stats.delayed_tokens, 3);
}

#[test]
fn end_of_turn_marker_split_across_chunks_is_never_emitted() {
    let engine = ScriptedEngine::new()
        .with_marker("</s>")
        .with_response(["The", " answer", " is 4.", "</", "s>", " more"]);
    let (c, _) = loaded(engine);

    let mut stream = c.generate("2+2?").unwrap();
    let chunks: Vec<String> = stream.by_ref().collect::<Result<_, _>>().unwrap();

    assert!(chunks.iter().all(|c| !c.contains("</s>")));
    assert_eq!(chunks.concat(), "The answer is 4.</");
    let outcome = stream.outcome().unwrap();
    assert!(outcome.is_incomplete());
    assert_eq!(outcome.finish_reason(), Some(FinishReason::EndOfTurn));
}

#[test]
fn cancel_stops_the_stream_and_next_session_starts_clean() {
    let engine = ScriptedEngine::new().endless().hold_at(3);
    let probe = engine.probe();
    let (c, _) = loaded(engine);

    let mut stream = c.generate("tell me a story").unwrap();
    for _ in 0..3 {
        stream.next().unwrap().unwrap();
    }
    assert!(probe.wait_until_held(WAIT));
    assert!(c.cancel());
    probe.release();

    let after: Vec<_> = stream.by_ref().collect();
    assert!(after.is_empty(), "{after:?}");
    let outcome = stream.outcome().unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.stats.emitted, 3);
    assert_eq!(probe.count(&EngineCall::ResetCache), 0);
    assert!(!c.cancel(), "nothing left to cancel");

    let mut next = c.generate("again").unwrap();
    next.next().unwrap().unwrap();
    next.cancel();
    drop(next);

    let calls = probe.calls();
    let init = calls
        .iter()
        .position(|call| *call == EngineCall::InitGeneration("again".into()))
        .unwrap();
    assert_eq!(calls[init - 1], EngineCall::ResetCache);
}

#[test]
fn dropping_a_stream_cancels_its_generation() {
    let engine = ScriptedEngine::new().endless().hold_at(1);
    let probe = engine.probe();
    let (c, _) = loaded(engine);

    let mut stream = c.generate("x").unwrap();
    stream.next().unwrap().unwrap();
    assert!(probe.wait_until_held(WAIT));
    drop(stream);
    probe.release();

    assert!(eventually(|| !c.is_generating()));
    assert!(c.generate("y").is_ok());
}

#[test]
fn engine_failure_mid_stream_is_the_final_item() {
    let engine = ScriptedEngine::new().fail_at(FailAt::NextToken(1)).fail_once();
    let (c, _) = loaded(engine);

    let mut stream = c.generate("hello").unwrap();
    assert_eq!(stream.next().unwrap().unwrap(), "Hello");
    assert!(matches!(stream.next(), Some(Err(CoordinatorError::Engine(_)))));
    assert!(stream.next().is_none());
    assert!(stream.outcome().unwrap().error().is_some());

    // Failure is per session; the model stays loaded.
    let (text, _) = c.generate("hello").unwrap().into_text().unwrap();
    assert_eq!(text, "Hello, world! 👋");
}

#[test]
fn generate_rejects_a_second_concurrent_call() {
    let engine = ScriptedEngine::new().hold_at(0);
    let probe = engine.probe();
    let (c, _) = loaded(engine);

    let stream = c.generate("first").unwrap();
    assert!(probe.wait_until_held(WAIT));
    assert!(matches!(
        c.generate("second"),
        Err(CoordinatorError::InvalidState(InvalidState::GenerationInFlight))
    ));

    probe.release();
    assert_eq!(stream.count(), 5);
}

#[test]
fn token_limit_from_config_applies() {
    let mut config = iris_core::CoordinatorConfig::default();
    config.max_new_tokens = 4;
    let (c, _) = common::coordinator_with(ScriptedEngine::new().endless(), config);
    c.load_model("/m", 0, 40, 0.9, 0.7).unwrap();

    let (_, outcome) = c.generate("go").unwrap().into_text().unwrap();
    assert_eq!(outcome.stats.emitted, 5, "the cap itself is inclusive");
    assert_eq!(outcome.finish_reason(), Some(FinishReason::TokenLimit));
}
