use std::sync::mpsc::{self, Receiver, Sender};

use crate::cancel::CancelToken;
use crate::error::{CoordinatorError, Result};
use crate::session::{SessionId, SessionOutcome};

pub(crate) enum StreamEvent {
    Chunk(String),
    End(SessionOutcome),
    /// The request never ran.
    Rejected(CoordinatorError),
}

/// A request on its way to the engine worker.
pub(crate) struct PendingRequest {
    pub(crate) id: SessionId,
    pub(crate) prompt: String,
    pub(crate) cancel: CancelToken,
    pub(crate) events: Sender<StreamEvent>,
}

impl PendingRequest {
    pub(crate) fn new(id: SessionId, prompt: String) -> (Self, TokenStream) {
        let (events, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let stream = TokenStream {
            session: id,
            events: rx,
            cancel: cancel.clone(),
            outcome: None,
            done: false,
        };
        let request = Self {
            id,
            prompt,
            cancel,
            events,
        };
        (request, stream)
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the stream without running anything.
    pub(crate) fn finish_cancelled(self) {
        let _ = self
            .events
            .send(StreamEvent::End(SessionOutcome::cancelled(self.id)));
    }

    pub(crate) fn reject(self, err: CoordinatorError) {
        let _ = self.events.send(StreamEvent::Rejected(err));
    }
}

/// Lazily produced chunks of one generation.
///
/// Blocks in `next` until the worker produces the next chunk. Ends with `None`
/// after a normal finish or cancellation; an engine failure surfaces as one
/// final `Err`. Dropping the stream cancels the request.
pub struct TokenStream {
    session: SessionId,
    events: Receiver<StreamEvent>,
    cancel: CancelToken,
    outcome: Option<SessionOutcome>,
    done: bool,
}

impl TokenStream {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Ask the worker to stop. Chunks still in flight are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Set once the stream is exhausted (absent if the request never ran).
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Drain the stream into one string plus its outcome.
    pub fn into_text(mut self) -> Result<(String, SessionOutcome)> {
        let mut text = String::new();
        for chunk in self.by_ref() {
            text.push_str(&chunk?);
        }
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| SessionOutcome::cancelled(self.session));
        Ok((text, outcome))
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let event = match self.events.recv() {
                Ok(event) => event,
                Err(_) => {
                    self.done = true;
                    return Some(Err(CoordinatorError::WorkerUnavailable));
                }
            };

            match event {
                StreamEvent::Chunk(chunk) => {
                    if !self.cancel.is_cancelled() {
                        return Some(Ok(chunk));
                    }
                }
                StreamEvent::End(outcome) => {
                    self.done = true;
                    let failed = outcome.error().cloned();
                    self.outcome = Some(outcome);
                    return failed.map(|e| Err(CoordinatorError::Engine(e)));
                }
                StreamEvent::Rejected(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FinishReason, SessionStats, Termination};
    use iris_abi::EngineError;

    fn completed(id: SessionId) -> SessionOutcome {
        SessionOutcome {
            session: id,
            termination: Termination::Completed(FinishReason::EndOfSequence),
            stats: SessionStats::default(),
        }
    }

    #[test]
    fn yields_chunks_then_records_outcome() {
        let (req, mut stream) = PendingRequest::new(SessionId(1), "p".into());
        req.events.send(StreamEvent::Chunk("a".into())).unwrap();
        req.events.send(StreamEvent::Chunk("b".into())).unwrap();
        req.events.send(StreamEvent::End(completed(req.id))).unwrap();

        assert_eq!(stream.next().unwrap().unwrap(), "a");
        assert_eq!(stream.next().unwrap().unwrap(), "b");
        assert!(stream.next().is_none());
        assert!(stream.is_finished());
        assert_eq!(
            stream.outcome().and_then(|o| o.finish_reason()),
            Some(FinishReason::EndOfSequence)
        );
        assert!(stream.next().is_none());
    }

    #[test]
    fn engine_failure_is_the_last_item() {
        let (req, stream) = PendingRequest::new(SessionId(2), "p".into());
        req.events.send(StreamEvent::Chunk("a".into())).unwrap();
        req.events
            .send(StreamEvent::End(SessionOutcome {
                session: req.id,
                termination: Termination::Failed(EngineError::native("boom")),
                stats: SessionStats::default(),
            }))
            .unwrap();

        let items: Vec<_> = stream.collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(CoordinatorError::Engine(_))));
    }

    #[test]
    fn cancelled_stream_swallows_buffered_chunks() {
        let (req, mut stream) = PendingRequest::new(SessionId(3), "p".into());
        req.events.send(StreamEvent::Chunk("late".into())).unwrap();
        stream.cancel();
        assert!(req.is_abandoned());
        req.finish_cancelled();

        assert!(stream.next().is_none());
        assert!(stream.outcome().unwrap().is_cancelled());
    }

    #[test]
    fn vanished_worker_is_reported() {
        let (req, mut stream) = PendingRequest::new(SessionId(4), "p".into());
        drop(req);
        assert!(matches!(
            stream.next(),
            Some(Err(CoordinatorError::WorkerUnavailable))
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn dropping_unfinished_stream_cancels() {
        let (req, stream) = PendingRequest::new(SessionId(5), "p".into());
        drop(stream);
        assert!(req.is_abandoned());
    }
}
