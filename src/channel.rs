//! Result channel: live output chunks followed by exactly one final result.
//!
//! The producer side is split in two. [`ChunkSender`] is cloned into the output
//! pump threads; [`EventSink`] is held by the supervisor and consumed by
//! [`EventSink::finish`]. Both share a gate so no chunk can be queued after
//! [`OutputEvent::Finished`]. Sends to a dropped receiver are ignored: a caller
//! that stops listening does not affect the run.

use crate::config::types::RunResult;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Always the last event of a run
    Finished(RunResult),
}

impl OutputEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, OutputEvent::Finished(_))
    }
}

/// Create a connected sink/stream pair for one run.
pub fn result_channel() -> (EventSink, ResultStream) {
    let (tx, rx) = unbounded();
    let sink = EventSink {
        tx,
        closed: Arc::new(Mutex::new(false)),
    };
    (sink, ResultStream { rx, done: false })
}

/// Producer side owned by the supervisor
#[derive(Debug)]
pub struct EventSink {
    tx: Sender<OutputEvent>,
    closed: Arc<Mutex<bool>>,
}

impl EventSink {
    pub fn chunks(&self) -> ChunkSender {
        ChunkSender {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Close the stream with the final result.
    ///
    /// Takes `self`, so a run can be finished only once.
    pub fn finish(self, result: RunResult) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
        if self.tx.send(OutputEvent::Finished(result)).is_err() {
            log::debug!("Result receiver dropped before the run finished");
        }
    }
}

/// Chunk producer for stream pump threads
#[derive(Clone, Debug)]
pub struct ChunkSender {
    tx: Sender<OutputEvent>,
    closed: Arc<Mutex<bool>>,
}

impl ChunkSender {
    pub fn stdout(&self, chunk: &[u8]) {
        self.send(|| OutputEvent::Stdout(chunk.to_vec()));
    }

    pub fn stderr(&self, chunk: &[u8]) {
        self.send(|| OutputEvent::Stderr(chunk.to_vec()));
    }

    fn send(&self, event: impl FnOnce() -> OutputEvent) {
        let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return;
        }
        // Receiver gone: keep draining, the run continues regardless.
        let _ = self.tx.send(event());
    }
}

/// Consumer side handed to the caller
#[derive(Debug)]
pub struct ResultStream {
    rx: Receiver<OutputEvent>,
    done: bool,
}

impl ResultStream {
    /// Next event, or `None` once the stream is finished.
    pub fn recv(&mut self) -> Option<OutputEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().ok()?;
        self.done = event.is_finished();
        Some(event)
    }

    /// Like [`ResultStream::recv`] with an upper bound on the wait.
    /// Returns `Ok(None)` once the stream is finished.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<OutputEvent>, RecvTimeoutError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.done = event.is_finished();
                Ok(Some(event))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Skip remaining chunks and return the final result.
    pub fn into_result(mut self) -> Option<RunResult> {
        while let Some(event) = self.recv() {
            if let OutputEvent::Finished(result) = event {
                return Some(result);
            }
        }
        None
    }
}

impl Iterator for ResultStream {
    type Item = OutputEvent;

    fn next(&mut self) -> Option<OutputEvent> {
        self.recv()
    }
}
