//! Failure scripting shared by the stub adapters.
//!
//! Each stub owns one [`Script`]. Every call pops the next scripted error
//! kind (if any), counts itself, and optionally sleeps first so timeout
//! handling can be exercised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ErrorKind, StageError, StageResult};

#[derive(Debug, Default)]
pub struct Script {
    queue: Mutex<VecDeque<ErrorKind>>,
    always: Option<ErrorKind>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Script {
    /// Fail with these kinds, in order, then succeed.
    pub fn failures(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.queue = Mutex::new(kinds.into_iter().collect());
        self
    }

    /// Fail every call with `kind` once the queue is exhausted.
    pub fn always(mut self, kind: ErrorKind) -> Self {
        self.always = Some(kind);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Record one call and return the scripted outcome for it.
    pub fn step(&self, who: &str) -> StageResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let scripted = self.queue.lock().pop_front().or(self.always);
        match scripted {
            Some(kind) => Err(StageError::new(kind, format!("{who}: scripted failure on call {n}"))),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
