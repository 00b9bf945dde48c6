//! Deferred replies for blocked lock requests and queued I/O.
//!
//! A blocked request stores a [`Waiter`] inside its lock record; the caller
//! keeps the matching [`WaitHandle`]. Whoever later grants or cancels the
//! request resolves the waiter, always after the inode mutex is released.

use tokio::sync::oneshot;

use crate::error::{LockError, Result};

/// Outcome delivered to a parked caller.
pub type WaitOutcome = Result<()>;

/// Sending half stored in a blocked record.
#[derive(Debug)]
pub struct Waiter {
    tx: oneshot::Sender<WaitOutcome>,
}

/// Receiving half held by the parked caller.
#[derive(Debug)]
pub struct WaitHandle {
    rx: oneshot::Receiver<WaitOutcome>,
}

/// Creates a connected waiter pair.
pub fn waiter() -> (Waiter, WaitHandle) {
    let (tx, rx) = oneshot::channel();
    (Waiter { tx }, WaitHandle { rx })
}

impl Waiter {
    /// Resolves the parked caller. A caller that went away is ignored.
    pub fn resolve(self, outcome: WaitOutcome) {
        let _ = self.tx.send(outcome);
    }

    /// True if the parked caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl WaitHandle {
    /// Waits until the request is granted or cancelled.
    ///
    /// A waiter dropped without being resolved (its inode state was torn
    /// down) counts as a cancellation.
    pub async fn wait(self) -> WaitOutcome {
        self.rx.await.unwrap_or(Err(LockError::Cancelled))
    }
}

/// Replies decided under the inode mutex, delivered after it is released.
#[derive(Debug, Default)]
pub struct Wakeups {
    pending: Vec<(Waiter, WaitOutcome)>,
}

impl Wakeups {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a success reply.
    pub fn grant(&mut self, waiter: Waiter) {
        self.pending.push((waiter, Ok(())));
    }

    /// Queues a failure reply.
    pub fn fail(&mut self, waiter: Waiter, err: LockError) {
        self.pending.push((waiter, Err(err)));
    }

    /// Number of replies queued so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delivers every queued reply in the order it was decided.
    ///
    /// Must only be called once the inode mutex guard has been dropped.
    pub fn notify(self) {
        for (waiter, outcome) in self.pending {
            waiter.resolve(outcome);
        }
    }
}
