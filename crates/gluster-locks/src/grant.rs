//! The grant cascade shared by every lock engine.
//!
//! After any change to a granted set, the engine's blocked queue is re-tested
//! front to back. Grants are decided here and the replies are queued on a
//! [`Wakeups`] batch for delivery once the inode mutex is dropped.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::LockError;
use crate::record::LockRecord;
use crate::waiter::{WaitHandle, Waiter, Wakeups};

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    /// The lock is held on return.
    Granted,
    /// The request is queued; the handle resolves when it is granted or cancelled.
    Blocked(WaitHandle),
}

impl Acquire {
    /// True if the lock was granted without waiting.
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

/// What an engine decided for one blocked record.
#[derive(Debug)]
pub enum Verdict<L> {
    /// The record moved to the granted set.
    Granted(Option<Waiter>),
    /// Still conflicting; the record goes back to the queue.
    Blocked(L),
    /// The record could not be granted and is dropped.
    Failed(Option<Waiter>, LockError),
}

/// A blocked queue together with the granted set it waits on.
pub trait BlockedQueue {
    /// Record type held in the queue.
    type Lock: LockRecord;

    /// The waiting records, oldest first.
    fn blocked(&mut self) -> &mut VecDeque<Self::Lock>;

    /// Re-tests one record.
    ///
    /// `ahead` holds the records of the current pass that stay blocked and
    /// were queued before this one.
    fn try_grant(&mut self, lock: Self::Lock, ahead: &VecDeque<Self::Lock>) -> Verdict<Self::Lock>;
}

/// Grants every blocked record that has become grantable, oldest first.
///
/// Passes repeat until one grants nothing, so a grant that unblocks a later
/// record within the same call is honored. Records whose caller stopped
/// waiting are dropped. Returns the number of records granted.
pub fn grant_blocked<Q>(queue: &mut Q, wake: &mut Wakeups) -> usize
where
    Q: BlockedQueue + ?Sized,
{
    let mut total = 0;
    loop {
        let pending = std::mem::take(queue.blocked());
        if pending.is_empty() {
            break;
        }

        let mut requeued = VecDeque::with_capacity(pending.len());
        let mut progressed = false;
        for lock in pending {
            if lock.is_abandoned() {
                debug!(id = %lock.id(), owner = %lock.owner(), "Dropping abandoned blocked lock");
                progressed = true;
                continue;
            }
            match queue.try_grant(lock, &requeued) {
                Verdict::Granted(waiter) => {
                    total += 1;
                    progressed = true;
                    if let Some(waiter) = waiter {
                        wake.grant(waiter);
                    }
                }
                Verdict::Blocked(lock) => requeued.push_back(lock),
                Verdict::Failed(waiter, err) => {
                    progressed = true;
                    if let Some(waiter) = waiter {
                        wake.fail(waiter, err);
                    }
                }
            }
        }

        let arrived = std::mem::replace(queue.blocked(), requeued);
        queue.blocked().extend(arrived);

        if !progressed {
            break;
        }
    }

    if total > 0 {
        trace!(granted = total, "=> Granted");
    }
    total
}

/// Fails every record of a queue with `Cancelled`.
pub fn cancel_all<L: LockRecord>(queue: &mut VecDeque<L>, wake: &mut Wakeups) -> usize {
    let n = queue.len();
    for mut lock in queue.drain(..) {
        if let Some(waiter) = lock.take_waiter() {
            wake.fail(waiter, LockError::Cancelled);
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LockId, ReservationLock};
    use crate::types::{LockRange, Owner};
    use crate::waiter::waiter;

    /// Grants up to `capacity` holders; queue order is preserved.
    struct Slots {
        capacity: usize,
        granted: Vec<ReservationLock>,
        blocked: VecDeque<ReservationLock>,
    }

    impl BlockedQueue for Slots {
        type Lock = ReservationLock;

        fn blocked(&mut self) -> &mut VecDeque<ReservationLock> {
            &mut self.blocked
        }

        fn try_grant(
            &mut self,
            mut lock: ReservationLock,
            ahead: &VecDeque<ReservationLock>,
        ) -> Verdict<ReservationLock> {
            if self.granted.len() >= self.capacity || !ahead.is_empty() {
                return Verdict::Blocked(lock);
            }
            lock.set_blocked(false);
            let w = lock.take_waiter();
            self.granted.push(lock);
            Verdict::Granted(w)
        }
    }

    fn queued(id: u64) -> (ReservationLock, WaitHandle) {
        let mut lock = ReservationLock::new(LockId::new(id), Owner::new(id, 1), LockRange::whole());
        let (w, h) = waiter();
        lock.waiter = Some(w);
        lock.set_blocked(true);
        (lock, h)
    }

    #[tokio::test]
    async fn test_grants_in_fifo_order() {
        let (a, ha) = queued(1);
        let (b, _hb) = queued(2);
        let mut q = Slots {
            capacity: 1,
            granted: Vec::new(),
            blocked: VecDeque::from(vec![a, b]),
        };
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut q, &mut wake), 1);
        assert_eq!(q.granted[0].id, LockId::new(1));
        assert_eq!(q.blocked.len(), 1);
        wake.notify();
        assert_eq!(ha.wait().await, Ok(()));
    }

    #[test]
    fn test_repeats_until_no_progress() {
        let (a, _ha) = queued(1);
        let (b, _hb) = queued(2);
        let (c, _hc) = queued(3);
        let mut q = Slots {
            capacity: 2,
            granted: Vec::new(),
            blocked: VecDeque::from(vec![a, b, c]),
        };
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut q, &mut wake), 2);
        assert_eq!(wake.len(), 2);
        assert_eq!(q.blocked.len(), 1);
        assert_eq!(q.blocked[0].id, LockId::new(3));
    }

    #[test]
    fn test_abandoned_waiter_dropped() {
        let (a, ha) = queued(1);
        let (b, _hb) = queued(2);
        drop(ha);
        let mut q = Slots {
            capacity: 1,
            granted: Vec::new(),
            blocked: VecDeque::from(vec![a, b]),
        };
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut q, &mut wake), 1);
        assert_eq!(q.granted[0].id, LockId::new(2));
        assert!(q.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let (a, ha) = queued(1);
        let mut q = VecDeque::from(vec![a]);
        let mut wake = Wakeups::new();
        assert_eq!(cancel_all(&mut q, &mut wake), 1);
        wake.notify();
        assert_eq!(ha.wait().await, Err(LockError::Cancelled));
        assert!(q.is_empty());
    }

    #[test]
    fn test_empty_queue_is_noop() {
        let mut q = Slots {
            capacity: 1,
            granted: Vec::new(),
            blocked: VecDeque::new(),
        };
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut q, &mut wake), 0);
        assert!(wake.is_empty());
    }
}
