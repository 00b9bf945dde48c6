//! Mandatory-locking gate for reads and writes.
//!
//! On a mandatory-locked inode an I/O that overlaps another owner's lock is
//! held until the lock goes away. Reads are only held back by write locks;
//! writes by any lock.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{LockError, Result};
use crate::record::PosixKind;
use crate::state::PosixList;
use crate::types::{LockRange, Owner};
use crate::waiter::{waiter, WaitHandle, Waiter, Wakeups};

/// Kind of a gated I/O.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoKind {
    Read,
    Write,
}

/// An I/O parked until its range clears.
#[derive(Debug)]
pub struct PendingIo {
    pub owner: Owner,
    pub kind: IoKind,
    pub range: LockRange,
    waiter: Waiter,
}

/// Bytes touched by an I/O of `len` bytes at `offset`; nothing for an empty I/O.
pub fn io_range(offset: u64, len: u64) -> Option<LockRange> {
    if len == 0 {
        return None;
    }
    Some(LockRange::new(offset, offset.saturating_add(len - 1)))
}

/// True if no other owner's lock stands in the way of this I/O.
pub fn rw_allowable(list: &PosixList, owner: &Owner, kind: IoKind, range: &LockRange) -> bool {
    !list.granted.iter().any(|l| {
        l.range.overlaps(range)
            && !l.owner.same(owner)
            && (kind == IoKind::Write || l.kind == PosixKind::Write)
    })
}

/// Admits an I/O or parks it.
///
/// Returns `None` when the I/O may go ahead now, and a handle that resolves
/// once it may when it had to be queued.
pub fn check_io(
    list: &PosixList,
    pending: &mut VecDeque<PendingIo>,
    owner: &Owner,
    kind: IoKind,
    range: LockRange,
    nonblocking: bool,
) -> Result<Option<WaitHandle>> {
    if rw_allowable(list, owner, kind, &range) {
        return Ok(None);
    }
    if nonblocking {
        trace!(owner = %owner, range = %range, "returning EAGAIN as fd is O_NONBLOCK");
        return Err(LockError::WouldBlock);
    }
    pending.try_reserve(1)?;
    trace!(owner = %owner, range = %range, kind = ?kind, "Queueing I/O behind lock");
    let (reply, handle) = waiter();
    pending.push_back(PendingIo {
        owner: *owner,
        kind,
        range,
        waiter: reply,
    });
    Ok(Some(handle))
}

/// Releases every parked I/O whose range is clear now.
pub fn replay_pending_io(list: &PosixList, pending: &mut VecDeque<PendingIo>, wake: &mut Wakeups) -> usize {
    let queued = std::mem::take(pending);
    let mut resumed = 0;
    for io in queued {
        if io.waiter.is_abandoned() {
            continue;
        }
        if rw_allowable(list, &io.owner, io.kind, &io.range) {
            resumed += 1;
            wake.grant(io.waiter);
        } else {
            pending.push_back(io);
        }
    }
    resumed
}

/// Fails the parked I/O of `owner` with `Cancelled`.
pub fn cancel_owner(pending: &mut VecDeque<PendingIo>, owner: &Owner, wake: &mut Wakeups) -> usize {
    let queued = std::mem::take(pending);
    let mut cancelled = 0;
    for io in queued {
        if owner.covers(&io.owner) {
            cancelled += 1;
            wake.fail(io.waiter, LockError::Cancelled);
        } else {
            pending.push_back(io);
        }
    }
    cancelled
}

/// Fails every parked I/O with `Cancelled`.
pub fn cancel_all(pending: &mut VecDeque<PendingIo>, wake: &mut Wakeups) -> usize {
    let n = pending.len();
    for io in pending.drain(..) {
        wake.fail(io.waiter, LockError::Cancelled);
    }
    n
}
