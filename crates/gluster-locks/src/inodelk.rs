//! Range inode locks, scoped to a domain.
//!
//! Unlike POSIX locks these are never merged or split: each request is its
//! own record, and an unlock must name the exact range its owner locked.

use std::borrow::Cow;
use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};

use crate::error::{LockError, Result};
use crate::grant::{Acquire, BlockedQueue, Verdict};
use crate::record::{LockRecord, RangeInodeLock};
use crate::state::RangeList;
use crate::types::{Flock, LockRange, Owner};
use crate::waiter::{waiter, Wakeups};

/// Offset that marks a lock on the inode's metadata rather than its data.
pub const METADATA_LOCK_START: i64 = i64::MAX - 1;

const METADATA_SUFFIX: &str = ":metadata";

/// Domain a request is served in; metadata locks get a domain of their own.
pub fn effective_domain<'a>(domain: &'a str, flock: &Flock) -> Cow<'a, str> {
    if flock.start == METADATA_LOCK_START && flock.len == 0 && !domain.ends_with(METADATA_SUFFIX) {
        Cow::Owned(format!("{}{}", domain, METADATA_SUFFIX))
    } else {
        Cow::Borrowed(domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Grantable,
    Conflict,
    Starving,
}

fn check(granted: &[RangeInodeLock], blocked: &VecDeque<RangeInodeLock>, lock: &RangeInodeLock) -> Check {
    if granted
        .iter()
        .any(|l| l.conflicts_with(lock) && !l.owner.same(&lock.owner))
    {
        return Check::Conflict;
    }
    let owner_has_lock = granted.iter().any(|l| l.owner.same(&lock.owner))
        || blocked.iter().any(|l| l.owner.same(&lock.owner));
    if blocked.iter().any(|l| !l.is_abandoned() && l.conflicts_with(lock)) && !owner_has_lock {
        Check::Starving
    } else {
        Check::Grantable
    }
}

/// SETLK / SETLKW of a shared or exclusive range.
pub fn lock_range(list: &mut RangeList, mut lock: RangeInodeLock, can_block: bool) -> Result<Acquire> {
    let verdict = check(&list.granted, &list.blocked, &lock);
    if verdict == Check::Grantable {
        list.granted.try_reserve(1)?;
        trace!(owner = %lock.owner, range = %lock.range, "Lock => OK");
        lock.set_blocked(false);
        list.granted.push(lock);
        return Ok(Acquire::Granted);
    }

    if !can_block {
        trace!(owner = %lock.owner, range = %lock.range, "Lock => NOK");
        return Err(LockError::WouldBlock);
    }

    list.blocked.try_reserve(1)?;
    if verdict == Check::Starving {
        debug!("Lock is grantable, but blocking to prevent starvation");
    }
    trace!(owner = %lock.owner, range = %lock.range, "Lock => Blocked");
    let (reply, handle) = waiter();
    lock.waiter = Some(reply);
    lock.set_blocked(true);
    list.blocked.push_back(lock);
    Ok(Acquire::Blocked(handle))
}

/// Removes the owner's lock with exactly this range.
pub fn unlock_range(list: &mut RangeList, owner: &Owner, range: &LockRange) -> Result<RangeInodeLock> {
    let pos = list
        .granted
        .iter()
        .position(|l| l.range == *range && l.owner.same(owner));
    match pos {
        Some(pos) => {
            debug!(owner = %owner, range = %range, "Matching lock found for unlock");
            Ok(list.granted.remove(pos))
        }
        None => {
            error!(owner = %owner, range = %range, "Matching lock not found for unlock");
            Err(LockError::not_found(format!("inodelk {} held by {}", range, owner)))
        }
    }
}

impl BlockedQueue for RangeList {
    type Lock = RangeInodeLock;

    fn blocked(&mut self) -> &mut VecDeque<RangeInodeLock> {
        &mut self.blocked
    }

    fn try_grant(
        &mut self,
        mut lock: RangeInodeLock,
        ahead: &VecDeque<RangeInodeLock>,
    ) -> Verdict<RangeInodeLock> {
        if check(&self.granted, ahead, &lock) != Check::Grantable {
            return Verdict::Blocked(lock);
        }
        let waiter = lock.take_waiter();
        if let Err(err) = self.granted.try_reserve(1) {
            return Verdict::Failed(waiter, err.into());
        }
        trace!(owner = %lock.owner, range = %lock.range, "=> Granted");
        lock.set_blocked(false);
        self.granted.push(lock);
        Verdict::Granted(waiter)
    }
}

/// Removes every lock `owner` covers, granted or waiting.
///
/// Returns `(granted released, blocked cancelled)`.
pub fn release_owner(list: &mut RangeList, owner: &Owner, wake: &mut Wakeups) -> (usize, usize) {
    let before = list.granted.len();
    list.granted.retain(|l| {
        let hit = owner.covers(&l.owner);
        if hit {
            warn!(owner = %l.owner, range = %l.range, "releasing inode lock");
        }
        !hit
    });
    let granted = before - list.granted.len();

    let before = list.blocked.len();
    let mut kept = VecDeque::with_capacity(before);
    for mut lock in list.blocked.drain(..) {
        if owner.covers(&lock.owner) {
            if let Some(w) = lock.take_waiter() {
                wake.fail(w, LockError::Cancelled);
            }
        } else {
            kept.push_back(lock);
        }
    }
    list.blocked = kept;
    (granted, before - list.blocked.len())
}
