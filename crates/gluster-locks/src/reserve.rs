//! Reservation locks and the POSIX calls they hold back.
//!
//! A reservation marks one exact byte range for its owner. While it stands,
//! another owner's POSIX lock request on that exact range is refused, or
//! parked on the deferred-call queue when it is allowed to wait, and re-run
//! once the reservation goes away.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::{LockError, Result};
use crate::grant::{grant_blocked, Acquire, BlockedQueue, Verdict};
use crate::posix;
use crate::record::{ByteRangeLock, LockRecord, PosixKind, ReservationLock};
use crate::state::{IdGen, PosixList, ReservationList};
use crate::types::{LockRange, Owner};
use crate::waiter::{waiter, WaitHandle, Wakeups};

/// Outcome of the reservation check for a POSIX request.
#[derive(Debug)]
pub enum Admission {
    /// No reservation stands in the way.
    Proceed(ByteRangeLock),
    /// The caller's own reservation on the range was used up. Whatever
    /// queued behind it has to be re-run.
    Consumed(ByteRangeLock),
    /// Parked until the reservation is released.
    Deferred(WaitHandle),
}

/// Result of matching a POSIX request against the granted reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationCheck {
    /// No reservation on the range.
    Clear,
    /// The requester's own reservation was removed.
    Consumed,
    /// Another owner holds the range.
    Conflict,
}

fn matching(granted: &[ReservationLock], range: &LockRange) -> Option<usize> {
    granted.iter().position(|l| l.range == *range)
}

/// Checks a POSIX request against the reservations.
///
/// The caller's own reservation on the range is consumed.
pub fn reservation_conflict(list: &mut ReservationList, owner: &Owner, range: &LockRange) -> ReservationCheck {
    let Some(pos) = matching(&list.granted, range) else {
        return ReservationCheck::Clear;
    };
    if list.granted[pos].owner.same(owner) {
        trace!(owner = %owner, range = %range, "Removing the matching reservelk for setlk to progress");
        list.granted.remove(pos);
        ReservationCheck::Consumed
    } else {
        trace!(owner = %owner, range = %range, "Conflicting reservelk found");
        ReservationCheck::Conflict
    }
}

/// Reservation check in front of a POSIX set-lock.
///
/// Returns the lock back when the call may proceed. A conflicting call is
/// refused, or parked until the reservation is released when it may wait.
pub fn verify(
    list: &mut ReservationList,
    mut lock: ByteRangeLock,
    can_block: bool,
) -> Result<Admission> {
    if lock.kind == PosixKind::Unlock {
        return Ok(Admission::Proceed(lock));
    }
    match reservation_conflict(list, &lock.owner, &lock.range) {
        ReservationCheck::Clear => return Ok(Admission::Proceed(lock)),
        ReservationCheck::Consumed => return Ok(Admission::Consumed(lock)),
        ReservationCheck::Conflict => {}
    }
    if !can_block {
        return Err(LockError::WouldBlock);
    }
    list.deferred.try_reserve(1)?;
    trace!(owner = %lock.owner, range = %lock.range, "Lock blocked due to conflicting reserve lock");
    let (reply, handle) = waiter();
    lock.waiter = Some(reply);
    lock.set_blocked(true);
    list.deferred.push_back(lock);
    Ok(Admission::Deferred(handle))
}

/// RESLK_LCK / RESLK_LCKW.
///
/// The owner's previous reservation on the same range is replaced.
pub fn reserve(list: &mut ReservationList, mut lock: ReservationLock, can_block: bool) -> Result<Acquire> {
    if let Some(pos) = matching(&list.granted, &lock.range) {
        if list.granted[pos].owner.same(&lock.owner) {
            list.granted.remove(pos);
        } else if !can_block {
            trace!(owner = %lock.owner, range = %lock.range, "Reserve => NOK");
            return Err(LockError::WouldBlock);
        } else {
            list.blocked.try_reserve(1)?;
            trace!(owner = %lock.owner, range = %lock.range, "Reserve => Blocked");
            let (reply, handle) = waiter();
            lock.waiter = Some(reply);
            lock.set_blocked(true);
            list.blocked.push_back(lock);
            return Ok(Acquire::Blocked(handle));
        }
    }
    list.granted.try_reserve(1)?;
    trace!(owner = %lock.owner, range = %lock.range, "Reserve => OK");
    lock.set_blocked(false);
    list.granted.push(lock);
    Ok(Acquire::Granted)
}

/// RESLK_UNLCK: removes the owner's reservation on exactly `range`.
pub fn release(list: &mut ReservationList, owner: &Owner, range: &LockRange) -> Result<ReservationLock> {
    let pos = list
        .granted
        .iter()
        .position(|l| l.range == *range && l.owner.same(owner));
    match pos {
        Some(pos) => {
            trace!(owner = %owner, range = %range, "Reservelk Unlock successful");
            Ok(list.granted.remove(pos))
        }
        None => {
            debug!(owner = %owner, range = %range, "Bad Unlock issued on reservation");
            Err(LockError::not_found(format!("reservation {} held by {}", range, owner)))
        }
    }
}

impl BlockedQueue for ReservationList {
    type Lock = ReservationLock;

    fn blocked(&mut self) -> &mut VecDeque<ReservationLock> {
        &mut self.blocked
    }

    fn try_grant(
        &mut self,
        mut lock: ReservationLock,
        _ahead: &VecDeque<ReservationLock>,
    ) -> Verdict<ReservationLock> {
        if let Some(pos) = matching(&self.granted, &lock.range) {
            if !self.granted[pos].owner.same(&lock.owner) {
                return Verdict::Blocked(lock);
            }
            self.granted.remove(pos);
        }
        let waiter = lock.take_waiter();
        if let Err(err) = self.granted.try_reserve(1) {
            return Verdict::Failed(waiter, err.into());
        }
        trace!(owner = %lock.owner, range = %lock.range, "Reserve => Granted");
        lock.set_blocked(false);
        self.granted.push(lock);
        Verdict::Granted(waiter)
    }
}

/// Runs after a reservation goes away: grants blocked reservations and
/// re-runs the POSIX calls parked behind reservations.
///
/// A call whose reservation is gone goes through the normal set-lock path
/// with its original reply: it is granted, or joins the POSIX queue. A
/// replayed call may use up its owner's reservation, so the two steps repeat
/// until a pass consumes none. Returns the number of calls resumed.
pub fn replay_deferred(
    list: &mut ReservationList,
    posix_list: &mut PosixList,
    ids: &mut IdGen,
    wake: &mut Wakeups,
) -> usize {
    let mut resumed = 0;
    loop {
        grant_blocked(list, wake);
        let (n, consumed) = replay_pass(list, posix_list, ids, wake);
        resumed += n;
        if !consumed {
            return resumed;
        }
    }
}

fn replay_pass(
    list: &mut ReservationList,
    posix_list: &mut PosixList,
    ids: &mut IdGen,
    wake: &mut Wakeups,
) -> (usize, bool) {
    let deferred = std::mem::take(&mut list.deferred);
    let mut resumed = 0;
    let mut consumed = false;
    for mut call in deferred {
        if call.is_abandoned() {
            continue;
        }
        match reservation_conflict(list, &call.owner, &call.range) {
            ReservationCheck::Conflict => {
                list.deferred.push_back(call);
                continue;
            }
            ReservationCheck::Consumed => consumed = true,
            ReservationCheck::Clear => {}
        }
        resumed += 1;
        let reply = call.take_waiter();
        call.set_blocked(false);
        if let Err(err) = posix::place(posix_list, ids, call, true, reply, wake) {
            debug!(error = %err, "Deferred lock call failed");
        }
    }
    (resumed, consumed)
}

/// Removes every reservation and deferred call `owner` covers.
///
/// Returns `(granted released, waiting cancelled)`.
pub fn release_owner(list: &mut ReservationList, owner: &Owner, wake: &mut Wakeups) -> (usize, usize) {
    let before = list.granted.len();
    list.granted.retain(|l| !owner.covers(&l.owner));
    let granted = before - list.granted.len();

    let mut cancelled = 0;
    let blocked = std::mem::take(&mut list.blocked);
    for mut lock in blocked {
        if owner.covers(&lock.owner) {
            cancelled += 1;
            if let Some(w) = lock.take_waiter() {
                wake.fail(w, LockError::Cancelled);
            }
        } else {
            list.blocked.push_back(lock);
        }
    }
    let deferred = std::mem::take(&mut list.deferred);
    for mut call in deferred {
        if owner.covers(&call.owner) {
            cancelled += 1;
            if let Some(w) = call.take_waiter() {
                wake.fail(w, LockError::Cancelled);
            }
        } else {
            list.deferred.push_back(call);
        }
    }
    (granted, cancelled)
}
