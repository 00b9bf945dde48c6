//! Entry (name) locks within a directory domain.
//!
//! A lock names one entry of a directory, or every entry when the basename is
//! absent. Any granted lock with a conflicting name blocks a new request,
//! whoever holds it. A request that would be grantable still queues behind a
//! conflicting waiter unless its owner already has a lock in the domain.

use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};

use crate::error::{LockError, Result};
use crate::grant::{Acquire, BlockedQueue, Verdict};
use crate::record::{names_conflict, LockRecord, NamedEntryLock};
use crate::state::EntryList;
use crate::types::Owner;
use crate::waiter::{waiter, Wakeups};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    Grantable,
    Conflict,
    Starving,
}

fn conflicts(a: &NamedEntryLock, b: &NamedEntryLock) -> bool {
    names_conflict(a.basename.as_deref(), b.basename.as_deref())
}

fn owner_has_lock(granted: &[NamedEntryLock], blocked: &VecDeque<NamedEntryLock>, owner: &Owner) -> bool {
    granted.iter().any(|l| l.owner.same(owner)) || blocked.iter().any(|l| l.owner.same(owner))
}

fn check(granted: &[NamedEntryLock], blocked: &VecDeque<NamedEntryLock>, lock: &NamedEntryLock) -> Check {
    if granted.iter().any(|l| conflicts(l, lock)) {
        Check::Conflict
    } else if blocked.iter().any(|l| !l.is_abandoned() && conflicts(l, lock))
        && !owner_has_lock(granted, blocked, &lock.owner)
    {
        Check::Starving
    } else {
        Check::Grantable
    }
}

/// ENTRYLK_LOCK / ENTRYLK_LOCK_NB.
pub fn lock_name(list: &mut EntryList, mut lock: NamedEntryLock, can_block: bool) -> Result<Acquire> {
    let verdict = check(&list.granted, &list.blocked, &lock);
    if verdict == Check::Grantable {
        list.granted.try_reserve(1)?;
        trace!(owner = %lock.owner, basename = ?lock.basename, "=> OK");
        lock.set_blocked(false);
        list.granted.push(lock);
        return Ok(Acquire::Granted);
    }

    if !can_block {
        trace!(owner = %lock.owner, basename = ?lock.basename, "=> NOK");
        return Err(LockError::WouldBlock);
    }

    list.blocked.try_reserve(1)?;
    if verdict == Check::Starving {
        debug!("Lock is grantable, but blocking to prevent starvation");
    }
    trace!(owner = %lock.owner, basename = ?lock.basename, "Blocking lock");
    let (reply, handle) = waiter();
    lock.waiter = Some(reply);
    lock.set_blocked(true);
    list.blocked.push_back(lock);
    Ok(Acquire::Blocked(handle))
}

/// ENTRYLK_UNLOCK. Returns the removed lock, or `None` when nothing matched.
///
/// Only a lock on exactly the same name is removed; the caller's own lock is
/// preferred when several owners hold that name.
pub fn unlock_name(list: &mut EntryList, owner: &Owner, basename: Option<&str>) -> Option<NamedEntryLock> {
    let matches = |l: &NamedEntryLock| l.basename.as_deref() == basename;
    let pos = list
        .granted
        .iter()
        .position(|l| matches(l) && l.owner.same(owner))
        .or_else(|| list.granted.iter().position(matches));

    match pos {
        Some(pos) => Some(list.granted.remove(pos)),
        None if list.granted.iter().any(|l| l.is_all_names()) => {
            error!(basename = ?basename, "Unlock for a non-existing lock!");
            None
        }
        None => {
            error!(basename = ?basename, "Unlock attempted but no matching lock found");
            None
        }
    }
}

impl BlockedQueue for EntryList {
    type Lock = NamedEntryLock;

    fn blocked(&mut self) -> &mut VecDeque<NamedEntryLock> {
        &mut self.blocked
    }

    fn try_grant(
        &mut self,
        mut lock: NamedEntryLock,
        ahead: &VecDeque<NamedEntryLock>,
    ) -> Verdict<NamedEntryLock> {
        if check(&self.granted, ahead, &lock) != Check::Grantable {
            return Verdict::Blocked(lock);
        }
        let waiter = lock.take_waiter();
        if let Err(err) = self.granted.try_reserve(1) {
            return Verdict::Failed(waiter, err.into());
        }
        trace!(owner = %lock.owner, basename = ?lock.basename, "=> Granted");
        lock.set_blocked(false);
        self.granted.push(lock);
        Verdict::Granted(waiter)
    }
}

/// Removes every lock `owner` covers, granted or waiting.
///
/// Returns `(granted released, blocked cancelled)`.
pub fn release_owner(list: &mut EntryList, owner: &Owner, wake: &mut Wakeups) -> (usize, usize) {
    let before = list.granted.len();
    list.granted.retain(|l| {
        let hit = owner.covers(&l.owner);
        if hit {
            warn!(owner = %l.owner, basename = ?l.basename, "releasing entry lock");
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

/// True if a granted lock names `basename` itself (not the whole directory).
pub fn has_name_lock(list: &EntryList, basename: &str) -> bool {
    list.granted
        .iter()
        .any(|l| l.basename.as_deref() == Some(basename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::grant_blocked;
    use crate::record::LockId;

    fn req(id: u64, owner: Owner, name: Option<&str>) -> NamedEntryLock {
        NamedEntryLock::new(LockId::new(id), owner, name.map(str::to_string))
    }

    #[test]
    fn test_different_names_coexist() {
        let mut list = EntryList::default();
        assert!(lock_name(&mut list, req(1, Owner::new(1, 1), Some("a")), false).unwrap().is_granted());
        assert!(lock_name(&mut list, req(2, Owner::new(2, 1), Some("b")), false).unwrap().is_granted());
        assert_eq!(list.granted.len(), 2);
    }

    #[test]
    fn test_wildcard_conflicts_with_name() {
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), None), false).unwrap();
        let err = lock_name(&mut list, req(2, Owner::new(2, 1), Some("x")), false).unwrap_err();
        assert_eq!(err, LockError::WouldBlock);
    }

    #[test]
    fn test_same_name_conflicts_even_for_same_owner() {
        let mut list = EntryList::default();
        let a = Owner::new(1, 1);
        lock_name(&mut list, req(1, a, Some("x")), false).unwrap();
        assert!(lock_name(&mut list, req(2, a, Some("x")), false).is_err());
    }

    #[tokio::test]
    async fn test_wildcard_unlock_grants_waiter() {
        let mut list = EntryList::default();
        let a = Owner::new(1, 1);
        lock_name(&mut list, req(1, a, None), false).unwrap();
        let handle = match lock_name(&mut list, req(2, Owner::new(2, 1), Some("x")), true).unwrap() {
            Acquire::Blocked(h) => h,
            Acquire::Granted => panic!("should block"),
        };

        assert!(unlock_name(&mut list, &a, None).is_some());
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut list, &mut wake), 1);
        wake.notify();
        assert_eq!(handle.wait().await, Ok(()));
        assert_eq!(list.granted[0].basename.as_deref(), Some("x"));
    }

    #[test]
    fn test_starvation_avoidance() {
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), Some("x")), false).unwrap();
        // b waits for the whole directory
        let _b = lock_name(&mut list, req(2, Owner::new(2, 1), None), true).unwrap();
        // c's name is free but conflicts with b's waiting wildcard
        let err = lock_name(&mut list, req(3, Owner::new(3, 1), Some("y")), false).unwrap_err();
        assert_eq!(err, LockError::WouldBlock);
        // a already holds a lock here, so it is not held back
        assert!(lock_name(&mut list, req(4, Owner::new(1, 1), Some("z")), false)
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_abandoned_waiter_does_not_hold_back_new_request() {
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), Some("x")), false).unwrap();
        let waiting = lock_name(&mut list, req(2, Owner::new(2, 1), None), true).unwrap();
        drop(waiting);
        assert!(lock_name(&mut list, req(3, Owner::new(3, 1), Some("y")), false)
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_cascade_respects_queue_order() {
        let mut list = EntryList::default();
        let a = Owner::new(1, 1);
        lock_name(&mut list, req(1, a, None), false).unwrap();
        let _b = lock_name(&mut list, req(2, Owner::new(2, 1), None), true).unwrap();
        let _c = lock_name(&mut list, req(3, Owner::new(3, 1), Some("y")), true).unwrap();

        unlock_name(&mut list, &a, None).unwrap();
        let mut wake = Wakeups::new();
        assert_eq!(grant_blocked(&mut list, &mut wake), 1);
        assert_eq!(list.granted[0].owner, Owner::new(2, 1));
        assert_eq!(list.blocked.len(), 1);
    }

    #[test]
    fn test_unlock_round_trip_restores_list() {
        let mut list = EntryList::default();
        let a = Owner::new(1, 1);
        lock_name(&mut list, req(1, Owner::new(9, 9), Some("other")), false).unwrap();
        lock_name(&mut list, req(2, a, Some("x")), false).unwrap();
        unlock_name(&mut list, &a, Some("x")).unwrap();
        assert_eq!(list.granted.len(), 1);
        assert_eq!(list.granted[0].basename.as_deref(), Some("other"));
    }

    #[test]
    fn test_unlock_without_match_is_none() {
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), None), false).unwrap();
        assert!(unlock_name(&mut list, &Owner::new(1, 1), Some("x")).is_none());
        assert_eq!(list.granted.len(), 1);
    }

    #[tokio::test]
    async fn test_release_owner_cancels_waiters() {
        let mut list = EntryList::default();
        let a = Owner::new(1, 1);
        let b = Owner::new(2, 1);
        lock_name(&mut list, req(1, a, Some("x")), false).unwrap();
        let handle = match lock_name(&mut list, req(2, b, Some("x")), true).unwrap() {
            Acquire::Blocked(h) => h,
            Acquire::Granted => panic!("should block"),
        };
        let mut wake = Wakeups::new();
        assert_eq!(release_owner(&mut list, &b, &mut wake), (0, 1));
        wake.notify();
        assert_eq!(handle.wait().await, Err(LockError::Cancelled));
        assert_eq!(list.granted.len(), 1);
    }

    #[test]
    fn test_has_name_lock() {
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), None), false).unwrap();
        assert!(!has_name_lock(&list, "x"));
        let mut list = EntryList::default();
        lock_name(&mut list, req(1, Owner::new(1, 1), Some("x")), false).unwrap();
        assert!(has_name_lock(&list, "x"));
    }
}
