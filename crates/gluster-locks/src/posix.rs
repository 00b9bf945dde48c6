//! POSIX byte-range locks (fcntl semantics).
//!
//! Granted locks of one owner are kept disjoint: same-kind locks that overlap
//! or touch are coalesced, and a lock of a different kind carves its range out
//! of what the owner already held. Unlocking is a merge with a lock of kind
//! `Unlock`, whose fragments are dropped instead of stored.

use tracing::{debug, trace};

use crate::error::{LockError, Result};
use crate::grant::{grant_blocked, Acquire, BlockedQueue, Verdict};
use crate::record::{ByteRangeLock, LockRecord, PosixKind};
use crate::state::{IdGen, PosixList};
use crate::types::{Flock, LockRange, Owner};
use crate::waiter::{waiter, Waiter, Wakeups};

/// First granted lock of another owner that forbids `(owner, kind, range)`.
pub fn first_conflict<'a>(
    list: &'a PosixList,
    owner: &Owner,
    kind: PosixKind,
    range: &LockRange,
) -> Option<&'a ByteRangeLock> {
    list.granted.iter().find(|l| {
        l.range.overlaps(range) && !l.owner.same(owner) && l.kind.conflicts_with(kind)
    })
}

/// True if `lock` could be granted right now.
pub fn is_grantable(list: &PosixList, lock: &ByteRangeLock) -> bool {
    first_conflict(list, &lock.owner, lock.kind, &lock.range).is_none()
}

/// F_GETLK: describes the first conflicting lock, or echoes the query as unlocked.
pub fn get_lock(list: &PosixList, owner: &Owner, kind: PosixKind, range: LockRange) -> Flock {
    match first_conflict(list, owner, kind, &range) {
        Some(conf) => Flock::from_range(conf.kind.into(), conf.range, conf.owner.pid),
        None => Flock::from_range(PosixKind::Unlock.into(), range, owner.pid),
    }
}

/// Parts of `big` left after removing `small`: the piece before and the piece after.
pub fn subtract(big: &LockRange, small: &LockRange) -> (Option<LockRange>, Option<LockRange>) {
    let before = (small.start > big.start).then(|| LockRange::new(big.start, small.start - 1));
    let after = (small.end < big.end).then(|| LockRange::new(small.end + 1, big.end));
    (before, after)
}

/// Inserts a granted lock, coalescing and splitting against the owner's locks.
///
/// Each step removes one of the owner's records from the list, so the loop
/// ends after at most as many steps as the owner holds records. Every
/// allocation happens before the list is touched; on error the list is
/// unchanged.
pub fn insert_and_merge(list: &mut PosixList, ids: &mut IdGen, lock: ByteRangeLock) -> Result<()> {
    let held = list
        .granted
        .iter()
        .filter(|l| l.owner.same(&lock.owner))
        .count();
    let mut fragments: Vec<ByteRangeLock> = Vec::new();
    fragments.try_reserve(2 * held)?;
    list.granted.try_reserve(held + 1)?;

    let mut pending = lock;
    loop {
        let pos = list.granted.iter().position(|l| {
            l.owner.same(&pending.owner)
                && (l.range.overlaps(&pending.range)
                    || (l.kind == pending.kind && l.range.touches(&pending.range)))
        });
        let Some(pos) = pos else { break };
        let old = list.granted.remove(pos);

        if old.kind == pending.kind {
            pending.range = pending.range.union(&old.range);
        } else {
            let (before, after) = subtract(&old.range, &pending.range);
            for range in [before, after].into_iter().flatten() {
                fragments.push(old.fragment(ids.next(), old.kind, range));
            }
        }
    }

    list.granted.extend(fragments);
    if pending.kind != PosixKind::Unlock {
        pending.blocked = false;
        list.granted.push(pending);
    }
    Ok(())
}

/// Grant-cascade view over the POSIX list.
pub struct PosixQueue<'a> {
    list: &'a mut PosixList,
    ids: &'a mut IdGen,
}

impl<'a> PosixQueue<'a> {
    pub fn new(list: &'a mut PosixList, ids: &'a mut IdGen) -> Self {
        Self { list, ids }
    }
}

impl BlockedQueue for PosixQueue<'_> {
    type Lock = ByteRangeLock;

    fn blocked(&mut self) -> &mut std::collections::VecDeque<ByteRangeLock> {
        &mut self.list.blocked
    }

    fn try_grant(
        &mut self,
        mut lock: ByteRangeLock,
        _ahead: &std::collections::VecDeque<ByteRangeLock>,
    ) -> Verdict<ByteRangeLock> {
        if !is_grantable(self.list, &lock) {
            return Verdict::Blocked(lock);
        }
        trace!(owner = %lock.owner, range = %lock.range, kind = ?lock.kind, "=> Granted");
        let waiter = lock.take_waiter();
        lock.set_blocked(false);
        match insert_and_merge(self.list, self.ids, lock) {
            Ok(()) => Verdict::Granted(waiter),
            Err(err) => Verdict::Failed(waiter, err),
        }
    }
}

/// Re-tests the blocked POSIX requests.
pub fn grant_blocked_posix(list: &mut PosixList, ids: &mut IdGen, wake: &mut Wakeups) -> usize {
    grant_blocked(&mut PosixQueue::new(list, ids), wake)
}

/// F_SETLK / F_SETLKW, including unlock.
///
/// A blocking request that conflicts first drops the caller's own locks over
/// the range, so two readers both upgrading cannot wait on each other.
pub fn set_lock(
    list: &mut PosixList,
    ids: &mut IdGen,
    mut lock: ByteRangeLock,
    can_block: bool,
    wake: &mut Wakeups,
) -> Result<Acquire> {
    if !can_block {
        return place(list, ids, lock, false, None, wake).map(|_| Acquire::Granted);
    }
    let (reply, handle) = waiter();
    lock.waiter = None;
    if place(list, ids, lock, true, Some(reply), wake)? {
        Ok(Acquire::Granted)
    } else {
        Ok(Acquire::Blocked(handle))
    }
}

/// Grants or queues `lock`; returns true if it was granted.
///
/// `reply` is resolved on grant (or failure) and parked in the record when
/// it has to wait.
pub(crate) fn place(
    list: &mut PosixList,
    ids: &mut IdGen,
    mut lock: ByteRangeLock,
    can_block: bool,
    reply: Option<Waiter>,
    wake: &mut Wakeups,
) -> Result<bool> {
    let what = if lock.kind == PosixKind::Unlock { "Unlock" } else { "Lock" };

    if can_block && !is_grantable(list, &lock) {
        let unlock = lock.fragment(ids.next(), PosixKind::Unlock, lock.range);
        match insert_and_merge(list, ids, unlock) {
            Ok(()) => {
                grant_blocked_posix(list, ids, wake);
            }
            Err(err) => debug!(error = %err, "Could not send pre-lock unlock"),
        }
    }

    if is_grantable(list, &lock) {
        trace!(owner = %lock.owner, range = %lock.range, "{} => OK", what);
        if let Err(err) = insert_and_merge(list, ids, lock) {
            if let Some(reply) = reply {
                wake.fail(reply, err.clone());
            }
            return Err(err);
        }
        if let Some(reply) = reply {
            wake.grant(reply);
        }
        grant_blocked_posix(list, ids, wake);
        Ok(true)
    } else if can_block {
        if let Err(err) = list.blocked.try_reserve(1) {
            let err = LockError::from(err);
            if let Some(reply) = reply {
                wake.fail(reply, err.clone());
            }
            return Err(err);
        }
        trace!(owner = %lock.owner, range = %lock.range, "{} => Blocked", what);
        lock.waiter = reply;
        lock.set_blocked(true);
        list.blocked.push_back(lock);
        Ok(false)
    } else {
        trace!(owner = %lock.owner, range = %lock.range, "{} => NOK", what);
        Err(LockError::WouldBlock)
    }
}

/// Drops the granted locks that `owner` covers; with the connection-wide
/// sentinel, that connection's waiting requests are cancelled as well.
///
/// Returns `(granted removed, blocked cancelled)`.
pub fn flush_owner(list: &mut PosixList, owner: &Owner, wake: &mut Wakeups) -> (usize, usize) {
    let before = list.granted.len();
    list.granted.retain(|l| {
        let hit = owner.covers(&l.owner);
        if hit {
            trace!(owner = %l.owner, range = %l.range, "Flushing lock");
        }
        !hit
    });
    let granted = before - list.granted.len();

    let blocked = if owner.is_connection_wide() {
        cancel_blocked(list, owner, wake)
    } else {
        0
    };
    (granted, blocked)
}

/// Cancels the waiting requests of `owner`.
pub fn cancel_blocked(list: &mut PosixList, owner: &Owner, wake: &mut Wakeups) -> usize {
    let before = list.blocked.len();
    let mut kept = std::collections::VecDeque::with_capacity(before);
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
    before - list.blocked.len()
}

/// True if another owner's granted lock covers any byte at or past `offset`.
pub fn truncate_conflict(list: &PosixList, owner: &Owner, offset: u64) -> bool {
    let tail = LockRange::new(offset, LockRange::EOF);
    list.granted
        .iter()
        .any(|l| !l.owner.same(owner) && l.range.overlaps(&tail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LockId;

    fn lock(owner: Owner, kind: PosixKind, start: u64, end: u64) -> ByteRangeLock {
        ByteRangeLock::new(LockId::new(0), owner, kind, LockRange::new(start, end))
    }

    fn ranges(list: &PosixList, owner: &Owner) -> Vec<(PosixKind, u64, u64)> {
        let mut v: Vec<_> = list
            .granted
            .iter()
            .filter(|l| l.owner.same(owner))
            .map(|l| (l.kind, l.range.start, l.range.end))
            .collect();
        v.sort_by_key(|&(_, s, _)| s);
        v
    }

    fn setlk(list: &mut PosixList, ids: &mut IdGen, l: ByteRangeLock) -> Result<Acquire> {
        let mut wake = Wakeups::new();
        let r = set_lock(list, ids, l, false, &mut wake);
        wake.notify();
        r
    }

    #[test]
    fn test_same_kind_overlap_merges() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 0, 99)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 50, 149)).unwrap();
        assert_eq!(ranges(&list, &a), vec![(PosixKind::Write, 0, 149)]);
    }

    #[test]
    fn test_adjacent_same_kind_coalesces() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Read, 0, 49)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Read, 50, 99)).unwrap();
        assert_eq!(ranges(&list, &a), vec![(PosixKind::Read, 0, 99)]);
    }

    #[test]
    fn test_kind_change_splits_in_three() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 0, 199)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Read, 50, 99)).unwrap();
        assert_eq!(
            ranges(&list, &a),
            vec![
                (PosixKind::Write, 0, 49),
                (PosixKind::Read, 50, 99),
                (PosixKind::Write, 100, 199)
            ]
        );
    }

    #[test]
    fn test_unlock_middle_shrinks() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 0, 99)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Unlock, 25, 74)).unwrap();
        assert_eq!(
            ranges(&list, &a),
            vec![(PosixKind::Write, 0, 24), (PosixKind::Write, 75, 99)]
        );
    }

    #[test]
    fn test_unlock_spanning_mixed_kinds() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Read, 0, 49)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 50, 99)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Unlock, 25, 74)).unwrap();
        assert_eq!(
            ranges(&list, &a),
            vec![(PosixKind::Read, 0, 24), (PosixKind::Write, 75, 99)]
        );
    }

    #[test]
    fn test_unlock_everything() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 10, 20)).unwrap();
        setlk(&mut list, &mut ids, lock(a, PosixKind::Unlock, 0, LockRange::EOF)).unwrap();
        assert!(list.granted.is_empty());
    }

    #[test]
    fn test_other_owner_write_conflicts() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        setlk(&mut list, &mut ids, lock(Owner::new(1, 1), PosixKind::Write, 0, 99)).unwrap();
        let err = setlk(&mut list, &mut ids, lock(Owner::new(2, 1), PosixKind::Read, 99, 120))
            .unwrap_err();
        assert_eq!(err, LockError::WouldBlock);
        assert!(setlk(&mut list, &mut ids, lock(Owner::new(2, 1), PosixKind::Read, 100, 120))
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_readers_share() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        setlk(&mut list, &mut ids, lock(Owner::new(1, 1), PosixKind::Read, 0, 99)).unwrap();
        setlk(&mut list, &mut ids, lock(Owner::new(2, 1), PosixKind::Read, 0, 99)).unwrap();
        assert_eq!(list.granted.len(), 2);
    }

    #[test]
    fn test_get_lock_reports_conflict() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        setlk(&mut list, &mut ids, lock(Owner::new(1, 7), PosixKind::Write, 10, 19)).unwrap();

        let fl = get_lock(&list, &Owner::new(2, 1), PosixKind::Read, LockRange::new(0, 99));
        assert_eq!(fl.kind, crate::types::FlockKind::Write);
        assert_eq!((fl.start, fl.len, fl.pid), (10, 10, 7));

        let fl = get_lock(&list, &Owner::new(1, 7), PosixKind::Write, LockRange::new(0, 99));
        assert_eq!(fl.kind, crate::types::FlockKind::Unlock);
        assert_eq!((fl.start, fl.len), (0, 100));
    }

    #[tokio::test]
    async fn test_blocked_request_granted_on_unlock() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        let b = Owner::new(2, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Write, 0, 99)).unwrap();

        let mut wake = Wakeups::new();
        let handle = match set_lock(&mut list, &mut ids, lock(b, PosixKind::Write, 0, 9), true, &mut wake)
            .unwrap()
        {
            Acquire::Blocked(h) => h,
            Acquire::Granted => panic!("should block"),
        };
        wake.notify();
        assert_eq!(list.blocked.len(), 1);

        setlk(&mut list, &mut ids, lock(a, PosixKind::Unlock, 0, 99)).unwrap();
        assert_eq!(handle.wait().await, Ok(()));
        assert!(list.blocked.is_empty());
        assert_eq!(ranges(&list, &b), vec![(PosixKind::Write, 0, 9)]);
    }

    #[test]
    fn test_prelock_unlock_breaks_upgrade_deadlock() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        let a = Owner::new(1, 1);
        let b = Owner::new(2, 1);
        setlk(&mut list, &mut ids, lock(a, PosixKind::Read, 0, 99)).unwrap();
        setlk(&mut list, &mut ids, lock(b, PosixKind::Read, 0, 99)).unwrap();

        let mut wake = Wakeups::new();
        let first = set_lock(&mut list, &mut ids, lock(a, PosixKind::Write, 0, 99), true, &mut wake)
            .unwrap();
        assert!(!first.is_granted());
        assert!(ranges(&list, &a).is_empty());

        // without the pre-lock unlock, a's read would still block b here
        let second = set_lock(&mut list, &mut ids, lock(b, PosixKind::Write, 0, 99), true, &mut wake)
            .unwrap();
        assert!(second.is_granted());
        assert_eq!(ranges(&list, &b), vec![(PosixKind::Write, 0, 99)]);
        assert_eq!(list.blocked.len(), 1);

        set_lock(&mut list, &mut ids, lock(b, PosixKind::Unlock, 0, 99), false, &mut wake).unwrap();
        assert!(list.blocked.is_empty());
        assert_eq!(ranges(&list, &a), vec![(PosixKind::Write, 0, 99)]);
    }

    #[test]
    fn test_flush_drops_owner_locks_only() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        setlk(&mut list, &mut ids, lock(Owner::new(1, 1), PosixKind::Read, 0, 9)).unwrap();
        setlk(&mut list, &mut ids, lock(Owner::new(1, 2), PosixKind::Read, 0, 9)).unwrap();
        let mut wake = Wakeups::new();
        assert_eq!(flush_owner(&mut list, &Owner::new(1, 1), &mut wake), (1, 0));
        assert_eq!(list.granted.len(), 1);
        assert_eq!(
            flush_owner(&mut list, &Owner::connection(crate::types::ClientId::new(1)), &mut wake),
            (1, 0)
        );
        assert!(list.granted.is_empty());
    }

    #[test]
    fn test_truncate_conflict() {
        let (mut list, mut ids) = (PosixList::default(), IdGen::default());
        setlk(&mut list, &mut ids, lock(Owner::new(1, 1), PosixKind::Read, 100, 199)).unwrap();
        assert!(truncate_conflict(&list, &Owner::new(2, 1), 50));
        assert!(!truncate_conflict(&list, &Owner::new(2, 1), 200));
        assert!(!truncate_conflict(&list, &Owner::new(1, 1), 0));
    }

    #[test]
    fn test_subtract() {
        let big = LockRange::new(0, 99);
        assert_eq!(
            subtract(&big, &LockRange::new(10, 19)),
            (Some(LockRange::new(0, 9)), Some(LockRange::new(20, 99)))
        );
        assert_eq!(subtract(&big, &LockRange::new(0, 99)), (None, None));
        assert_eq!(
            subtract(&LockRange::new(0, LockRange::EOF), &LockRange::new(5, LockRange::EOF)),
            (Some(LockRange::new(0, 4)), None)
        );
    }
}
