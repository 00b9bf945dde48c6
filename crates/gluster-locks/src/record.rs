//! Lock records kept on the per-inode lists.
//!
//! Four record kinds share the same shape: an owner, what is locked, whether
//! the record is still waiting, and the deferred reply of the caller that
//! is waiting on it. Records are owned by exactly one list at a time.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};
use crate::types::{FlockKind, LockRange, Owner};
use crate::waiter::Waiter;

/// Stable handle of a record within one inode's lock state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(u64);

impl LockId {
    /// Creates a LockId from a raw u64 value
    pub fn new(id: u64) -> Self {
        LockId(id)
    }

    /// Returns the raw u64 value of this lock ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a POSIX byte-range lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PosixKind {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
    /// Removal request; never stored as granted.
    Unlock,
}

impl PosixKind {
    /// True if two granted locks of these kinds may not overlap.
    pub fn conflicts_with(self, other: PosixKind) -> bool {
        self != PosixKind::Unlock
            && other != PosixKind::Unlock
            && (self == PosixKind::Write || other == PosixKind::Write)
    }
}

impl From<FlockKind> for PosixKind {
    fn from(kind: FlockKind) -> Self {
        match kind {
            FlockKind::Read => PosixKind::Read,
            FlockKind::Write => PosixKind::Write,
            FlockKind::Unlock => PosixKind::Unlock,
        }
    }
}

impl From<PosixKind> for FlockKind {
    fn from(kind: PosixKind) -> Self {
        match kind {
            PosixKind::Read => FlockKind::Read,
            PosixKind::Write => FlockKind::Write,
            PosixKind::Unlock => FlockKind::Unlock,
        }
    }
}

/// Type of a range inode lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeLockKind {
    /// Shared.
    Shared,
    /// Exclusive.
    Exclusive,
}

impl InodeLockKind {
    /// Only two shared locks are compatible.
    pub fn conflicts_with(self, other: InodeLockKind) -> bool {
        self == InodeLockKind::Exclusive || other == InodeLockKind::Exclusive
    }

    /// Maps a lock-type request; unlock is handled before this point.
    pub fn from_flock(kind: FlockKind) -> Result<Self> {
        match kind {
            FlockKind::Read => Ok(InodeLockKind::Shared),
            FlockKind::Write => Ok(InodeLockKind::Exclusive),
            FlockKind::Unlock => Err(LockError::invalid("unlock is not a lock type")),
        }
    }
}

/// Access common to every record kind, used by the grant cascade.
pub trait LockRecord {
    /// Stable handle of the record.
    fn id(&self) -> LockId;
    /// Holder or requester.
    fn owner(&self) -> &Owner;
    /// Marks the record as waiting or granted.
    fn set_blocked(&mut self, blocked: bool);
    /// Detaches the deferred reply, if the requester is parked.
    fn take_waiter(&mut self) -> Option<Waiter>;
    /// True if the parked requester stopped waiting for the reply.
    fn is_abandoned(&self) -> bool;
}

macro_rules! impl_lock_record {
    ($t:ty) => {
        impl LockRecord for $t {
            fn id(&self) -> LockId {
                self.id
            }

            fn owner(&self) -> &Owner {
                &self.owner
            }

            fn set_blocked(&mut self, blocked: bool) {
                self.blocked = blocked;
                if blocked {
                    self.blocked_at = Some(SystemTime::now());
                } else {
                    self.granted_at = Some(SystemTime::now());
                }
            }

            fn take_waiter(&mut self) -> Option<Waiter> {
                self.waiter.take()
            }

            fn is_abandoned(&self) -> bool {
                self.waiter.as_ref().map_or(false, Waiter::is_abandoned)
            }
        }
    };
}

/// A POSIX (fcntl) byte-range lock.
#[derive(Debug)]
pub struct ByteRangeLock {
    pub id: LockId,
    pub owner: Owner,
    pub kind: PosixKind,
    pub range: LockRange,
    pub blocked: bool,
    pub waiter: Option<Waiter>,
    pub blocked_at: Option<SystemTime>,
    pub granted_at: Option<SystemTime>,
}

impl ByteRangeLock {
    pub fn new(id: LockId, owner: Owner, kind: PosixKind, range: LockRange) -> Self {
        Self {
            id,
            owner,
            kind,
            range,
            blocked: false,
            waiter: None,
            blocked_at: None,
            granted_at: None,
        }
    }

    /// Copy of this record's identity with a different kind and range.
    ///
    /// Used for merge and split fragments; the waiter is not carried.
    pub fn fragment(&self, id: LockId, kind: PosixKind, range: LockRange) -> Self {
        let mut frag = Self::new(id, self.owner, kind, range);
        frag.granted_at = self.granted_at;
        frag
    }

    /// True if granted `self` would forbid granting `other`.
    pub fn conflicts_with(&self, other: &ByteRangeLock) -> bool {
        self.range.overlaps(&other.range)
            && !self.owner.same(&other.owner)
            && self.kind.conflicts_with(other.kind)
    }
}

impl_lock_record!(ByteRangeLock);

/// A named-entry lock on a directory; `basename == None` locks every name.
#[derive(Debug)]
pub struct NamedEntryLock {
    pub id: LockId,
    pub owner: Owner,
    pub basename: Option<String>,
    pub blocked: bool,
    pub waiter: Option<Waiter>,
    pub blocked_at: Option<SystemTime>,
    pub granted_at: Option<SystemTime>,
}

impl NamedEntryLock {
    pub fn new(id: LockId, owner: Owner, basename: Option<String>) -> Self {
        Self {
            id,
            owner,
            basename,
            blocked: false,
            waiter: None,
            blocked_at: None,
            granted_at: None,
        }
    }

    /// True if this lock covers every name of the directory.
    pub fn is_all_names(&self) -> bool {
        self.basename.is_none()
    }
}

impl_lock_record!(NamedEntryLock);

/// Two entry names conflict if either is the wildcard or they are equal.
pub fn names_conflict(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// A range lock within a domain; never merged or split.
#[derive(Debug)]
pub struct RangeInodeLock {
    pub id: LockId,
    pub owner: Owner,
    pub kind: InodeLockKind,
    pub range: LockRange,
    pub blocked: bool,
    pub waiter: Option<Waiter>,
    pub blocked_at: Option<SystemTime>,
    pub granted_at: Option<SystemTime>,
}

impl RangeInodeLock {
    pub fn new(id: LockId, owner: Owner, kind: InodeLockKind, range: LockRange) -> Self {
        Self {
            id,
            owner,
            kind,
            range,
            blocked: false,
            waiter: None,
            blocked_at: None,
            granted_at: None,
        }
    }

    /// Overlapping ranges where at least one side is exclusive.
    pub fn conflicts_with(&self, other: &RangeInodeLock) -> bool {
        self.range.overlaps(&other.range) && self.kind.conflicts_with(other.kind)
    }
}

impl_lock_record!(RangeInodeLock);

/// A reservation marker on an exact byte range.
#[derive(Debug)]
pub struct ReservationLock {
    pub id: LockId,
    pub owner: Owner,
    pub range: LockRange,
    pub blocked: bool,
    pub waiter: Option<Waiter>,
    pub blocked_at: Option<SystemTime>,
    pub granted_at: Option<SystemTime>,
}

impl ReservationLock {
    pub fn new(id: LockId, owner: Owner, range: LockRange) -> Self {
        Self {
            id,
            owner,
            range,
            blocked: false,
            waiter: None,
            blocked_at: None,
            granted_at: None,
        }
    }
}

impl_lock_record!(ReservationLock);

#[cfg(test)]
mod tests {
    use super::*;

    fn posix(owner: Owner, kind: PosixKind, start: u64, end: u64) -> ByteRangeLock {
        ByteRangeLock::new(LockId::new(1), owner, kind, LockRange::new(start, end))
    }

    #[test]
    fn test_read_read_never_conflicts() {
        let a = posix(Owner::new(1, 1), PosixKind::Read, 0, 99);
        let b = posix(Owner::new(2, 1), PosixKind::Read, 0, 99);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_write_conflicts_with_other_owner() {
        let a = posix(Owner::new(1, 1), PosixKind::Write, 0, 99);
        let b = posix(Owner::new(2, 1), PosixKind::Read, 50, 60);
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        let a = posix(Owner::new(1, 1), PosixKind::Write, 0, 99);
        let b = posix(Owner::new(1, 1), PosixKind::Write, 0, 99);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn test_unlock_kind_never_conflicts() {
        assert!(!PosixKind::Unlock.conflicts_with(PosixKind::Write));
        assert!(!PosixKind::Write.conflicts_with(PosixKind::Unlock));
    }

    #[test]
    fn test_names_conflict() {
        assert!(names_conflict(None, Some("x")));
        assert!(names_conflict(Some("x"), None));
        assert!(names_conflict(None, None));
        assert!(names_conflict(Some("x"), Some("x")));
        assert!(!names_conflict(Some("x"), Some("y")));
    }

    #[test]
    fn test_inode_lock_kind_conflicts() {
        assert!(!InodeLockKind::Shared.conflicts_with(InodeLockKind::Shared));
        assert!(InodeLockKind::Shared.conflicts_with(InodeLockKind::Exclusive));
        assert!(InodeLockKind::Exclusive.conflicts_with(InodeLockKind::Exclusive));
        assert!(InodeLockKind::from_flock(FlockKind::Unlock).is_err());
    }

    #[test]
    fn test_set_blocked_stamps_time() {
        let mut l = posix(Owner::new(1, 1), PosixKind::Read, 0, 9);
        l.set_blocked(true);
        assert!(l.blocked);
        assert!(l.blocked_at.is_some());
        l.set_blocked(false);
        assert!(!l.blocked);
        assert!(l.granted_at.is_some());
    }
}
