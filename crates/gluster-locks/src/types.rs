//! Identities, byte ranges and the flock view shared by every lock engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LockError, Result};

/// Identifier of an inode in the translator's inode table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client connection to this brick.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a new ClientId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }

    /// Returns the raw u64 value of this client ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who holds or requests a lock: a connection plus the process on it.
///
/// A pid of zero is the protocol layer's "whole connection" sentinel and
/// is only meaningful as a release selector, see [`Owner::covers`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    /// Connection the request arrived on.
    pub client: ClientId,
    /// Process (lock owner) on that connection.
    pub pid: u64,
}

impl Owner {
    /// Creates an owner from raw connection and process identifiers.
    pub fn new(client: u64, pid: u64) -> Self {
        Self {
            client: ClientId::new(client),
            pid,
        }
    }

    /// Selector matching every lock of a connection.
    pub fn connection(client: ClientId) -> Self {
        Self { client, pid: 0 }
    }

    /// True if this is the "every lock of the connection" sentinel.
    pub fn is_connection_wide(&self) -> bool {
        self.pid == 0
    }

    /// True if both owners are the same (connection, process) pair.
    pub fn same(&self, other: &Owner) -> bool {
        self.client == other.client && self.pid == other.pid
    }

    /// True if a release issued by `self` applies to a lock held by `holder`.
    pub fn covers(&self, holder: &Owner) -> bool {
        if self.is_connection_wide() {
            self.client == holder.client
        } else {
            self.same(holder)
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client={} pid={}", self.client, self.pid)
    }
}

/// Closed byte interval `[start, end]`; `end == u64::MAX` means "to EOF".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRange {
    /// First byte covered.
    pub start: u64,
    /// Last byte covered (inclusive).
    pub end: u64,
}

impl LockRange {
    /// Sentinel end offset for ranges that run to end of file.
    pub const EOF: u64 = u64::MAX;

    /// Builds a range, `start <= end` is required.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted lock range {}-{}", start, end);
        Self { start, end }
    }

    /// The whole file.
    pub fn whole() -> Self {
        Self::new(0, Self::EOF)
    }

    /// Builds a range from an fcntl style `(start, len)`; `len == 0` means to EOF.
    pub fn from_start_len(start: u64, len: u64) -> Self {
        if len == 0 {
            return Self::new(start, Self::EOF);
        }
        Self::new(start, start.saturating_add(len - 1))
    }

    /// Validates and converts signed fcntl fields.
    pub fn from_flock(start: i64, len: i64) -> Result<Self> {
        if start < 0 || len < 0 {
            return Err(LockError::invalid(format!(
                "negative lock range start={} len={}",
                start, len
            )));
        }
        Ok(Self::from_start_len(start as u64, len as u64))
    }

    /// Length as reported back to callers, zero meaning "to EOF".
    pub fn len(&self) -> u64 {
        if self.end == Self::EOF {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// True when the range runs to end of file.
    pub fn is_to_eof(&self) -> bool {
        self.end == Self::EOF
    }

    /// Two closed ranges overlap iff `max(starts) <= min(ends)`.
    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start.max(other.start) <= self.end.min(other.end)
    }

    /// True if the ranges overlap or sit back to back with no gap.
    pub fn touches(&self, other: &LockRange) -> bool {
        if self.overlaps(other) {
            return true;
        }
        (self.end != Self::EOF && self.end + 1 == other.start)
            || (other.end != Self::EOF && other.end + 1 == self.start)
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &LockRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &LockRange) -> LockRange {
        LockRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl fmt::Display for LockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_to_eof() {
            write!(f, "{}-EOF", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Lock type carried in an flock request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlockKind {
    /// Shared (F_RDLCK).
    Read,
    /// Exclusive (F_WRLCK).
    Write,
    /// Release (F_UNLCK).
    Unlock,
}

impl fmt::Display for FlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlockKind::Read => "READ",
            FlockKind::Write => "WRITE",
            FlockKind::Unlock => "UNLOCK",
        };
        f.write_str(s)
    }
}

/// The caller-facing `struct flock` of a lock request or reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flock {
    /// Requested or reported lock type.
    pub kind: FlockKind,
    /// Start offset, must not be negative.
    pub start: i64,
    /// Length, zero meaning "to EOF"; must not be negative.
    pub len: i64,
    /// Holder pid, filled in on GETLK replies.
    pub pid: u64,
}

impl Flock {
    /// Builds an flock with a zero pid.
    pub fn new(kind: FlockKind, start: i64, len: i64) -> Self {
        Self {
            kind,
            start,
            len,
            pid: 0,
        }
    }

    /// Validated internal range of this request.
    pub fn range(&self) -> Result<LockRange> {
        LockRange::from_flock(self.start, self.len)
    }

    /// Builds the reply flock describing `range`.
    pub fn from_range(kind: FlockKind, range: LockRange, pid: u64) -> Self {
        Self {
            kind,
            start: i64::try_from(range.start).unwrap_or(i64::MAX),
            len: i64::try_from(range.len()).unwrap_or(i64::MAX),
            pid,
        }
    }
}

/// Command of an `lk` or `inodelk` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LkCmd {
    /// Report the first conflicting lock.
    GetLk,
    /// Acquire or release without waiting.
    SetLk,
    /// Acquire, waiting until granted.
    SetLkW,
    /// Take a reservation without waiting.
    ReserveLk,
    /// Take a reservation, waiting until granted.
    ReserveLkW,
    /// Drop a reservation.
    ReserveUnlk,
}

impl LkCmd {
    /// True for the commands that may park the caller.
    pub fn can_block(&self) -> bool {
        matches!(self, LkCmd::SetLkW | LkCmd::ReserveLkW)
    }
}

impl fmt::Display for LkCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LkCmd::GetLk => "GETLK",
            LkCmd::SetLk => "SETLK",
            LkCmd::SetLkW => "SETLKW",
            LkCmd::ReserveLk => "RESLK_LCK",
            LkCmd::ReserveLkW => "RESLK_LCKW",
            LkCmd::ReserveUnlk => "RESLK_UNLCK",
        };
        f.write_str(s)
    }
}

/// Command of an `entrylk` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryLkCmd {
    /// Lock, waiting until granted.
    Lock,
    /// Lock without waiting.
    LockNb,
    /// Release.
    Unlock,
}

impl fmt::Display for EntryLkCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryLkCmd::Lock => "LOCK",
            EntryLkCmd::LockNb => "LOCK_NB",
            EntryLkCmd::Unlock => "UNLOCK",
        };
        f.write_str(s)
    }
}

/// Entry lock type as sent on the wire; only write (exclusive) is served.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryLkKind {
    /// ENTRYLK_RDLCK, rejected.
    Read,
    /// ENTRYLK_WRLCK.
    Write,
}

/// The inode handed to the translator with each call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Inode identity.
    pub id: InodeId,
    /// File mode bits, used to derive the mandatory-locking flag.
    pub mode: u32,
}

impl Inode {
    /// Creates an inode handle.
    pub fn new(id: u64, mode: u32) -> Self {
        Self {
            id: InodeId::new(id),
            mode,
        }
    }

    /// Set-group-ID without group execute marks a file for mandatory locking.
    pub fn wants_mandatory(&self) -> bool {
        self.mode & libc::S_ISGID as u32 != 0 && self.mode & libc::S_IXGRP as u32 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_closed_intervals() {
        let a = LockRange::new(0, 99);
        assert!(a.overlaps(&LockRange::new(99, 150)));
        assert!(a.overlaps(&LockRange::new(50, 60)));
        assert!(!a.overlaps(&LockRange::new(100, 150)));
        assert!(LockRange::new(100, 150).overlaps(&LockRange::whole()));
    }

    #[test]
    fn test_touches_adjacent() {
        let a = LockRange::new(0, 49);
        assert!(a.touches(&LockRange::new(50, 99)));
        assert!(LockRange::new(50, 99).touches(&a));
        assert!(!a.touches(&LockRange::new(51, 99)));
        assert!(!LockRange::new(10, LockRange::EOF).touches(&LockRange::new(0, 8)));
    }

    #[test]
    fn test_zero_len_is_eof() {
        let r = LockRange::from_start_len(10, 0);
        assert!(r.is_to_eof());
        assert_eq!(r.len(), 0);
        assert_eq!(LockRange::from_start_len(10, 5), LockRange::new(10, 14));
        assert_eq!(LockRange::from_start_len(10, 5).len(), 5);
    }

    #[test]
    fn test_negative_flock_rejected() {
        assert!(matches!(
            LockRange::from_flock(-1, 10),
            Err(LockError::InvalidArgument { .. })
        ));
        assert!(matches!(
            LockRange::from_flock(0, -10),
            Err(LockError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_flock_round_trip_to_eof() {
        let r = LockRange::from_flock(7, 0).unwrap();
        let f = Flock::from_range(FlockKind::Write, r, 3);
        assert_eq!(f.start, 7);
        assert_eq!(f.len, 0);
        assert_eq!(f.pid, 3);
    }

    #[test]
    fn test_connection_wide_owner_covers_all_pids() {
        let sweep = Owner::connection(ClientId::new(4));
        assert!(sweep.covers(&Owner::new(4, 17)));
        assert!(!sweep.covers(&Owner::new(5, 17)));
        assert!(Owner::new(4, 17).covers(&Owner::new(4, 17)));
        assert!(!Owner::new(4, 17).covers(&Owner::new(4, 18)));
    }

    #[test]
    fn test_mandatory_mode_bits() {
        assert!(Inode::new(1, 0o2644).wants_mandatory());
        assert!(!Inode::new(1, 0o2754).wants_mandatory());
        assert!(!Inode::new(1, 0o644).wants_mandatory());
    }

    #[test]
    fn test_union_and_contains() {
        let u = LockRange::new(0, 99).union(&LockRange::new(50, 149));
        assert_eq!(u, LockRange::new(0, 149));
        assert!(u.contains(&LockRange::new(10, 20)));
        assert!(!u.contains(&LockRange::new(100, 200)));
    }
}
