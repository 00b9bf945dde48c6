//! Statedump snapshots of an inode's lock lists.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::record::{
    ByteRangeLock, InodeLockKind, LockId, NamedEntryLock, PosixKind, RangeInodeLock, ReservationLock,
};
use crate::state::{Domain, LockState};
use crate::types::{InodeId, Owner};

/// Whether a dumped record holds its lock or waits for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordState {
    /// Granted.
    Active,
    /// Waiting.
    Blocked,
}

impl RecordState {
    fn of(blocked: bool) -> Self {
        if blocked {
            RecordState::Blocked
        } else {
            RecordState::Active
        }
    }
}

fn epoch_secs(t: Option<SystemTime>) -> Option<u64> {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

/// One POSIX lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixDump {
    pub id: LockId,
    pub owner: Owner,
    pub kind: PosixKind,
    pub start: u64,
    /// Zero means to end of file.
    pub len: u64,
    pub state: RecordState,
    pub blocked_at: Option<u64>,
    pub granted_at: Option<u64>,
}

impl From<&ByteRangeLock> for PosixDump {
    fn from(l: &ByteRangeLock) -> Self {
        Self {
            id: l.id,
            owner: l.owner,
            kind: l.kind,
            start: l.range.start,
            len: l.range.len(),
            state: RecordState::of(l.blocked),
            blocked_at: epoch_secs(l.blocked_at),
            granted_at: epoch_secs(l.granted_at),
        }
    }
}

/// One range inode lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodelkDump {
    pub id: LockId,
    pub owner: Owner,
    pub kind: InodeLockKind,
    pub start: u64,
    pub len: u64,
    pub state: RecordState,
    pub blocked_at: Option<u64>,
    pub granted_at: Option<u64>,
}

impl From<&RangeInodeLock> for InodelkDump {
    fn from(l: &RangeInodeLock) -> Self {
        Self {
            id: l.id,
            owner: l.owner,
            kind: l.kind,
            start: l.range.start,
            len: l.range.len(),
            state: RecordState::of(l.blocked),
            blocked_at: epoch_secs(l.blocked_at),
            granted_at: epoch_secs(l.granted_at),
        }
    }
}

/// One entry lock; no basename means the whole directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrylkDump {
    pub id: LockId,
    pub owner: Owner,
    pub basename: Option<String>,
    pub state: RecordState,
    pub blocked_at: Option<u64>,
    pub granted_at: Option<u64>,
}

impl From<&NamedEntryLock> for EntrylkDump {
    fn from(l: &NamedEntryLock) -> Self {
        Self {
            id: l.id,
            owner: l.owner,
            basename: l.basename.clone(),
            state: RecordState::of(l.blocked),
            blocked_at: epoch_secs(l.blocked_at),
            granted_at: epoch_secs(l.granted_at),
        }
    }
}

/// One reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDump {
    pub id: LockId,
    pub owner: Owner,
    pub start: u64,
    pub len: u64,
    pub state: RecordState,
}

impl From<&ReservationLock> for ReservationDump {
    fn from(l: &ReservationLock) -> Self {
        Self {
            id: l.id,
            owner: l.owner,
            start: l.range.start,
            len: l.range.len(),
            state: RecordState::of(l.blocked),
        }
    }
}

/// Locks of one domain, granted first then waiting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDump {
    pub name: String,
    pub inodelk: Vec<InodelkDump>,
    pub entrylk: Vec<EntrylkDump>,
}

impl From<&Domain> for DomainDump {
    fn from(d: &Domain) -> Self {
        Self {
            name: d.name.clone(),
            inodelk: d
                .inode
                .granted
                .iter()
                .chain(d.inode.blocked.iter())
                .map(InodelkDump::from)
                .collect(),
            entrylk: d
                .entry
                .granted
                .iter()
                .chain(d.entry.blocked.iter())
                .map(EntrylkDump::from)
                .collect(),
        }
    }
}

/// Everything held on one inode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeDump {
    pub ino: InodeId,
    pub mandatory: bool,
    pub posix: Vec<PosixDump>,
    pub domains: Vec<DomainDump>,
    pub reservations: Vec<ReservationDump>,
    /// POSIX calls parked behind a reservation.
    pub deferred_calls: usize,
    /// Reads and writes held by mandatory locks.
    pub pending_io: usize,
}

impl InodeDump {
    /// Snapshots the state; the caller holds the inode mutex.
    pub fn capture(state: &LockState) -> Self {
        Self {
            ino: state.ino(),
            mandatory: state.is_mandatory(),
            posix: state
                .posix
                .granted
                .iter()
                .chain(state.posix.blocked.iter())
                .map(PosixDump::from)
                .collect(),
            domains: state.domains.values().map(DomainDump::from).collect(),
            reservations: state
                .reservations
                .granted
                .iter()
                .chain(state.reservations.blocked.iter())
                .map(ReservationDump::from)
                .collect(),
            deferred_calls: state.reservations.deferred.len(),
            pending_io: state.pending_io.len(),
        }
    }

    /// Renders the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
