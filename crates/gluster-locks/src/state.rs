//! Per-inode lock state.
//!
//! One [`LockState`] exists per inode that has seen a lock-touching call.
//! It holds the POSIX list, the named domains (entry and inode locks), the
//! reservation list and the queue of I/O parked by mandatory locking, all
//! guarded by the single mutex in [`InodeLocks`].

use std::collections::{BTreeMap, VecDeque};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::record::{ByteRangeLock, LockId, NamedEntryLock, RangeInodeLock, ReservationLock};
use crate::rw_gate::PendingIo;
use crate::types::{Inode, InodeId};

/// Allocator of per-inode lock handles.
#[derive(Debug, Default)]
pub struct IdGen {
    next: u64,
}

impl IdGen {
    /// Returns a handle never handed out before on this inode.
    pub fn next(&mut self) -> LockId {
        self.next += 1;
        LockId::new(self.next)
    }
}

/// POSIX byte-range locks of an inode.
#[derive(Debug, Default)]
pub struct PosixList {
    /// Granted locks in insertion order.
    pub granted: Vec<ByteRangeLock>,
    /// Waiting requests in arrival order.
    pub blocked: VecDeque<ByteRangeLock>,
}

/// Entry locks of one domain.
#[derive(Debug, Default)]
pub struct EntryList {
    pub granted: Vec<NamedEntryLock>,
    pub blocked: VecDeque<NamedEntryLock>,
}

/// Range inode locks of one domain.
#[derive(Debug, Default)]
pub struct RangeList {
    pub granted: Vec<RangeInodeLock>,
    pub blocked: VecDeque<RangeInodeLock>,
}

/// A named coordination namespace on an inode.
#[derive(Debug)]
pub struct Domain {
    pub name: String,
    pub entry: EntryList,
    pub inode: RangeList,
}

impl Domain {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entry: EntryList::default(),
            inode: RangeList::default(),
        }
    }

    /// True when no lock of either kind, granted or waiting, remains.
    pub fn is_empty(&self) -> bool {
        self.entry.granted.is_empty()
            && self.entry.blocked.is_empty()
            && self.inode.granted.is_empty()
            && self.inode.blocked.is_empty()
    }
}

/// Reservations of an inode, plus the POSIX calls parked behind them.
#[derive(Debug, Default)]
pub struct ReservationList {
    pub granted: Vec<ReservationLock>,
    pub blocked: VecDeque<ReservationLock>,
    /// Blocking setlk calls deferred by another owner's reservation.
    pub deferred: VecDeque<ByteRangeLock>,
}

/// Everything guarded by one inode's mutex.
#[derive(Debug)]
pub struct LockState {
    ino: InodeId,
    mandatory: bool,
    pub ids: IdGen,
    pub posix: PosixList,
    pub domains: BTreeMap<String, Domain>,
    pub reservations: ReservationList,
    pub pending_io: VecDeque<PendingIo>,
    retired: bool,
}

impl LockState {
    /// Fresh state for an inode; the mandatory flag is fixed at creation.
    pub fn new(ino: InodeId, mandatory: bool) -> Self {
        Self {
            ino,
            mandatory,
            ids: IdGen::default(),
            posix: PosixList::default(),
            domains: BTreeMap::new(),
            reservations: ReservationList::default(),
            pending_io: VecDeque::new(),
            retired: false,
        }
    }

    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// Marks the state as torn down; no lock may be added afterwards.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// True if the inode's mode asked for mandatory locking.
    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// Returns the named domain, creating it on first use.
    pub fn domain_mut(&mut self, name: &str) -> &mut Domain {
        let ino = self.ino;
        self.domains.entry(name.to_string()).or_insert_with(|| {
            trace!(ino = %ino, domain = name, "New domain allocated");
            Domain::new(name)
        })
    }

    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.domains.get(name)
    }

    /// Total POSIX locks, granted and waiting.
    pub fn posixlk_count(&self) -> usize {
        self.posix.granted.len() + self.posix.blocked.len()
    }

    /// Inode locks, granted and waiting, in one domain or in all of them.
    pub fn inodelk_count(&self, domain: Option<&str>) -> usize {
        let count = |d: &Domain| d.inode.granted.len() + d.inode.blocked.len();
        match domain {
            Some(name) => self.domains.get(name).map(count).unwrap_or(0),
            None => self.domains.values().map(count).sum(),
        }
    }

    /// Entry locks, granted and waiting, across all domains.
    pub fn entrylk_count(&self) -> usize {
        self.domains
            .values()
            .map(|d| d.entry.granted.len() + d.entry.blocked.len())
            .sum()
    }

    /// True when no list holds anything.
    pub fn is_empty(&self) -> bool {
        self.posix.granted.is_empty()
            && self.posix.blocked.is_empty()
            && self.domains.values().all(Domain::is_empty)
            && self.reservations.granted.is_empty()
            && self.reservations.blocked.is_empty()
            && self.reservations.deferred.is_empty()
            && self.pending_io.is_empty()
    }
}

/// Lock state of one inode behind its mutex.
#[derive(Debug)]
pub struct InodeLocks {
    ino: InodeId,
    state: Mutex<LockState>,
}

impl InodeLocks {
    /// Creates the state for `inode`, deriving the mandatory flag from its mode.
    pub fn new(inode: &Inode) -> Self {
        trace!(ino = %inode.id, "Allocating new lock inode");
        Self {
            ino: inode.id,
            state: Mutex::new(LockState::new(inode.id, inode.wants_mandatory())),
        }
    }

    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// Takes the inode mutex.
    pub fn lock(&self) -> MutexGuard<'_, LockState> {
        self.state.lock()
    }
}
