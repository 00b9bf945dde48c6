//! The locks translator facade.
//!
//! [`LockManager`] owns the inode table and routes each file operation to the
//! engine that serves it. Every call has the same shape: take the inode
//! mutex, run the engine and the cascades the change calls for, drop the
//! mutex, deliver the queued replies, then wait if the request was parked.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::clear::{self, ClearCount, ClearSelector};
use crate::config::LocksConfig;
use crate::dump::InodeDump;
use crate::entry;
use crate::error::{LockError, Result};
use crate::grant::{cancel_all, grant_blocked, Acquire};
use crate::inodelk::{self, effective_domain};
use crate::posix::{self, grant_blocked_posix};
use crate::record::{ByteRangeLock, InodeLockKind, NamedEntryLock, PosixKind, RangeInodeLock, ReservationLock};
use crate::reserve::{self, Admission};
use crate::rw_gate::{self, IoKind};
use crate::state::{InodeLocks, LockState};
use crate::types::{ClientId, EntryLkCmd, EntryLkKind, Flock, FlockKind, Inode, InodeId, LkCmd, Owner};
use crate::waiter::{WaitHandle, Wakeups};

/// Lock-related file operations, as called by the translator stack above.
///
/// Blocking requests resolve once granted; the inode is never locked while
/// a caller waits.
#[async_trait]
pub trait LockFops: Send + Sync {
    /// fcntl locks: GETLK, SETLK, SETLKW and the reservation commands.
    ///
    /// Returns the conflicting lock for GETLK, the request itself for
    /// SETLK and SETLKW, and the GETLK view of the range for a reservation.
    async fn lk(&self, inode: &Inode, owner: Owner, cmd: LkCmd, flock: Flock) -> Result<Flock>;

    /// Range locks in a named domain. GETLK is not supported.
    async fn inodelk(&self, inode: &Inode, domain: &str, owner: Owner, cmd: LkCmd, flock: Flock) -> Result<()>;

    /// Name locks on a directory; `None` locks every name.
    async fn entrylk(
        &self,
        parent: &Inode,
        domain: &str,
        owner: Owner,
        basename: Option<&str>,
        cmd: EntryLkCmd,
        kind: EntryLkKind,
    ) -> Result<()>;

    /// Admits a read of `len` bytes at `offset`, waiting out mandatory locks.
    async fn readv(&self, inode: &Inode, owner: Owner, offset: u64, len: u64, nonblocking: bool) -> Result<()>;

    /// Admits a write of `len` bytes at `offset`, waiting out mandatory locks.
    async fn writev(&self, inode: &Inode, owner: Owner, offset: u64, len: u64, nonblocking: bool) -> Result<()>;

    /// Refuses a truncate that would cut into another owner's mandatory lock.
    async fn truncate(&self, inode: &Inode, owner: Owner, offset: u64) -> Result<()>;

    /// Drops the owner's POSIX locks on the inode.
    async fn flush(&self, inode: &Inode, owner: Owner) -> Result<()>;

    /// Connection or owner teardown; removes every lock the owner covers.
    async fn release(&self, owner: Owner);

    /// Administrative clear driven by a `glusterfs.clrlk` selector.
    async fn clear_locks(&self, inode: &Inode, selector: &str) -> Result<ClearCount>;

    /// The inode left the inode table; its lock state is destroyed.
    fn forget(&self, ino: InodeId);
}

/// Per-brick lock manager holding the state of every locked inode.
#[derive(Debug, Default)]
pub struct LockManager {
    config: LocksConfig,
    inodes: DashMap<InodeId, Arc<InodeLocks>>,
}

impl LockManager {
    pub fn new(config: LocksConfig) -> Self {
        Self {
            config,
            inodes: DashMap::new(),
        }
    }

    /// Builds a manager from the translator option map.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        Ok(Self::new(LocksConfig::from_options(options)?))
    }

    pub fn config(&self) -> &LocksConfig {
        &self.config
    }

    /// Number of inodes with lock state.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    fn inode_locks(&self, inode: &Inode) -> Arc<InodeLocks> {
        self.inodes
            .entry(inode.id)
            .or_insert_with(|| Arc::new(InodeLocks::new(inode)))
            .value()
            .clone()
    }

    fn lookup(&self, ino: InodeId) -> Option<Arc<InodeLocks>> {
        self.inodes.get(&ino).map(|e| Arc::clone(e.value()))
    }

    /// Runs `f` under the inode mutex and delivers its replies after unlocking.
    fn with_state<R>(&self, locks: &InodeLocks, f: impl FnOnce(&mut LockState, &mut Wakeups) -> R) -> R {
        let mut wake = Wakeups::new();
        let out = {
            let mut guard = locks.lock();
            f(&mut guard, &mut wake)
        };
        wake.notify();
        out
    }

    /// Like `with_state`, on the state that is current for `inode`.
    ///
    /// A state retired by `forget` after it was looked up is dropped from the
    /// table and a fresh one resolved, so nothing lands in a dead state.
    fn with_live_state<R>(&self, inode: &Inode, f: impl FnOnce(&mut LockState, &mut Wakeups) -> R) -> R {
        loop {
            let locks = self.inode_locks(inode);
            let mut guard = locks.lock();
            if !guard.is_retired() {
                let mut wake = Wakeups::new();
                let out = f(&mut guard, &mut wake);
                drop(guard);
                wake.notify();
                return out;
            }
            drop(guard);
            trace!(ino = %inode.id, "Lock state retired, resolving again");
            self.inodes.remove_if(&inode.id, |_, v| Arc::ptr_eq(v, &locks));
        }
    }

    fn gate_active(&self, st: &LockState) -> bool {
        self.config.mandatory_locks && st.is_mandatory()
    }

    fn describe(&self, f: impl FnOnce() -> String) -> Option<String> {
        self.config.trace.then(f)
    }

    fn trace_request(&self, fop: &str, ino: InodeId, owner: &Owner, desc: &Option<String>) {
        if let Some(lock) = desc {
            info!("[REQUEST] {} Locker = {{{}}} Lockee = {{ino={}}} Lock = {{{}}}", fop, owner, ino, lock);
        }
    }

    fn trace_blocked(&self, fop: &str, ino: InodeId, owner: &Owner, desc: &Option<String>) {
        if let Some(lock) = desc {
            info!("[BLOCKED] {} Locker = {{{}}} Lockee = {{ino={}}} Lock = {{{}}}", fop, owner, ino, lock);
        }
    }

    fn trace_verdict(&self, fop: &str, ino: InodeId, owner: &Owner, desc: &Option<String>, err: Option<&LockError>) {
        if let Some(lock) = desc {
            let verdict = match err {
                None => "GRANTED".to_string(),
                Some(err) => err.to_string(),
            };
            info!("[{}] {} Locker = {{{}}} Lockee = {{ino={}}} Lock = {{{}}}", verdict, fop, owner, ino, lock);
        }
    }

    /// Waits for a parked request, tracing the wait and its outcome.
    async fn await_grant(
        &self,
        fop: &str,
        ino: InodeId,
        owner: &Owner,
        desc: &Option<String>,
        handle: WaitHandle,
    ) -> Result<()> {
        self.trace_blocked(fop, ino, owner, desc);
        let outcome = handle.wait().await;
        self.trace_verdict(fop, ino, owner, desc, outcome.as_ref().err());
        outcome
    }

    async fn gate_io(
        &self,
        inode: &Inode,
        owner: Owner,
        kind: IoKind,
        offset: u64,
        len: u64,
        nonblocking: bool,
    ) -> Result<()> {
        if !self.config.mandatory_locks {
            return Ok(());
        }
        let Some(range) = rw_gate::io_range(offset, len) else {
            return Ok(());
        };
        let pending = self.with_live_state(inode, |st: &mut LockState, _: &mut Wakeups| {
            if !self.gate_active(st) {
                return Ok(None);
            }
            rw_gate::check_io(&st.posix, &mut st.pending_io, &owner, kind, range, nonblocking)
        })?;
        if let Some(handle) = pending {
            debug!(ino = %inode.id, owner = %owner, kind = ?kind, range = %range, "I/O waiting on mandatory lock");
            handle.wait().await?;
        }
        Ok(())
    }

    /// Removes every lock `owner` covers on every inode.
    ///
    /// Returns the number of granted and waiting records removed.
    pub fn release_all(&self, owner: Owner) -> usize {
        let inodes: Vec<Arc<InodeLocks>> = self.inodes.iter().map(|e| Arc::clone(e.value())).collect();
        let mut total = 0;
        for locks in inodes {
            total += self.with_state(&locks, |st: &mut LockState, wake: &mut Wakeups| {
                sweep_owner(st, &owner, wake)
            });
        }
        if total > 0 {
            debug!(owner = %owner, released = total, "Released locks of departing owner");
        }
        total
    }

    /// Removes every lock held or requested over a client connection.
    pub fn release_client(&self, client: ClientId) -> usize {
        self.release_all(Owner::connection(client))
    }

    /// POSIX locks on the inode, granted and waiting.
    pub fn posixlk_count(&self, ino: InodeId) -> usize {
        self.lookup(ino).map_or(0, |l| l.lock().posixlk_count())
    }

    /// Inode locks on the inode, in one domain or all of them.
    pub fn inodelk_count(&self, ino: InodeId, domain: Option<&str>) -> usize {
        self.lookup(ino).map_or(0, |l| l.lock().inodelk_count(domain))
    }

    /// Entry locks on the directory across all domains.
    pub fn entrylk_count(&self, ino: InodeId) -> usize {
        self.lookup(ino).map_or(0, |l| l.lock().entrylk_count())
    }

    /// True if any domain of `parent` holds a lock on exactly `basename`.
    pub fn entry_has_name_lock(&self, parent: InodeId, basename: &str) -> bool {
        self.lookup(parent).map_or(false, |l| {
            l.lock()
                .domains
                .values()
                .any(|d| entry::has_name_lock(&d.entry, basename))
        })
    }

    /// Statedump of one inode.
    pub fn dump(&self, ino: InodeId) -> Option<InodeDump> {
        self.lookup(ino).map(|l| InodeDump::capture(&l.lock()))
    }

    /// Statedump of every inode with lock state, by inode number.
    pub fn dump_all(&self) -> Vec<InodeDump> {
        let inodes: Vec<Arc<InodeLocks>> = self.inodes.iter().map(|e| Arc::clone(e.value())).collect();
        let mut dumps: Vec<InodeDump> = inodes.iter().map(|l| InodeDump::capture(&l.lock())).collect();
        dumps.sort_by_key(|d| d.ino);
        dumps
    }
}

fn sweep_owner(st: &mut LockState, owner: &Owner, wake: &mut Wakeups) -> usize {
    let (granted, blocked) = posix::flush_owner(&mut st.posix, owner, wake);
    let mut removed = granted + blocked;
    if !owner.is_connection_wide() {
        removed += posix::cancel_blocked(&mut st.posix, owner, wake);
    }

    for dom in st.domains.values_mut() {
        let (g, b) = entry::release_owner(&mut dom.entry, owner, wake);
        removed += g + b;
        let (g, b) = inodelk::release_owner(&mut dom.inode, owner, wake);
        removed += g + b;
        grant_blocked(&mut dom.entry, wake);
        grant_blocked(&mut dom.inode, wake);
    }

    let (g, b) = reserve::release_owner(&mut st.reservations, owner, wake);
    removed += g + b;
    reserve::replay_deferred(&mut st.reservations, &mut st.posix, &mut st.ids, wake);

    removed += rw_gate::cancel_owner(&mut st.pending_io, owner, wake);
    grant_blocked_posix(&mut st.posix, &mut st.ids, wake);
    rw_gate::replay_pending_io(&st.posix, &mut st.pending_io, wake);
    removed
}

fn teardown(st: &mut LockState, wake: &mut Wakeups) -> usize {
    let ino = st.ino();
    st.retire();
    for l in &st.posix.granted {
        warn!(ino = %ino, owner = %l.owner, range = %l.range, "Pending fcntl locks found, releasing");
    }
    let mut cancelled = cancel_all(&mut st.posix.blocked, wake);
    st.posix.granted.clear();

    for dom in st.domains.values_mut() {
        for l in &dom.inode.granted {
            warn!(ino = %ino, domain = %dom.name, owner = %l.owner, range = %l.range, "Pending inode locks found, releasing");
        }
        for l in &dom.entry.granted {
            warn!(ino = %ino, domain = %dom.name, owner = %l.owner, basename = ?l.basename, "Pending entry locks found, releasing");
        }
        cancelled += cancel_all(&mut dom.inode.blocked, wake);
        cancelled += cancel_all(&mut dom.entry.blocked, wake);
        dom.inode.granted.clear();
        dom.entry.granted.clear();
    }

    cancelled += cancel_all(&mut st.reservations.blocked, wake);
    cancelled += cancel_all(&mut st.reservations.deferred, wake);
    st.reservations.granted.clear();
    cancelled += rw_gate::cancel_all(&mut st.pending_io, wake);
    cancelled
}

#[async_trait]
impl LockFops for LockManager {
    async fn lk(&self, inode: &Inode, owner: Owner, cmd: LkCmd, flock: Flock) -> Result<Flock> {
        let desc = self.describe(|| {
            format!(
                "lock=FCNTL, cmd={}, type={}, start={}, len={}, pid={}",
                cmd, flock.kind, flock.start, flock.len, owner.pid
            )
        });
        self.trace_request("LK", inode.id, &owner, &desc);

        let range = flock.range()?;
        let kind = PosixKind::from(flock.kind);
        if matches!(cmd, LkCmd::ReserveLk | LkCmd::ReserveLkW) && kind == PosixKind::Unlock {
            return Err(LockError::invalid("a reservation needs a read or write lock type"));
        }

        let outcome = self.with_live_state(
            inode,
            |st: &mut LockState, wake: &mut Wakeups| -> Result<(Flock, Option<WaitHandle>)> {
                match cmd {
                    LkCmd::GetLk => Ok((posix::get_lock(&st.posix, &owner, kind, range), None)),
                    LkCmd::SetLk | LkCmd::SetLkW => {
                        let can_block = cmd.can_block();
                        let lock = ByteRangeLock::new(st.ids.next(), owner, kind, range);
                        let (lock, consumed) = match reserve::verify(&mut st.reservations, lock, can_block)? {
                            Admission::Deferred(handle) => return Ok((flock, Some(handle))),
                            Admission::Proceed(lock) => (lock, false),
                            Admission::Consumed(lock) => (lock, true),
                        };
                        let acquired = posix::set_lock(&mut st.posix, &mut st.ids, lock, can_block, wake);
                        if consumed {
                            reserve::replay_deferred(&mut st.reservations, &mut st.posix, &mut st.ids, wake);
                        }
                        rw_gate::replay_pending_io(&st.posix, &mut st.pending_io, wake);
                        let pending = match acquired? {
                            Acquire::Granted => None,
                            Acquire::Blocked(handle) => Some(handle),
                        };
                        Ok((flock, pending))
                    }
                    LkCmd::ReserveLk | LkCmd::ReserveLkW => {
                        let lock = ReservationLock::new(st.ids.next(), owner, range);
                        let pending = match reserve::reserve(&mut st.reservations, lock, cmd.can_block())? {
                            Acquire::Granted => None,
                            Acquire::Blocked(handle) => Some(handle),
                        };
                        Ok((posix::get_lock(&st.posix, &owner, kind, range), pending))
                    }
                    LkCmd::ReserveUnlk => {
                        reserve::release(&mut st.reservations, &owner, &range)?;
                        reserve::replay_deferred(&mut st.reservations, &mut st.posix, &mut st.ids, wake);
                        rw_gate::replay_pending_io(&st.posix, &mut st.pending_io, wake);
                        Ok((flock, None))
                    }
                }
            },
        );

        let (reply, pending) = match outcome {
            Ok(v) => v,
            Err(err) => {
                self.trace_verdict("LK", inode.id, &owner, &desc, Some(&err));
                return Err(err);
            }
        };
        let Some(handle) = pending else {
            self.trace_verdict("LK", inode.id, &owner, &desc, None);
            return Ok(reply);
        };
        self.await_grant("LK", inode.id, &owner, &desc, handle).await?;
        if cmd == LkCmd::ReserveLkW {
            return Ok(self.with_live_state(inode, |st: &mut LockState, _: &mut Wakeups| {
                posix::get_lock(&st.posix, &owner, kind, range)
            }));
        }
        Ok(reply)
    }

    async fn inodelk(&self, inode: &Inode, domain: &str, owner: Owner, cmd: LkCmd, flock: Flock) -> Result<()> {
        if domain.is_empty() {
            return Err(LockError::invalid("inodelk needs a domain"));
        }
        let desc = self.describe(|| {
            format!(
                "lock=INODELK, cmd={}, type={}, domain: {}, start={}, len={}, pid={}",
                cmd, flock.kind, domain, flock.start, flock.len, owner.pid
            )
        });
        self.trace_request("INODELK", inode.id, &owner, &desc);

        let can_block = match cmd {
            LkCmd::SetLk => false,
            LkCmd::SetLkW => true,
            LkCmd::GetLk => {
                return Err(LockError::NotSupported {
                    op: "GETLK on inodelk".to_string(),
                })
            }
            other => return Err(LockError::invalid(format!("{} is not an inodelk command", other))),
        };
        let range = flock.range()?;
        let domain = effective_domain(domain, &flock);

        let outcome = self.with_live_state(
            inode,
            |st: &mut LockState, wake: &mut Wakeups| -> Result<Option<WaitHandle>> {
                if flock.kind == FlockKind::Unlock {
                    let Some(dom) = st.domains.get_mut(&*domain) else {
                        return Err(LockError::not_found(format!("inodelk domain {}", domain)));
                    };
                    inodelk::unlock_range(&mut dom.inode, &owner, &range)?;
                    grant_blocked(&mut dom.inode, wake);
                    return Ok(None);
                }
                let kind = InodeLockKind::from_flock(flock.kind)?;
                let lock = RangeInodeLock::new(st.ids.next(), owner, kind, range);
                match inodelk::lock_range(&mut st.domain_mut(&domain).inode, lock, can_block)? {
                    Acquire::Granted => Ok(None),
                    Acquire::Blocked(handle) => Ok(Some(handle)),
                }
            },
        );

        match outcome {
            Ok(None) => {
                self.trace_verdict("INODELK", inode.id, &owner, &desc, None);
                Ok(())
            }
            Ok(Some(handle)) => self.await_grant("INODELK", inode.id, &owner, &desc, handle).await,
            Err(err) => {
                self.trace_verdict("INODELK", inode.id, &owner, &desc, Some(&err));
                Err(err)
            }
        }
    }

    async fn entrylk(
        &self,
        parent: &Inode,
        domain: &str,
        owner: Owner,
        basename: Option<&str>,
        cmd: EntryLkCmd,
        kind: EntryLkKind,
    ) -> Result<()> {
        if domain.is_empty() {
            return Err(LockError::invalid("entrylk needs a domain"));
        }
        if kind == EntryLkKind::Read {
            return Err(LockError::invalid("entry locks are exclusive only"));
        }
        let desc = self.describe(|| {
            format!(
                "lock=ENTRYLK, cmd={}, type=WRITE, basename={}, domain: {}",
                cmd,
                basename.unwrap_or("(null)"),
                domain
            )
        });
        self.trace_request("ENTRYLK", parent.id, &owner, &desc);

        let outcome = self.with_live_state(
            parent,
            |st: &mut LockState, wake: &mut Wakeups| -> Result<Option<WaitHandle>> {
                match cmd {
                    EntryLkCmd::Unlock => {
                        if let Some(dom) = st.domains.get_mut(domain) {
                            entry::unlock_name(&mut dom.entry, &owner, basename);
                            grant_blocked(&mut dom.entry, wake);
                        }
                        Ok(None)
                    }
                    EntryLkCmd::Lock | EntryLkCmd::LockNb => {
                        let lock = NamedEntryLock::new(st.ids.next(), owner, basename.map(str::to_string));
                        let can_block = cmd == EntryLkCmd::Lock;
                        match entry::lock_name(&mut st.domain_mut(domain).entry, lock, can_block)? {
                            Acquire::Granted => Ok(None),
                            Acquire::Blocked(handle) => Ok(Some(handle)),
                        }
                    }
                }
            },
        );

        match outcome {
            Ok(None) => {
                self.trace_verdict("ENTRYLK", parent.id, &owner, &desc, None);
                Ok(())
            }
            Ok(Some(handle)) => self.await_grant("ENTRYLK", parent.id, &owner, &desc, handle).await,
            Err(err) => {
                self.trace_verdict("ENTRYLK", parent.id, &owner, &desc, Some(&err));
                Err(err)
            }
        }
    }

    async fn readv(&self, inode: &Inode, owner: Owner, offset: u64, len: u64, nonblocking: bool) -> Result<()> {
        self.gate_io(inode, owner, IoKind::Read, offset, len, nonblocking).await
    }

    async fn writev(&self, inode: &Inode, owner: Owner, offset: u64, len: u64, nonblocking: bool) -> Result<()> {
        self.gate_io(inode, owner, IoKind::Write, offset, len, nonblocking).await
    }

    async fn truncate(&self, inode: &Inode, owner: Owner, offset: u64) -> Result<()> {
        if !self.config.mandatory_locks {
            return Ok(());
        }
        let Some(locks) = self.lookup(inode.id) else {
            return Ok(());
        };
        let conflict = self.with_state(&locks, |st: &mut LockState, _: &mut Wakeups| {
            self.gate_active(st) && posix::truncate_conflict(&st.posix, &owner, offset)
        });
        if conflict {
            debug!(ino = %inode.id, owner = %owner, offset, "Truncate refused by mandatory lock");
            return Err(LockError::WouldBlock);
        }
        Ok(())
    }

    async fn flush(&self, inode: &Inode, owner: Owner) -> Result<()> {
        let Some(locks) = self.lookup(inode.id) else {
            return Ok(());
        };
        self.with_state(&locks, |st: &mut LockState, wake: &mut Wakeups| {
            let (granted, blocked) = posix::flush_owner(&mut st.posix, &owner, wake);
            if owner.is_connection_wide() {
                rw_gate::cancel_owner(&mut st.pending_io, &owner, wake);
            }
            grant_blocked_posix(&mut st.posix, &mut st.ids, wake);
            rw_gate::replay_pending_io(&st.posix, &mut st.pending_io, wake);
            debug!(ino = %st.ino(), owner = %owner, granted, blocked, "Flushed posix locks");
        });
        Ok(())
    }

    async fn release(&self, owner: Owner) {
        self.release_all(owner);
    }

    async fn clear_locks(&self, inode: &Inode, selector: &str) -> Result<ClearCount> {
        let sel: ClearSelector = selector.parse()?;
        let Some(locks) = self.lookup(inode.id) else {
            return Ok(ClearCount::new(sel.lock_type));
        };
        let count = self.with_state(&locks, |st: &mut LockState, wake: &mut Wakeups| {
            let count = clear::clear_locks(st, &sel, wake)?;
            rw_gate::replay_pending_io(&st.posix, &mut st.pending_io, wake);
            Ok::<_, LockError>(count)
        })?;
        info!(ino = %inode.id, "{}", count);
        Ok(count)
    }

    fn forget(&self, ino: InodeId) {
        let Some((_, locks)) = self.inodes.remove(&ino) else {
            return;
        };
        let cancelled = self.with_state(&locks, |st: &mut LockState, wake: &mut Wakeups| teardown(st, wake));
        debug!(ino = %ino, cancelled, "Lock state destroyed");
    }
}
