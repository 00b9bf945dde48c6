//! Administrative clearing of stuck locks.
//!
//! The operator sends a selector such as `glusterfs.clrlk.tinode.kall` or
//! `tposix.kblocked.0,100`. Waiting requests that match are failed with
//! `Cancelled`; granted locks that match are dropped and the grant cascade
//! runs for the lists they were removed from.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LockError, Result};
use crate::grant::grant_blocked;
use crate::posix::grant_blocked_posix;
use crate::record::LockRecord;
use crate::state::LockState;
use crate::types::LockRange;
use crate::waiter::Wakeups;

/// Key prefix under which clear requests arrive.
pub const CLEAR_LOCKS_PREFIX: &str = "glusterfs.clrlk";

/// Which lock family to clear.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearType {
    Inode,
    Entry,
    Posix,
}

impl fmt::Display for ClearType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClearType::Inode => "inode",
            ClearType::Entry => "entry",
            ClearType::Posix => "posix",
        })
    }
}

/// Which records of the family to clear.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearKind {
    Blocked,
    Granted,
    All,
}

impl ClearKind {
    fn blocked(self) -> bool {
        matches!(self, ClearKind::Blocked | ClearKind::All)
    }

    fn granted(self) -> bool {
        matches!(self, ClearKind::Granted | ClearKind::All)
    }
}

/// Optional narrowing of a clear request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearFilter {
    /// Only locks on exactly this range (inode and posix).
    Range(LockRange),
    /// Only locks on this entry name (entry).
    Basename(String),
}

/// A parsed clear request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearSelector {
    pub lock_type: ClearType,
    pub kind: ClearKind,
    pub filter: Option<ClearFilter>,
}

fn keyword<'a>(token: Option<&'a str>, parts: &mut std::str::Split<'a, char>, key: char) -> Option<&'a str> {
    let token = token?;
    if token.len() == 1 && token.starts_with(key) {
        parts.next()
    } else {
        token.strip_prefix(key)
    }
}

fn parse_range(s: &str) -> Result<LockRange> {
    let bad = || LockError::invalid(format!("malformed lock range '{}'", s));
    let (head, tail) = s.split_once(',').ok_or_else(bad)?;
    // "<whence>,<start>-<len>" is accepted alongside "<start>,<len>"
    let (start, len) = match tail.split_once('-') {
        Some((start, len)) => (start, len),
        None => (head, tail),
    };
    let start: i64 = start.trim().parse().map_err(|_| bad())?;
    let len: i64 = len.trim().parse().map_err(|_| bad())?;
    LockRange::from_flock(start, len)
}

impl FromStr for ClearSelector {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(CLEAR_LOCKS_PREFIX)
            .map(|rest| rest.strip_prefix('.').unwrap_or(rest))
            .unwrap_or(s);
        let mut parts = body.split('.');

        let first = parts.next();
        let lock_type = match keyword(first, &mut parts, 't') {
            Some("inode") => ClearType::Inode,
            Some("entry") => ClearType::Entry,
            Some("posix") => ClearType::Posix,
            _ => return Err(LockError::invalid(format!("bad lock type in '{}'", s))),
        };
        let second = parts.next();
        let kind = match keyword(second, &mut parts, 'k') {
            Some("blocked") => ClearKind::Blocked,
            Some("granted") => ClearKind::Granted,
            Some("all") => ClearKind::All,
            _ => return Err(LockError::invalid(format!("bad lock kind in '{}'", s))),
        };

        let rest = parts.collect::<Vec<_>>();
        if rest.is_empty() {
            return Ok(ClearSelector {
                lock_type,
                kind,
                filter: None,
            });
        }
        let rest = rest.join(".");
        if rest.is_empty() {
            return Err(LockError::invalid(format!("empty filter in '{}'", s)));
        }
        let filter = if lock_type == ClearType::Entry {
            Some(ClearFilter::Basename(rest))
        } else {
            Some(ClearFilter::Range(parse_range(&rest)?))
        };

        Ok(ClearSelector {
            lock_type,
            kind,
            filter,
        })
    }
}

/// How many locks a clear request removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCount {
    pub lock_type: ClearType,
    pub blocked: usize,
    pub granted: usize,
}

impl ClearCount {
    /// Nothing cleared yet.
    pub fn new(lock_type: ClearType) -> Self {
        Self {
            lock_type,
            blocked: 0,
            granted: 0,
        }
    }

    fn add(&mut self, (blocked, granted): (usize, usize)) {
        self.blocked += blocked;
        self.granted += granted;
    }

    /// Sums the counts of the same lock type from several inodes.
    pub fn merge(&mut self, other: &ClearCount) {
        self.blocked += other.blocked;
        self.granted += other.granted;
    }
}

impl fmt::Display for ClearCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blocked == 0 && self.granted == 0 {
            return f.write_str("No locks cleared.");
        }
        write!(
            f,
            "{} blocked locks={} granted locks={}",
            self.lock_type, self.blocked, self.granted
        )
    }
}

fn clear_list<L, F>(
    granted: &mut Vec<L>,
    blocked: &mut VecDeque<L>,
    kind: ClearKind,
    matches: F,
    wake: &mut Wakeups,
) -> (usize, usize)
where
    L: LockRecord,
    F: Fn(&L) -> bool,
{
    let mut nblocked = 0;
    if kind.blocked() {
        let queued = std::mem::take(blocked);
        for mut lock in queued {
            if matches(&lock) {
                nblocked += 1;
                warn!(id = %lock.id(), owner = %lock.owner(), "Clearing blocked lock");
                if let Some(w) = lock.take_waiter() {
                    wake.fail(w, LockError::Cancelled);
                }
            } else {
                blocked.push_back(lock);
            }
        }
    }

    let mut ngranted = 0;
    if kind.granted() {
        granted.retain(|lock| {
            let hit = matches(lock);
            if hit {
                ngranted += 1;
                warn!(id = %lock.id(), owner = %lock.owner(), "Clearing granted lock");
            }
            !hit
        });
    }
    (nblocked, ngranted)
}

/// Applies a clear request to one inode.
pub fn clear_locks(state: &mut LockState, sel: &ClearSelector, wake: &mut Wakeups) -> Result<ClearCount> {
    let mut count = ClearCount::new(sel.lock_type);
    let range = match &sel.filter {
        Some(ClearFilter::Range(r)) => Some(*r),
        _ => None,
    };
    let basename = match &sel.filter {
        Some(ClearFilter::Basename(b)) => Some(b.as_str()),
        _ => None,
    };

    match sel.lock_type {
        ClearType::Posix => {
            if basename.is_some() {
                return Err(LockError::invalid("posix locks are cleared by range"));
            }
            let list = &mut state.posix;
            count.add(clear_list(
                &mut list.granted,
                &mut list.blocked,
                sel.kind,
                |l| range.map_or(true, |r| l.range == r),
                wake,
            ));
            grant_blocked_posix(&mut state.posix, &mut state.ids, wake);
        }
        ClearType::Inode => {
            if basename.is_some() {
                return Err(LockError::invalid("inode locks are cleared by range"));
            }
            for dom in state.domains.values_mut() {
                let list = &mut dom.inode;
                count.add(clear_list(
                    &mut list.granted,
                    &mut list.blocked,
                    sel.kind,
                    |l| range.map_or(true, |r| l.range == r),
                    wake,
                ));
                grant_blocked(&mut dom.inode, wake);
            }
        }
        ClearType::Entry => {
            if range.is_some() {
                return Err(LockError::invalid("entry locks are cleared by name"));
            }
            for dom in state.domains.values_mut() {
                let list = &mut dom.entry;
                count.add(clear_list(
                    &mut list.granted,
                    &mut list.blocked,
                    sel.kind,
                    |l| basename.map_or(true, |b| l.basename.as_deref() == Some(b)),
                    wake,
                ));
                grant_blocked(&mut dom.entry, wake);
            }
        }
    }
    Ok(count)
}
