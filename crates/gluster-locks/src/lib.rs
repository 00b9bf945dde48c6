#![warn(missing_docs)]

//! GlusterFS locks translator.
//!
//! Serves POSIX byte-range locks, entry (name) locks and range inode locks
//! per domain, reservation locks, and the mandatory-locking gate for reads
//! and writes. [`LockManager`] is the entry point; it implements
//! [`LockFops`] for the translator stack above it.

pub mod clear;
pub mod config;
pub mod dump;
pub mod entry;
pub mod error;
pub mod grant;
pub mod inodelk;
pub mod manager;
pub mod posix;
pub mod record;
pub mod reserve;
pub mod rw_gate;
pub mod state;
pub mod types;
pub mod waiter;

pub use clear::{ClearCount, ClearSelector, ClearType};
pub use config::LocksConfig;
pub use dump::InodeDump;
pub use error::{LockError, Result};
pub use grant::Acquire;
pub use manager::{LockFops, LockManager};
pub use types::{ClientId, EntryLkCmd, EntryLkKind, Flock, FlockKind, Inode, InodeId, LkCmd, LockRange, Owner};
