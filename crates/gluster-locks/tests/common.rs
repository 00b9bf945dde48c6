//! Shared fixtures for the lock manager integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use gluster_locks::{Flock, FlockKind, Inode, LockManager, LocksConfig};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// How long a request must stay parked to count as blocked.
pub const STILL_BLOCKED: Duration = Duration::from_millis(50);

/// Installs a test subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn manager() -> Arc<LockManager> {
    init_tracing();
    Arc::new(LockManager::default())
}

pub fn manager_with(config: LocksConfig) -> Arc<LockManager> {
    init_tracing();
    Arc::new(LockManager::new(config))
}

/// Manager with the mandatory-locking gate switched on.
pub fn mandatory_manager() -> Arc<LockManager> {
    manager_with(LocksConfig {
        mandatory_locks: true,
        trace: false,
    })
}

/// Regular file, advisory locking only.
pub fn file(ino: u64) -> Inode {
    Inode::new(ino, 0o100644)
}

/// Regular file marked for mandatory locking (setgid, no group exec).
pub fn mandatory_file(ino: u64) -> Inode {
    Inode::new(ino, 0o102644)
}

pub fn dir(ino: u64) -> Inode {
    Inode::new(ino, 0o040755)
}

pub fn rd(start: i64, len: i64) -> Flock {
    Flock::new(FlockKind::Read, start, len)
}

pub fn wr(start: i64, len: i64) -> Flock {
    Flock::new(FlockKind::Write, start, len)
}

pub fn un(start: i64, len: i64) -> Flock {
    Flock::new(FlockKind::Unlock, start, len)
}

/// Runs a request on its own task so the test can observe it blocking.
pub fn spawn<F, T>(fut: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
}

/// True if the task has not finished within [`STILL_BLOCKED`].
pub async fn still_pending<T>(task: &mut JoinHandle<T>) -> bool {
    tokio::time::timeout(STILL_BLOCKED, task).await.is_err()
}
