// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Task coordination — keeps backup and restore flows from trampling each other
//!
//! Three locks: one global lock that any archive-touching task needs, plus one
//! per task kind. Restore always wins: a backup trigger gives up as soon as it
//! sees the restore lock held. Nothing queues; a losing trigger is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A non-blocking lock flag. Releasing an unheld lock is a no-op.
#[derive(Debug, Default)]
pub struct TaskLock {
    name: &'static str,
    held: AtomicBool,
}

impl TaskLock {
    pub fn new(name: &'static str) -> Self {
        Self { name, held: AtomicBool::new(false) }
    }

    pub fn try_acquire(&self) -> bool {
        let ok = self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug!("lock {} acquire -> {}", self.name, ok);
        ok
    }

    pub fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            debug!("lock {} released", self.name);
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// The three locks, shareable so a test (or a second coordinator view) can inspect them
#[derive(Debug, Clone)]
pub struct TaskLocks {
    pub backup: Arc<TaskLock>,
    pub restore: Arc<TaskLock>,
    pub global: Arc<TaskLock>,
}

impl Default for TaskLocks {
    fn default() -> Self {
        Self {
            backup: Arc::new(TaskLock::new("backup")),
            restore: Arc::new(TaskLock::new("restore")),
            global: Arc::new(TaskLock::new("global")),
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskCoordinator {
    locks: TaskLocks,
}

impl TaskCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_locks(locks: TaskLocks) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &TaskLocks {
        &self.locks
    }

    pub fn acquire_backup(&self) -> bool {
        // A pending or running restore always takes priority
        if self.locks.restore.is_held() {
            return false;
        }
        if !self.locks.global.try_acquire() {
            return false;
        }
        if !self.locks.backup.try_acquire() {
            self.locks.global.release();
            return false;
        }
        true
    }

    pub fn release_backup(&self) {
        self.locks.backup.release();
        self.locks.global.release();
    }

    pub fn acquire_restore(&self) -> bool {
        if !self.locks.global.try_acquire() {
            return false;
        }
        if !self.locks.restore.try_acquire() {
            self.locks.global.release();
            return false;
        }
        true
    }

    pub fn release_restore(&self) {
        self.locks.restore.release();
        self.locks.global.release();
    }

    /// Acquire the backup locks for the lifetime of the returned guard
    pub fn backup_guard(&self) -> Option<BackupGuard<'_>> {
        self.acquire_backup().then(|| BackupGuard { coordinator: self })
    }

    pub fn restore_guard(&self) -> Option<RestoreGuard<'_>> {
        self.acquire_restore().then(|| RestoreGuard { coordinator: self })
    }
}

/// Releases both backup locks exactly once, on every exit path
pub struct BackupGuard<'a> {
    coordinator: &'a TaskCoordinator,
}

impl Drop for BackupGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release_backup();
    }
}

pub struct RestoreGuard<'a> {
    coordinator: &'a TaskCoordinator,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release_restore();
    }
}
