//! Table-level locks and action blockers.
//!
//! Shared locks are held by reads and writes for the whole lifetime of the
//! plan or sink that uses the table; exclusive locks are taken for
//! structural operations such as TRUNCATE. Guards own their lock so they can
//! be moved into plans and sinks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::error::{BlazeError, Result};

/// The structure lock of one table.
#[derive(Debug, Default)]
pub struct TableLock {
    rw: Arc<RwLock<()>>,
}

impl TableLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock in shared mode, waiting at most `timeout`.
    pub fn lock_for_share(
        &self,
        table: &str,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableLockHolder> {
        let guard = self
            .rw
            .try_read_arc_for(timeout)
            .ok_or_else(|| BlazeError::lock_timeout("share", table, query_id, timeout))?;
        Ok(TableLockHolder {
            table: table.to_string(),
            query_id: query_id.to_string(),
            _guard: guard,
        })
    }

    /// Take the lock in exclusive mode, waiting at most `timeout`.
    pub fn lock_exclusively(
        &self,
        table: &str,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder> {
        let guard = self
            .rw
            .try_write_arc_for(timeout)
            .ok_or_else(|| BlazeError::lock_timeout("exclusive", table, query_id, timeout))?;
        Ok(TableExclusiveLockHolder {
            table: table.to_string(),
            query_id: query_id.to_string(),
            _guard: guard,
        })
    }
}

/// A held shared table lock. Released on drop.
pub struct TableLockHolder {
    table: String,
    query_id: String,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl TableLockHolder {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl fmt::Debug for TableLockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableLockHolder")
            .field("table", &self.table)
            .field("query_id", &self.query_id)
            .finish()
    }
}

/// A held exclusive table lock. Released on drop.
pub struct TableExclusiveLockHolder {
    table: String,
    query_id: String,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl TableExclusiveLockHolder {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl fmt::Debug for TableExclusiveLockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableExclusiveLockHolder")
            .field("table", &self.table)
            .field("query_id", &self.query_id)
            .finish()
    }
}

/// Category of background activity that can be paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionBlockType {
    ViewRefresh,
    Merges,
    Ttl,
    PartsMove,
}

/// Token returned when an activity is paused. Dropping it (or calling
/// [`ActionLock::release`]) resumes everything it paused, most recently
/// paused first.
#[derive(Default)]
pub struct ActionLock {
    on_release: Vec<Box<dyn FnOnce() + Send>>,
}

impl ActionLock {
    /// A token that pauses nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A token that runs `on_release` when released.
    pub fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_release: vec![Box::new(on_release)],
        }
    }

    /// Fold `other` into this token; releasing the result releases both.
    pub fn merge(mut self, mut other: ActionLock) -> Self {
        self.on_release.append(&mut other.on_release);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_release.is_empty()
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ActionLock {
    fn drop(&mut self) {
        while let Some(resume) = self.on_release.pop() {
            resume();
        }
    }
}

impl fmt::Debug for ActionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionLock")
            .field("actions", &self.on_release.len())
            .finish()
    }
}

/// Per-table pause counters, one per [`ActionBlockType`].
#[derive(Debug, Default)]
pub struct ActionBlockers {
    counters: Mutex<HashMap<ActionBlockType, Arc<AtomicUsize>>>,
}

impl ActionBlockers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause `kind` until the returned token is released.
    pub fn cancel(&self, kind: ActionBlockType) -> ActionLock {
        let counter = self.counter(kind);
        counter.fetch_add(1, Ordering::SeqCst);
        ActionLock::new(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn is_cancelled(&self, kind: ActionBlockType) -> bool {
        self.counter(kind).load(Ordering::SeqCst) > 0
    }

    fn counter(&self, kind: ActionBlockType) -> Arc<AtomicUsize> {
        self.counters.lock().entry(kind).or_default().clone()
    }
}
