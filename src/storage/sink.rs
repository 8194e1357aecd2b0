//! Insert sinks.

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use super::{Storage, TableLockHolder};
use crate::error::Result;

/// Engine-specific consumer of inserted blocks.
pub trait BlockSink: Send {
    /// Header blocks are expected in.
    fn header(&self) -> SchemaRef;

    fn consume(&mut self, batch: RecordBatch) -> Result<()>;

    /// Make everything consumed so far visible. Returns the number of rows
    /// written.
    fn finish(&mut self) -> Result<usize>;
}

/// A sink plus everything that must stay alive while it is being written to.
pub struct SinkToStorage {
    inner: Box<dyn BlockSink>,
    table_locks: Vec<TableLockHolder>,
    storage_holders: Vec<Arc<dyn Storage>>,
}

impl SinkToStorage {
    pub fn new(inner: Box<dyn BlockSink>) -> Self {
        Self {
            inner,
            table_locks: Vec::new(),
            storage_holders: Vec::new(),
        }
    }

    /// Keep `lock` held until the sink is finished or dropped.
    pub fn add_table_lock(&mut self, lock: TableLockHolder) {
        self.table_locks.push(lock);
    }

    /// Keep `storage` alive until the sink is finished or dropped.
    pub fn add_storage_holder(&mut self, storage: Arc<dyn Storage>) {
        self.storage_holders.push(storage);
    }

    pub fn table_locks(&self) -> &[TableLockHolder] {
        &self.table_locks
    }

    pub fn header(&self) -> SchemaRef {
        self.inner.header()
    }

    pub fn consume(&mut self, batch: RecordBatch) -> Result<()> {
        self.inner.consume(batch)
    }

    /// Finish writing, then release held locks.
    pub fn finish(mut self) -> Result<usize> {
        self.inner.finish()
    }
}

impl fmt::Debug for SinkToStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkToStorage")
            .field("header", &self.inner.header())
            .field("table_locks", &self.table_locks)
            .finish_non_exhaustive()
    }
}
