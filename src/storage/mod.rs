//! Storage layer interface.
//!
//! [`Storage`] is what the view core needs from a table engine: planning
//! reads, building insert sinks, locking, truncation, the atomic all-data
//! transfer used by swap-style refresh, and the DDL operations a view
//! forwards to its target table. [`MemoryTable`] is an in-process engine
//! implementing all of it.

mod factory;
mod lock;
mod memory;
mod sink;

pub use factory::{MemoryTableCreator, StorageCreateArgs, StorageFactory, StorageFeatures, TableCreator};
pub use lock::{
    ActionBlockType, ActionBlockers, ActionLock, TableExclusiveLockHolder, TableLock,
    TableLockHolder,
};
pub use memory::MemoryTable;
pub use sink::{BlockSink, SinkToStorage};

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::{Field, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::ast::{CreateQuery, InsertQuery, MutationCommand, OptimizeQuery, PartitionCommand};
use crate::catalog::StorageId;
use crate::config::Settings;
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};
use crate::plan::{QueryPlan, QueryProcessingStage, SelectQueryInfo};

/// Structural metadata of a table at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    pub columns: SchemaRef,
    /// Columns rows are sorted by, outermost first
    pub sorting_key: Vec<String>,
    pub partition_by: Option<String>,
    pub comment: String,
}

impl TableMetadata {
    pub fn new(columns: SchemaRef) -> Self {
        Self {
            columns,
            sorting_key: Vec::new(),
            partition_by: None,
            comment: String::new(),
        }
    }

    pub fn with_sorting_key(mut self, sorting_key: Vec<String>) -> Self {
        self.sorting_key = sorting_key;
        self
    }

    pub fn from_create_query(query: &CreateQuery) -> Self {
        let storage = query.storage.as_ref();
        Self {
            columns: query.columns.clone(),
            sorting_key: storage.map(|s| s.order_by.clone()).unwrap_or_default(),
            partition_by: storage.and_then(|s| s.partition_by.clone()),
            comment: query.comment.clone(),
        }
    }
}

/// Metadata snapshot a read or write is planned against.
pub type StorageSnapshot = Arc<TableMetadata>;

/// A piece of table data placed into a backup.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path_in_backup: String,
    pub batch: RecordBatch,
}

/// Collects backup entries from the tables being backed up.
#[derive(Debug, Default)]
pub struct BackupEntriesCollector {
    entries: Vec<BackupEntry>,
}

impl BackupEntriesCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path_in_backup: impl Into<String>, batch: RecordBatch) {
        self.entries.push(BackupEntry {
            path_in_backup: path_in_backup.into(),
            batch,
        });
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A table engine instance.
pub trait Storage: Debug + Send + Sync {
    /// Return this storage as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Current identity.
    fn storage_id(&self) -> StorageId;

    /// Update the identity after the catalog renamed the table.
    fn rename_in_memory(&self, new_id: &StorageId) -> Result<()>;

    fn engine_name(&self) -> &str;

    /// Called once the table is registered and ready to serve queries.
    fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// Called before the table is detached or dropped.
    fn shutdown(&self) {}

    /// Called when the table is dropped, after [`Storage::shutdown`].
    fn drop_storage(&self) -> Result<()> {
        Ok(())
    }

    /// Current metadata snapshot.
    fn metadata(&self) -> StorageSnapshot;

    /// The furthest stage this table can process `query_info` to by itself.
    fn query_processing_stage(
        &self,
        _ctx: &QueryContext,
        _to_stage: QueryProcessingStage,
        _snapshot: &StorageSnapshot,
        _query_info: &SelectQueryInfo,
    ) -> Result<QueryProcessingStage> {
        Ok(QueryProcessingStage::FetchColumns)
    }

    /// Add the steps reading `column_names` to `plan`.
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        plan: &mut QueryPlan,
        column_names: &[String],
        snapshot: &StorageSnapshot,
        query_info: &SelectQueryInfo,
        ctx: &QueryContext,
        processed_stage: QueryProcessingStage,
        max_block_size: usize,
        num_streams: usize,
    ) -> Result<()>;

    /// Build a sink for `query`.
    fn write(
        &self,
        query: &InsertQuery,
        snapshot: &StorageSnapshot,
        ctx: &QueryContext,
    ) -> Result<SinkToStorage>;

    fn lock_for_share(&self, query_id: &str, timeout: Duration) -> Result<TableLockHolder>;

    fn lock_exclusively(&self, query_id: &str, timeout: Duration)
        -> Result<TableExclusiveLockHolder>;

    /// Remove all rows. The caller holds the exclusive lock.
    fn truncate(
        &self,
        snapshot: &StorageSnapshot,
        ctx: &QueryContext,
        lock: &TableExclusiveLockHolder,
    ) -> Result<()>;

    /// Take over all data of `source` in one atomic step.
    fn transfer_all_data_from(
        &self,
        _source: &Arc<dyn Storage>,
        _remove_from_source: bool,
        _replace_at_destination: bool,
        _ctx: &QueryContext,
    ) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Engine {} doesn't support moving data between tables",
            self.engine_name()
        )))
    }

    fn optimize(
        &self,
        _query: &OptimizeQuery,
        _snapshot: &StorageSnapshot,
        _ctx: &QueryContext,
    ) -> Result<bool> {
        Err(BlazeError::not_implemented(format!(
            "Method optimize is not supported by storage {}",
            self.engine_name()
        )))
    }

    fn check_mutation_is_possible(
        &self,
        _commands: &[MutationCommand],
        _settings: &Settings,
    ) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Table engine {} doesn't support mutations",
            self.engine_name()
        )))
    }

    fn mutate(&self, _commands: &[MutationCommand], _ctx: &QueryContext) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Mutations are not supported by storage {}",
            self.engine_name()
        )))
    }

    fn check_alter_partition_is_possible(
        &self,
        _commands: &[PartitionCommand],
        _snapshot: &StorageSnapshot,
        _settings: &Settings,
    ) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Table engine {} doesn't support partitioning",
            self.engine_name()
        )))
    }

    fn alter_partition(
        &self,
        _snapshot: &StorageSnapshot,
        _commands: &[PartitionCommand],
        _ctx: &QueryContext,
    ) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Partition operations are not supported by storage {}",
            self.engine_name()
        )))
    }

    /// Paths holding the table's data.
    fn data_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn total_rows(&self, _settings: &Settings) -> Option<u64> {
        None
    }

    fn total_bytes(&self, _settings: &Settings) -> Option<u64> {
        None
    }

    fn total_bytes_uncompressed(&self, _settings: &Settings) -> Option<u64> {
        None
    }

    fn backup_data(
        &self,
        _collector: &mut BackupEntriesCollector,
        _data_path_in_backup: &str,
        _partitions: Option<&[String]>,
    ) -> Result<()> {
        Ok(())
    }

    fn restore_data_from_backup(
        &self,
        _entries: &[BackupEntry],
        _data_path_in_backup: &str,
        _partitions: Option<&[String]>,
    ) -> Result<()> {
        Err(BlazeError::not_implemented(format!(
            "Table engine {} doesn't support restoring data",
            self.engine_name()
        )))
    }

    fn supports_backup_partition(&self) -> bool {
        false
    }

    /// Pause a category of background activity on this table.
    fn action_lock(&self, _kind: ActionBlockType) -> ActionLock {
        ActionLock::empty()
    }

    fn is_remote(&self) -> bool {
        false
    }

    /// Columns readable from the table without being part of its schema.
    fn virtual_columns(&self) -> Vec<Field> {
        Vec::new()
    }
}
