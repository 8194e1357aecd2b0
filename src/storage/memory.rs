//! In-memory table engine.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    ActionBlockType, ActionBlockers, ActionLock, BackupEntriesCollector, BackupEntry, BlockSink,
    SinkToStorage, Storage, StorageSnapshot, TableExclusiveLockHolder, TableLock,
    TableLockHolder, TableMetadata,
};
use crate::ast::{InsertQuery, MutationCommand, OptimizeQuery};
use crate::catalog::StorageId;
use crate::config::Settings;
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};
use crate::plan::{project_columns, PlanStep, QueryPlan, QueryProcessingStage, ReadFromStorageStep, SelectQueryInfo};

/// An in-memory table backed by Arrow RecordBatches.
#[derive(Debug)]
pub struct MemoryTable {
    id: RwLock<StorageId>,
    engine_name: String,
    metadata: StorageSnapshot,
    batches: Arc<RwLock<Vec<RecordBatch>>>,
    structure_lock: TableLock,
    blockers: ActionBlockers,
    mutations: Mutex<Vec<MutationCommand>>,
}

impl MemoryTable {
    /// Create an empty memory table.
    pub fn new(id: StorageId, metadata: TableMetadata) -> Self {
        Self {
            id: RwLock::new(id),
            engine_name: "Memory".to_string(),
            metadata: Arc::new(metadata),
            batches: Arc::new(RwLock::new(Vec::new())),
            structure_lock: TableLock::new(),
            blockers: ActionBlockers::new(),
            mutations: Mutex::new(Vec::new()),
        }
    }

    /// Report a different engine name (for engines registered on top of
    /// the in-memory one).
    pub fn with_engine_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    /// Seed the table with data.
    pub fn with_batches(self, batches: Vec<RecordBatch>) -> Self {
        *self.batches.write() = batches;
        self
    }

    /// Get the number of rows in the table.
    pub fn num_rows(&self) -> usize {
        self.batches.read().iter().map(|b| b.num_rows()).sum()
    }

    /// Snapshot of the stored batches.
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.batches.read().clone()
    }

    /// Append batches to the table.
    pub fn append(&self, mut new_batches: Vec<RecordBatch>) {
        self.batches.write().append(&mut new_batches);
    }

    /// Whether `kind` is currently paused on this table.
    pub fn is_action_blocked(&self, kind: ActionBlockType) -> bool {
        self.blockers.is_cancelled(kind)
    }

    /// Mutations accepted so far, oldest first.
    pub fn mutations(&self) -> Vec<MutationCommand> {
        self.mutations.lock().clone()
    }

    fn data_path(&self) -> String {
        let id = self.id.read();
        match id.uuid {
            Some(uuid) => format!("store/{}/", uuid),
            None => format!("data/{}/{}/", id.database, id.table),
        }
    }
}

impl Storage for MemoryTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        self.id.read().clone()
    }

    fn rename_in_memory(&self, new_id: &StorageId) -> Result<()> {
        *self.id.write() = new_id.clone();
        Ok(())
    }

    fn engine_name(&self) -> &str {
        &self.engine_name
    }

    fn metadata(&self) -> StorageSnapshot {
        self.metadata.clone()
    }

    fn read(
        &self,
        plan: &mut QueryPlan,
        column_names: &[String],
        snapshot: &StorageSnapshot,
        query_info: &SelectQueryInfo,
        _ctx: &QueryContext,
        _processed_stage: QueryProcessingStage,
        _max_block_size: usize,
        _num_streams: usize,
    ) -> Result<()> {
        let header = Arc::new(project_columns(&snapshot.columns, column_names)?);
        let batches = self
            .batches
            .read()
            .iter()
            .map(|batch| {
                let columns = column_names
                    .iter()
                    .map(|name| Ok(batch.column(batch.schema().index_of(name)?).clone()))
                    .collect::<Result<Vec<ArrayRef>>>()?;
                Ok(RecordBatch::try_new(header.clone(), columns)?)
            })
            .collect::<Result<Vec<_>>>()?;

        plan.add_step(PlanStep::ReadFromStorage(ReadFromStorageStep {
            table: self.storage_id(),
            header,
            batches,
            input_order: query_info.input_order_info.clone(),
        }))
    }

    fn write(
        &self,
        query: &InsertQuery,
        snapshot: &StorageSnapshot,
        _ctx: &QueryContext,
    ) -> Result<SinkToStorage> {
        let header = if query.columns.is_empty() {
            snapshot.columns.clone()
        } else {
            Arc::new(project_columns(&snapshot.columns, &query.columns)?)
        };
        Ok(SinkToStorage::new(Box::new(MemorySink {
            header,
            table_columns: snapshot.columns.clone(),
            destination: self.batches.clone(),
            pending: Vec::new(),
        })))
    }

    fn lock_for_share(&self, query_id: &str, timeout: Duration) -> Result<TableLockHolder> {
        self.structure_lock
            .lock_for_share(&self.id.read().full_table_name(), query_id, timeout)
    }

    fn lock_exclusively(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder> {
        self.structure_lock
            .lock_exclusively(&self.id.read().full_table_name(), query_id, timeout)
    }

    fn truncate(
        &self,
        _snapshot: &StorageSnapshot,
        _ctx: &QueryContext,
        _lock: &TableExclusiveLockHolder,
    ) -> Result<()> {
        self.batches.write().clear();
        Ok(())
    }

    fn transfer_all_data_from(
        &self,
        source: &Arc<dyn Storage>,
        remove_from_source: bool,
        replace_at_destination: bool,
        _ctx: &QueryContext,
    ) -> Result<()> {
        let source_table = source.as_any().downcast_ref::<MemoryTable>().ok_or_else(|| {
            BlazeError::not_implemented(format!(
                "Cannot move data from {} table {} to {} table {}",
                source.engine_name(),
                source.storage_id().name_for_logs(),
                self.engine_name,
                self.storage_id().name_for_logs()
            ))
        })?;
        if source_table.metadata.columns.fields() != self.metadata.columns.fields() {
            return Err(BlazeError::bad_arguments(format!(
                "Tables {} and {} have different structure",
                source_table.storage_id().name_for_logs(),
                self.storage_id().name_for_logs()
            )));
        }
        if std::ptr::eq(source_table, self) {
            return Ok(());
        }

        let moved = if remove_from_source {
            std::mem::take(&mut *source_table.batches.write())
        } else {
            source_table.batches()
        };
        let rows: usize = moved.iter().map(|b| b.num_rows()).sum();
        {
            let mut destination = self.batches.write();
            if replace_at_destination {
                *destination = moved;
            } else {
                destination.extend(moved);
            }
        }
        debug!(
            source = %source_table.storage_id(),
            destination = %self.storage_id(),
            rows,
            "moved all data between tables"
        );
        Ok(())
    }

    fn optimize(
        &self,
        _query: &OptimizeQuery,
        snapshot: &StorageSnapshot,
        _ctx: &QueryContext,
    ) -> Result<bool> {
        let mut batches = self.batches.write();
        if batches.len() > 1 {
            let merged = concat_batches(&snapshot.columns, batches.iter())?;
            *batches = vec![merged];
        }
        Ok(true)
    }

    fn check_mutation_is_possible(
        &self,
        _commands: &[MutationCommand],
        _settings: &Settings,
    ) -> Result<()> {
        Ok(())
    }

    fn mutate(&self, commands: &[MutationCommand], _ctx: &QueryContext) -> Result<()> {
        self.mutations.lock().extend(commands.iter().cloned());
        Ok(())
    }

    fn data_paths(&self) -> Vec<String> {
        vec![self.data_path()]
    }

    fn total_rows(&self, _settings: &Settings) -> Option<u64> {
        Some(self.num_rows() as u64)
    }

    fn total_bytes(&self, _settings: &Settings) -> Option<u64> {
        Some(
            self.batches
                .read()
                .iter()
                .map(|b| b.get_array_memory_size() as u64)
                .sum(),
        )
    }

    fn total_bytes_uncompressed(&self, settings: &Settings) -> Option<u64> {
        self.total_bytes(settings)
    }

    fn backup_data(
        &self,
        collector: &mut BackupEntriesCollector,
        data_path_in_backup: &str,
        _partitions: Option<&[String]>,
    ) -> Result<()> {
        for (i, batch) in self.batches.read().iter().enumerate() {
            collector.add(format!("{}/data.{}", data_path_in_backup, i), batch.clone());
        }
        Ok(())
    }

    fn restore_data_from_backup(
        &self,
        entries: &[BackupEntry],
        data_path_in_backup: &str,
        _partitions: Option<&[String]>,
    ) -> Result<()> {
        let prefix = format!("{}/", data_path_in_backup);
        let restored: Vec<RecordBatch> = entries
            .iter()
            .filter(|e| e.path_in_backup.starts_with(&prefix))
            .map(|e| e.batch.clone())
            .collect();
        self.append(restored);
        Ok(())
    }

    fn action_lock(&self, kind: ActionBlockType) -> ActionLock {
        self.blockers.cancel(kind)
    }
}

/// Buffers inserted blocks and publishes them on finish.
struct MemorySink {
    header: SchemaRef,
    table_columns: SchemaRef,
    destination: Arc<RwLock<Vec<RecordBatch>>>,
    pending: Vec<RecordBatch>,
}

impl MemorySink {
    /// Lay a block out in table column order. Columns absent from the block
    /// are filled with nulls when nullable.
    fn align(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let input = batch.schema();
        let columns = self
            .table_columns
            .fields()
            .iter()
            .map(|field| match input.index_of(field.name()) {
                Ok(i) => {
                    let column = batch.column(i);
                    if column.data_type() == field.data_type() {
                        Ok(column.clone())
                    } else {
                        Ok(cast(column, field.data_type())?)
                    }
                }
                Err(_) if field.is_nullable() => {
                    Ok(new_null_array(field.data_type(), batch.num_rows()))
                }
                Err(_) => Err(BlazeError::bad_arguments(format!(
                    "Column `{}` is required but missing from inserted block",
                    field.name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RecordBatch::try_new(self.table_columns.clone(), columns)?)
    }
}

impl BlockSink for MemorySink {
    fn header(&self) -> SchemaRef {
        self.header.clone()
    }

    fn consume(&mut self, batch: RecordBatch) -> Result<()> {
        let aligned = self.align(&batch)?;
        self.pending.push(aligned);
        Ok(())
    }

    fn finish(&mut self) -> Result<usize> {
        let rows = self.pending.iter().map(|b| b.num_rows()).sum();
        self.destination.write().append(&mut self.pending);
        Ok(rows)
    }
}
