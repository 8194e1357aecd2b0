//! Materialized views.
//!
//! A [`MaterializedView`] stores the result of its SELECT in a target table.
//! The target is either created and owned by the view (an *inner* table) or
//! an existing table named in a `TO` clause. Refreshable views that replace
//! their contents on every refresh populate a second inner table, the
//! *scratch* table, and then move its data into the target in one step.
//!
//! Reads, writes and most DDL statements addressed to the view are forwarded
//! to whichever table currently holds its data.

mod alter;
mod create;
mod descriptor;
mod forward;
mod inner_tables;
mod refresh;
mod rename;

pub use descriptor::ViewDescriptor;
pub use inner_tables::{generate_inner_table_name, InnerTableIds, InnerTables};
pub use refresh::{
    ManualRefresher, ManualRefresherFactory, QueryAnalyzer, Refresher, RefresherEvent,
    RefresherFactory, StaticQueryAnalyzer,
};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::Field;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::ast::{InsertQuery, MutationCommand, OptimizeQuery, PartitionCommand};
use crate::catalog::StorageId;
use crate::config::Settings;
use crate::context::{QueryContext, ServerContext};
use crate::error::{BlazeError, Result};
use crate::plan::{QueryPlan, QueryProcessingStage, SelectQueryInfo};
use crate::storage::{
    ActionBlockType, ActionLock, BackupEntriesCollector, BackupEntry, SinkToStorage, Storage,
    StorageSnapshot, TableExclusiveLockHolder, TableLock, TableLockHolder,
};

/// Engine name materialized views report.
pub const ENGINE_NAME: &str = "MaterializedView";

/// A materialized view.
pub struct MaterializedView {
    table_id: RwLock<StorageId>,
    descriptor: RwLock<Arc<ViewDescriptor>>,
    inner: InnerTables,
    refresher: Option<Arc<dyn Refresher>>,
    refresh_on_start: bool,
    /// Outstanding refresh pauses handed out by `action_lock`
    refresh_pauses: Arc<Mutex<usize>>,
    /// Serializes ALTER statements on this view
    alter_lock: Mutex<()>,
    structure_lock: TableLock,
    /// Context of statements the view issues on its own behalf
    context: QueryContext,
    server: ServerContext,
}

impl MaterializedView {
    pub fn storage_id(&self) -> StorageId {
        self.table_id.read().clone()
    }

    /// Current definition.
    pub fn descriptor(&self) -> Arc<ViewDescriptor> {
        self.descriptor.read().clone()
    }

    pub fn metadata(&self) -> StorageSnapshot {
        Arc::new(self.descriptor().table_metadata())
    }

    pub fn has_inner_target_table(&self) -> bool {
        self.inner.has_inner_target_table()
    }

    pub fn has_scratch_table(&self) -> bool {
        self.inner.has_scratch_table()
    }

    pub fn is_scratch_known_empty(&self) -> bool {
        self.inner.is_scratch_known_empty()
    }

    /// Whether [`MaterializedView::startup`] triggers a refresh.
    pub fn refresh_on_start(&self) -> bool {
        self.refresh_on_start
    }

    pub fn refresher(&self) -> Option<&Arc<dyn Refresher>> {
        self.refresher.as_ref()
    }

    pub fn target_table_id(&self) -> StorageId {
        self.inner.target_table_id()
    }

    pub fn scratch_table_id(&self) -> Option<StorageId> {
        self.inner.scratch_table_id()
    }

    /// Tables created and owned by the view.
    pub fn inner_tables(&self) -> Vec<StorageId> {
        let ids = self.inner.snapshot();
        let mut tables = Vec::with_capacity(2);
        if self.inner.has_inner_target_table() {
            tables.push(ids.target);
        }
        if let Some(scratch) = ids.scratch {
            tables.push(scratch);
        }
        tables
    }

    pub fn target_table(&self) -> Result<Arc<dyn Storage>> {
        self.server
            .catalog
            .get_table(&self.inner.target_table_id(), &self.context)
    }

    pub fn try_target_table(&self) -> Option<Arc<dyn Storage>> {
        self.server
            .catalog
            .try_get_table(&self.inner.target_table_id(), &self.context)
    }

    pub fn scratch_table(&self) -> Result<Arc<dyn Storage>> {
        let scratch_id = self.inner.scratch_table_id().ok_or_else(|| {
            BlazeError::logical(format!(
                "Materialized view {} has no scratch table",
                self.storage_id().name_for_logs()
            ))
        })?;
        self.server.catalog.get_table(&scratch_id, &self.context)
    }

    pub fn try_scratch_table(&self) -> Option<Arc<dyn Storage>> {
        let scratch_id = self.inner.scratch_table_id()?;
        self.server.catalog.try_get_table(&scratch_id, &self.context)
    }

    /// Register the dependency on the source table and start refreshing.
    pub fn startup(&self) -> Result<()> {
        let descriptor = self.descriptor();
        if let Some(source) = descriptor.source_table_id() {
            self.server
                .catalog
                .add_view_dependency(source, &self.storage_id());
        }
        if let Some(refresher) = &self.refresher {
            refresher.initialize_and_start()?;
            if self.refresh_on_start {
                refresher.run();
            }
        }
        Ok(())
    }

    /// Stop refreshing and forget the dependency on the source table.
    pub fn shutdown(&self) {
        if let Some(refresher) = &self.refresher {
            refresher.shutdown();
        }
        let descriptor = self.descriptor();
        if let Some(source) = descriptor.source_table_id() {
            self.server
                .catalog
                .remove_view_dependency(source, &self.storage_id());
        }
    }

    /// Data paths of the target table, then of the scratch table.
    pub fn data_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(target) = self.try_target_table() {
            paths.extend(target.data_paths());
        }
        if let Some(scratch) = self.try_scratch_table() {
            paths.extend(scratch.data_paths());
        }
        paths
    }

    /// Row count of an inner target table. Unknown for `TO` targets.
    pub fn total_rows(&self, settings: &Settings) -> Option<u64> {
        self.inner_target()?.total_rows(settings)
    }

    pub fn total_bytes(&self, settings: &Settings) -> Option<u64> {
        self.inner_target()?.total_bytes(settings)
    }

    pub fn total_bytes_uncompressed(&self, settings: &Settings) -> Option<u64> {
        self.inner_target()?.total_bytes_uncompressed(settings)
    }

    /// Back up the data of an inner target table. Nothing is backed up for
    /// `TO` targets; they are backed up on their own.
    pub fn backup_data(
        &self,
        collector: &mut BackupEntriesCollector,
        data_path_in_backup: &str,
        partitions: Option<&[String]>,
    ) -> Result<()> {
        if !self.inner.has_inner_target_table() {
            return Ok(());
        }
        match self.try_target_table() {
            Some(target) => target.backup_data(collector, data_path_in_backup, partitions),
            None => {
                warn!(
                    view = %self.storage_id().name_for_logs(),
                    "Inner table does not exist, will not backup any data"
                );
                Ok(())
            }
        }
    }

    pub fn restore_data_from_backup(
        &self,
        entries: &[BackupEntry],
        data_path_in_backup: &str,
        partitions: Option<&[String]>,
    ) -> Result<()> {
        if !self.inner.has_inner_target_table() {
            return Ok(());
        }
        self.target_table()?
            .restore_data_from_backup(entries, data_path_in_backup, partitions)
    }

    pub fn supports_backup_partition(&self) -> bool {
        self.inner_target()
            .is_some_and(|target| target.supports_backup_partition())
    }

    pub fn is_remote(&self) -> bool {
        self.try_target_table().is_some_and(|target| target.is_remote())
    }

    pub fn virtual_columns(&self) -> Vec<Field> {
        self.try_target_table()
            .map(|target| target.virtual_columns())
            .unwrap_or_default()
    }

    /// Pause `kind`.
    ///
    /// Pausing refreshes stops the refresher from scheduling new ones. An
    /// inner target table additionally pauses `kind` itself. Pauses nest:
    /// refreshes resume once the last token is released.
    pub fn action_lock(&self, kind: ActionBlockType) -> ActionLock {
        let mut lock = ActionLock::empty();
        if kind == ActionBlockType::ViewRefresh {
            if let Some(refresher) = &self.refresher {
                let view = self.storage_id().name_for_logs();
                {
                    let mut pauses = self.refresh_pauses.lock();
                    *pauses += 1;
                    if *pauses == 1 {
                        refresher.stop();
                        debug!(view = %view, "paused refreshes");
                    }
                }
                let refresher = refresher.clone();
                let pauses = self.refresh_pauses.clone();
                lock = ActionLock::new(move || {
                    let mut pauses = pauses.lock();
                    *pauses = pauses.saturating_sub(1);
                    if *pauses == 0 {
                        refresher.start();
                        debug!(view = %view, "resumed refreshes");
                    }
                });
            }
        }
        if let Some(target) = self.inner_target() {
            lock = lock.merge(target.action_lock(kind));
        }
        lock
    }

    /// Resume refresh scheduling after a pause was lifted, unless another
    /// pause is still held.
    pub fn on_action_lock_remove(&self, kind: ActionBlockType) {
        if kind == ActionBlockType::ViewRefresh && *self.refresh_pauses.lock() == 0 {
            if let Some(refresher) = &self.refresher {
                refresher.start();
            }
        }
    }

    fn inner_target(&self) -> Option<Arc<dyn Storage>> {
        if self.inner.has_inner_target_table() {
            self.try_target_table()
        } else {
            None
        }
    }
}

impl fmt::Debug for MaterializedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedView")
            .field("table_id", &self.storage_id())
            .field("inner", &self.inner)
            .field("refreshable", &self.refresher.is_some())
            .finish_non_exhaustive()
    }
}

impl Storage for MaterializedView {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        MaterializedView::storage_id(self)
    }

    fn rename_in_memory(&self, new_id: &StorageId) -> Result<()> {
        MaterializedView::rename_in_memory(self, new_id)
    }

    fn engine_name(&self) -> &str {
        ENGINE_NAME
    }

    fn startup(&self) -> Result<()> {
        MaterializedView::startup(self)
    }

    fn shutdown(&self) {
        MaterializedView::shutdown(self)
    }

    fn drop_storage(&self) -> Result<()> {
        MaterializedView::drop_storage(self)
    }

    fn metadata(&self) -> StorageSnapshot {
        MaterializedView::metadata(self)
    }

    fn query_processing_stage(
        &self,
        ctx: &QueryContext,
        to_stage: QueryProcessingStage,
        _snapshot: &StorageSnapshot,
        query_info: &SelectQueryInfo,
    ) -> Result<QueryProcessingStage> {
        MaterializedView::query_processing_stage(self, ctx, to_stage, query_info)
    }

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
    ) -> Result<()> {
        MaterializedView::read(
            self,
            plan,
            column_names,
            snapshot,
            query_info,
            ctx,
            processed_stage,
            max_block_size,
            num_streams,
        )
    }

    fn write(
        &self,
        query: &InsertQuery,
        _snapshot: &StorageSnapshot,
        ctx: &QueryContext,
    ) -> Result<SinkToStorage> {
        MaterializedView::write(self, query, ctx)
    }

    fn lock_for_share(&self, query_id: &str, timeout: Duration) -> Result<TableLockHolder> {
        self.structure_lock
            .lock_for_share(&self.storage_id().full_table_name(), query_id, timeout)
    }

    fn lock_exclusively(
        &self,
        query_id: &str,
        timeout: Duration,
    ) -> Result<TableExclusiveLockHolder> {
        self.structure_lock
            .lock_exclusively(&self.storage_id().full_table_name(), query_id, timeout)
    }

    fn truncate(
        &self,
        _snapshot: &StorageSnapshot,
        ctx: &QueryContext,
        _lock: &TableExclusiveLockHolder,
    ) -> Result<()> {
        MaterializedView::truncate(self, ctx)
    }

    fn optimize(
        &self,
        query: &OptimizeQuery,
        _snapshot: &StorageSnapshot,
        ctx: &QueryContext,
    ) -> Result<bool> {
        MaterializedView::optimize(self, query, ctx)
    }

    fn check_mutation_is_possible(
        &self,
        commands: &[MutationCommand],
        settings: &Settings,
    ) -> Result<()> {
        MaterializedView::check_mutation_is_possible(self, commands, settings)
    }

    fn mutate(&self, commands: &[MutationCommand], ctx: &QueryContext) -> Result<()> {
        MaterializedView::mutate(self, commands, ctx)
    }

    fn check_alter_partition_is_possible(
        &self,
        commands: &[PartitionCommand],
        _snapshot: &StorageSnapshot,
        settings: &Settings,
    ) -> Result<()> {
        MaterializedView::check_alter_partition_is_possible(self, commands, settings)
    }

    fn alter_partition(
        &self,
        _snapshot: &StorageSnapshot,
        commands: &[PartitionCommand],
        ctx: &QueryContext,
    ) -> Result<()> {
        MaterializedView::alter_partition(self, commands, ctx)
    }

    fn data_paths(&self) -> Vec<String> {
        MaterializedView::data_paths(self)
    }

    fn total_rows(&self, settings: &Settings) -> Option<u64> {
        MaterializedView::total_rows(self, settings)
    }

    fn total_bytes(&self, settings: &Settings) -> Option<u64> {
        MaterializedView::total_bytes(self, settings)
    }

    fn total_bytes_uncompressed(&self, settings: &Settings) -> Option<u64> {
        MaterializedView::total_bytes_uncompressed(self, settings)
    }

    fn backup_data(
        &self,
        collector: &mut BackupEntriesCollector,
        data_path_in_backup: &str,
        partitions: Option<&[String]>,
    ) -> Result<()> {
        MaterializedView::backup_data(self, collector, data_path_in_backup, partitions)
    }

    fn restore_data_from_backup(
        &self,
        entries: &[BackupEntry],
        data_path_in_backup: &str,
        partitions: Option<&[String]>,
    ) -> Result<()> {
        MaterializedView::restore_data_from_backup(self, entries, data_path_in_backup, partitions)
    }

    fn supports_backup_partition(&self) -> bool {
        MaterializedView::supports_backup_partition(self)
    }

    fn action_lock(&self, kind: ActionBlockType) -> ActionLock {
        MaterializedView::action_lock(self, kind)
    }

    fn is_remote(&self) -> bool {
        MaterializedView::is_remote(self)
    }

    fn virtual_columns(&self) -> Vec<Field> {
        MaterializedView::virtual_columns(self)
    }
}
