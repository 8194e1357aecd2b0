//! Catalog collaborator for materialized views.
//!
//! The catalog resolves tables by identity, executes the CREATE/DROP/RENAME
//! statements a view issues for its inner tables, persists view metadata and
//! keeps the edge list recording which views read from which source tables.

mod memory;
mod storage_id;

use std::sync::Arc;

pub use memory::MemoryCatalog;
pub use storage_id::{QualifiedTableName, StorageId};

use crate::ast::{CreateQuery, RenameQuery};
use crate::context::QueryContext;
use crate::error::Result;
use crate::materialized::ViewDescriptor;
use crate::storage::Storage;

/// What a DROP request does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    /// Remove the table and its data
    Drop,
    /// Forget the table, keep its data
    Detach,
    /// Remove all rows, keep the table
    Truncate,
}

/// A DROP/DETACH/TRUNCATE request for a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropRequest {
    pub kind: DropKind,
    pub table_id: StorageId,
    /// Wait until the table data is actually removed
    pub sync: bool,
    /// Use `sync` as given instead of the database default
    pub ignore_sync_setting: bool,
    /// The request may take the DDL guard of `table_id`
    pub may_lock_ddl_guard: bool,
}

impl DropRequest {
    pub fn new(kind: DropKind, table_id: StorageId) -> Self {
        Self {
            kind,
            table_id,
            sync: false,
            ignore_sync_setting: false,
            may_lock_ddl_guard: false,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_ignore_sync_setting(mut self, ignore: bool) -> Self {
        self.ignore_sync_setting = ignore;
        self
    }

    pub fn with_ddl_guard(mut self, may_lock: bool) -> Self {
        self.may_lock_ddl_guard = may_lock;
        self
    }
}

/// DDL guards are always taken in ascending order of qualified name. A
/// statement that already holds the guard of `holder` may additionally take
/// the guard of `other` only if `holder` sorts first.
pub fn may_lock_ddl_guard(holder: &StorageId, other: &StorageId) -> bool {
    holder.qualified_name() < other.qualified_name()
}

/// Catalog service used by materialized views.
pub trait DatabaseCatalog: Send + Sync {
    /// Resolve a table, failing if it does not exist.
    fn get_table(&self, id: &StorageId, ctx: &QueryContext) -> Result<Arc<dyn Storage>>;

    /// Resolve a table if it exists.
    fn try_get_table(&self, id: &StorageId, ctx: &QueryContext) -> Option<Arc<dyn Storage>>;

    /// The CREATE statement a table was defined with.
    fn get_create_table_query(&self, id: &StorageId, ctx: &QueryContext) -> Result<CreateQuery>;

    /// Execute an internal CREATE statement.
    fn create_table(&self, query: CreateQuery, ctx: &QueryContext) -> Result<()>;

    /// Execute a DROP/DETACH/TRUNCATE request.
    fn drop_table(&self, request: DropRequest, ctx: &QueryContext) -> Result<()>;

    /// Execute a batched RENAME; either every element applies or none does.
    fn rename_tables(&self, query: &RenameQuery, ctx: &QueryContext) -> Result<()>;

    /// Persist new metadata of a view through its database.
    fn alter_view(&self, id: &StorageId, descriptor: &ViewDescriptor, ctx: &QueryContext)
        -> Result<()>;

    /// Views currently reading from `source`.
    fn dependent_views(&self, source: &StorageId) -> Vec<StorageId>;

    fn add_view_dependency(&self, source: &StorageId, view: &StorageId);

    fn remove_view_dependency(&self, source: &StorageId, view: &StorageId);

    /// Replace the `old_source -> old_view` edge with `new_source -> new_view`.
    /// A missing source means the view reads from no single table.
    fn update_view_dependency(
        &self,
        old_source: Option<&StorageId>,
        old_view: &StorageId,
        new_source: Option<&StorageId>,
        new_view: &StorageId,
    ) {
        if let Some(source) = old_source {
            self.remove_view_dependency(source, old_view);
        }
        if let Some(source) = new_source {
            self.add_view_dependency(source, new_view);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_guard_order() {
        let view = StorageId::new("db", "a_view");
        let inner = StorageId::new("db", ".inner.a_view");
        assert!(!may_lock_ddl_guard(&view, &inner));
        assert!(may_lock_ddl_guard(&inner, &view));

        let other_db = StorageId::new("zz", ".inner.a_view");
        assert!(may_lock_ddl_guard(&view, &other_db));
    }

    #[test]
    fn test_drop_request_builder() {
        let request = DropRequest::new(DropKind::Drop, StorageId::new("db", "t"))
            .with_sync(true)
            .with_ddl_guard(true);
        assert!(request.sync);
        assert!(!request.ignore_sync_setting);
        assert!(request.may_lock_ddl_guard);
    }
}
