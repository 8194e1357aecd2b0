//! Keeping inner tables in step with renames and drops of their view.

use tracing::{debug, info, warn};

use super::{generate_inner_table_name, MaterializedView};
use crate::ast::RenameQuery;
use crate::catalog::{may_lock_ddl_guard, DropKind, DropRequest, StorageId};
use crate::context::QueryContext;
use crate::error::Result;

impl MaterializedView {
    /// Take on a new identity.
    ///
    /// Inner tables of a view with a stable identity are named after that
    /// identity, so they only move when the database changes. Otherwise they
    /// are renamed after the view, in a single RENAME statement.
    pub fn rename_in_memory(&self, new_id: &StorageId) -> Result<()> {
        let old_id = self.storage_id();
        let rename_inner_tables = new_id.database != old_id.database
            || !old_id.has_uuid()
            || !new_id.has_uuid();

        if rename_inner_tables {
            let ids = self.inner.snapshot();
            let mut rename = RenameQuery::default();
            let mut new_target_name = None;
            let mut new_scratch_name = None;

            if self.inner.has_inner_target_table() && self.try_target_table().is_some() {
                let name = generate_inner_table_name(new_id, false);
                if ids.target.database != new_id.database || ids.target.table != name {
                    rename.add_element(
                        &ids.target.database,
                        &ids.target.table,
                        &new_id.database,
                        &name,
                    );
                }
                new_target_name = Some(name);
            }
            if let Some(scratch) = &ids.scratch {
                let name = generate_inner_table_name(new_id, true);
                if scratch.database != new_id.database || scratch.table != name {
                    rename.add_element(&scratch.database, &scratch.table, &new_id.database, &name);
                }
                new_scratch_name = Some(name);
            }

            if !rename.is_empty() {
                self.server.catalog.rename_tables(&rename, &self.context)?;
                info!(
                    view = %old_id.name_for_logs(),
                    new_name = %new_id,
                    tables = rename.elements.len(),
                    "renamed inner tables"
                );
            }

            self.inner.update(|ids| {
                if let Some(name) = new_target_name {
                    ids.target.database = new_id.database.clone();
                    ids.target.table = name;
                }
                if let (Some(scratch), Some(name)) = (ids.scratch.as_mut(), new_scratch_name) {
                    scratch.database = new_id.database.clone();
                    scratch.table = name;
                }
            });
        }

        *self.table_id.write() = new_id.clone();

        let descriptor = self.descriptor();
        let source = descriptor.source_table_id();
        self.server
            .catalog
            .update_view_dependency(source, &old_id, source, new_id);

        if let Some(refresher) = &self.refresher {
            refresher.rename(new_id);
        }
        Ok(())
    }

    /// The view is being dropped: forget its dependency, then drop the inner
    /// tables.
    ///
    /// This may run from the catalog's background drop task, so the inner
    /// tables are never dropped synchronously here.
    pub fn drop_storage(&self) -> Result<()> {
        let table_id = self.storage_id();
        let descriptor = self.descriptor();
        if let Some(source) = descriptor.source_table_id() {
            self.server.catalog.remove_view_dependency(source, &table_id);
        }
        self.drop_inner_table_if_any(false, &self.context)
    }

    /// Drop the inner tables that still exist.
    ///
    /// A failed drop does not stop the others from being attempted. The
    /// first error is returned once all were tried.
    pub fn drop_inner_table_if_any(&self, sync: bool, ctx: &QueryContext) -> Result<()> {
        let view_id = self.storage_id();
        let ids = self.inner.snapshot();
        let owned = self
            .inner
            .has_inner_target_table()
            .then_some(ids.target)
            .into_iter()
            .chain(ids.scratch);

        let mut first_error = None;
        for inner_id in owned {
            if self.server.catalog.try_get_table(&inner_id, ctx).is_none() {
                continue;
            }
            let request = DropRequest::new(DropKind::Drop, inner_id.clone())
                .with_sync(sync)
                .with_ignore_sync_setting(true)
                .with_ddl_guard(may_lock_ddl_guard(&view_id, &inner_id));
            match self.server.catalog.drop_table(request, ctx) {
                Ok(()) => debug!(view = %view_id.name_for_logs(), table = %inner_id.name_for_logs(), "dropped inner table"),
                Err(err) => {
                    warn!(
                        view = %view_id.name_for_logs(),
                        table = %inner_id.name_for_logs(),
                        error = %err,
                        "Failed to drop inner table"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
