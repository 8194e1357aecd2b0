//! Creating a materialized view and its inner tables.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{generate_inner_table_name, InnerTableIds, InnerTables, MaterializedView, ViewDescriptor};
use crate::ast::{CreateQuery, TableKind};
use crate::catalog::{may_lock_ddl_guard, DatabaseCatalog, DropKind, DropRequest, StorageId};
use crate::context::{QueryContext, ServerContext};
use crate::error::{BlazeError, Result};
use crate::storage::{StorageFactory, TableLock};

impl MaterializedView {
    /// Create a view from its CREATE statement.
    ///
    /// Unless `attach` is set, the inner tables the view needs are created
    /// too, target first. Creation is all or nothing: if any inner table
    /// cannot be created, the ones already created are dropped again and the
    /// original error is returned.
    pub fn create(
        table_id: StorageId,
        query: &CreateQuery,
        attach: bool,
        ctx: &QueryContext,
        server: ServerContext,
    ) -> Result<Arc<Self>> {
        if query.kind != TableKind::MaterializedView {
            return Err(BlazeError::logical(format!(
                "Expected CREATE MATERIALIZED VIEW, got CREATE {:?}",
                query.kind
            )));
        }
        let descriptor = ViewDescriptor::from_create_query(query)?;

        let has_inner_target_table = query.needs_inner_target_table();
        if has_inner_target_table && query.storage.is_none() {
            return Err(BlazeError::incorrect_query(
                "You must specify where to save results of a MaterializedView query: \
                 either ENGINE or an existing table in a TO clause",
            ));
        }
        let has_scratch_table = query.needs_scratch_table();

        if let Some(source) = descriptor.source_table_id() {
            check_dependent_views_limit(&server, source)?;
        }

        let points_to_itself_by_uuid = query
            .to_inner_uuids
            .iter()
            .any(|uuid| table_id.uuid == Some(*uuid));
        let points_to_itself_by_name = query.to_table_id.as_ref().is_some_and(|to| {
            to.database == table_id.database && to.table == table_id.table
        });
        if points_to_itself_by_uuid || points_to_itself_by_name {
            return Err(BlazeError::bad_arguments(format!(
                "Materialized view {} cannot point to itself",
                table_id.full_table_name()
            )));
        }

        let mut target_id = match &query.to_table_id {
            Some(to) => to.clone(),
            None => StorageId::new(
                &table_id.database,
                generate_inner_table_name(&table_id, false),
            ),
        };
        let mut scratch_id = has_scratch_table.then(|| {
            StorageId::new(&table_id.database, generate_inner_table_name(&table_id, true))
        });

        if !query.to_inner_uuids.is_empty() {
            let needed = query.needs_inner_tables();
            if query.to_inner_uuids.len() != needed {
                return Err(BlazeError::incorrect_query(format!(
                    "Materialized view needs {} inner tables, but TO INNER UUID contains {} uuids",
                    needed,
                    query.to_inner_uuids.len()
                )));
            }
            if has_inner_target_table {
                target_id.uuid = query.to_inner_uuids.first().copied();
            }
            if let Some(scratch) = scratch_id.as_mut() {
                scratch.uuid = query.to_inner_uuids.last().copied();
            }
        }

        let mut target_create = None;
        let mut scratch_create = None;
        if !attach {
            if let Some(storage) = query.storage.as_ref().filter(|_| has_inner_target_table) {
                target_create = Some(CreateQuery::table(
                    &target_id.database,
                    &target_id.table,
                    query.columns.clone(),
                    storage.clone(),
                ));
            }
            if has_scratch_table {
                // The scratch table must be interchangeable with the target.
                let template = match &target_create {
                    Some(target_create) => target_create.clone(),
                    None => server.catalog.get_create_table_query(&target_id, ctx)?,
                };
                check_scratch_table_query(&server.storage_factory, &template)?;
                scratch_create = Some(template);
            }
        }

        let mut provisioning = Provisioning::new(server.catalog.as_ref(), ctx, &table_id);
        let created = provisioning
            .create(target_create, &mut target_id)
            .and_then(|_| match scratch_id.as_mut() {
                Some(scratch_id) => provisioning.create(scratch_create, scratch_id),
                None => Ok(()),
            });
        if let Err(err) = created {
            provisioning.unwind();
            return Err(err);
        }

        let scratch_freshly_created = !attach && has_scratch_table;
        let inner = InnerTables::new(
            InnerTableIds {
                target: target_id,
                scratch: scratch_id,
            },
            has_inner_target_table,
            scratch_freshly_created,
        );
        let refresh_on_start =
            query.refresh_strategy.is_some() && !attach && !query.is_create_empty;
        let context = ctx.clone();

        Ok(Arc::new_cyclic(|view| {
            let refresher = query
                .refresh_strategy
                .as_ref()
                .map(|strategy| server.refreshers.create(view.clone(), &table_id, strategy));
            MaterializedView {
                table_id: RwLock::new(table_id),
                descriptor: RwLock::new(Arc::new(descriptor)),
                inner,
                refresher,
                refresh_on_start,
                refresh_pauses: Arc::new(Mutex::new(0)),
                alter_lock: Mutex::new(()),
                structure_lock: TableLock::new(),
                context,
                server,
            }
        }))
    }
}

fn check_dependent_views_limit(server: &ServerContext, source: &StorageId) -> Result<()> {
    let limit = server.server_settings.max_materialized_views_count_for_table;
    if limit > 0 && server.catalog.dependent_views(source).len() >= limit {
        return Err(BlazeError::too_many_materialized_views(format!(
            "Too many materialized views, maximum: {}",
            limit
        )));
    }
    Ok(())
}

/// A table can serve as a scratch table if it is a regular table of an
/// engine that can hand all its data over to another table, and is neither
/// partitioned nor replicated.
fn check_scratch_table_query(factory: &StorageFactory, query: &CreateQuery) -> Result<()> {
    if !query.kind.is_regular_table() {
        return Err(BlazeError::bad_arguments(
            "Materialized view can only write to a regular table, not dictionary or view",
        ));
    }
    let storage = query
        .storage
        .as_ref()
        .filter(|s| !s.engine.is_empty())
        .ok_or_else(|| BlazeError::logical("Target table create query missing ENGINE"))?;
    let features = factory.try_get_features(&storage.engine).ok_or_else(|| {
        BlazeError::unknown_storage(format!(
            "Unknown engine for target table: {}",
            storage.engine
        ))
    })?;

    if !features.supports_moving_data_between_tables {
        let supported =
            factory.registered_names_matching(|f| f.supports_moving_data_between_tables);
        return Err(BlazeError::not_implemented(format!(
            "Engine {} doesn't support moving data between tables as required by refreshable \
             materialized view (without APPEND). Only the following engines support it: {}",
            storage.engine,
            supported.join(", ")
        )));
    }
    if storage.partition_by.is_some() {
        return Err(BlazeError::not_implemented(
            "Refreshable materialized views (without APPEND) don't support partitioned tables.",
        ));
    }
    if features.supports_replication {
        return Err(BlazeError::not_implemented(
            "Refreshable materialized views (without APPEND) don't support replicated tables yet.",
        ));
    }
    Ok(())
}

/// Inner tables created so far for one view, with the compensating drops
/// needed to undo them.
struct Provisioning<'a> {
    catalog: &'a dyn DatabaseCatalog,
    ctx: &'a QueryContext,
    view_id: &'a StorageId,
    created: Vec<StorageId>,
}

impl<'a> Provisioning<'a> {
    fn new(catalog: &'a dyn DatabaseCatalog, ctx: &'a QueryContext, view_id: &'a StorageId) -> Self {
        Self {
            catalog,
            ctx,
            view_id,
            created: Vec::new(),
        }
    }

    /// Execute `query` for the table named `id`, then replace `id` with the
    /// identity the catalog assigned.
    fn create(&mut self, query: Option<CreateQuery>, id: &mut StorageId) -> Result<()> {
        let Some(mut query) = query else {
            return Ok(());
        };
        query.set_table_id(id);
        self.catalog.create_table(query, self.ctx)?;
        *id = self.catalog.get_table(id, self.ctx)?.storage_id();
        info!(
            view = %self.view_id.name_for_logs(),
            table = %id.name_for_logs(),
            "created inner table"
        );
        self.created.push(id.clone());
        Ok(())
    }

    /// Drop every created table, most recent first. Failures are logged.
    fn unwind(self) {
        for id in self.created.iter().rev() {
            let request = DropRequest::new(DropKind::Drop, id.clone())
                .with_sync(false)
                .with_ignore_sync_setting(true)
                .with_ddl_guard(may_lock_ddl_guard(self.view_id, id));
            match self.catalog.drop_table(request, self.ctx) {
                Ok(()) => debug!(table = %id.name_for_logs(), "dropped inner table after failed create"),
                Err(err) => warn!(
                    view = %self.view_id.name_for_logs(),
                    table = %id.name_for_logs(),
                    error = %err,
                    "Failed to un-create inner table"
                ),
            }
        }
    }
}
