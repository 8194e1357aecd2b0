//! In-process catalog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DatabaseCatalog, DropKind, DropRequest, QualifiedTableName, StorageId};
use crate::ast::{CreateQuery, RenameQuery, TableKind};
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};
use crate::materialized::ViewDescriptor;
use crate::storage::{Storage, StorageCreateArgs, StorageFactory};

#[derive(Clone)]
struct CatalogEntry {
    id: StorageId,
    query: CreateQuery,
    /// `None` for objects known by definition only (dictionaries, plain views)
    storage: Option<Arc<dyn Storage>>,
}

#[derive(Default)]
struct CatalogState {
    tables: BTreeMap<QualifiedTableName, CatalogEntry>,
    by_uuid: HashMap<Uuid, QualifiedTableName>,
}

impl CatalogState {
    fn resolve(&self, id: &StorageId) -> Option<&CatalogEntry> {
        match id.uuid.and_then(|uuid| self.by_uuid.get(&uuid)) {
            Some(name) => self.tables.get(name),
            None => self.tables.get(&id.qualified_name()),
        }
    }

    fn insert(&mut self, entry: CatalogEntry) {
        let name = entry.id.qualified_name();
        if let Some(uuid) = entry.id.uuid {
            self.by_uuid.insert(uuid, name.clone());
        }
        self.tables.insert(name, entry);
    }

    fn remove(&mut self, id: &StorageId) -> Option<CatalogEntry> {
        let name = self.resolve(id)?.id.qualified_name();
        let entry = self.tables.remove(&name)?;
        if let Some(uuid) = entry.id.uuid {
            self.by_uuid.remove(&uuid);
        }
        Some(entry)
    }

    fn check_free(&self, id: &StorageId) -> Result<()> {
        let name_taken = self.tables.contains_key(&id.qualified_name());
        let uuid_taken = id.uuid.is_some_and(|uuid| self.by_uuid.contains_key(&uuid));
        if name_taken || uuid_taken {
            return Err(BlazeError::table_already_exists(id.name_for_logs()));
        }
        Ok(())
    }
}

/// A catalog keeping every table in process memory.
///
/// Tables are instantiated through a [`StorageFactory`]. Views and other
/// storages built outside the factory are registered with
/// [`MemoryCatalog::attach_table`]. Every DROP and RENAME request is kept in
/// a log for inspection.
pub struct MemoryCatalog {
    storage_factory: Arc<StorageFactory>,
    state: RwLock<CatalogState>,
    /// `(source, view)` edges
    dependencies: Mutex<Vec<(StorageId, StorageId)>>,
    views: Mutex<BTreeMap<QualifiedTableName, ViewDescriptor>>,
    drop_log: Mutex<Vec<DropRequest>>,
    rename_log: Mutex<Vec<RenameQuery>>,
}

impl MemoryCatalog {
    pub fn new(storage_factory: Arc<StorageFactory>) -> Self {
        Self {
            storage_factory,
            state: RwLock::new(CatalogState::default()),
            dependencies: Mutex::new(Vec::new()),
            views: Mutex::new(BTreeMap::new()),
            drop_log: Mutex::new(Vec::new()),
            rename_log: Mutex::new(Vec::new()),
        }
    }

    pub fn storage_factory(&self) -> &Arc<StorageFactory> {
        &self.storage_factory
    }

    /// Register a storage built by the caller under the identity of `query`.
    pub fn attach_table(&self, query: CreateQuery, storage: Arc<dyn Storage>) -> Result<()> {
        let id = storage.storage_id();
        let mut state = self.state.write();
        state.check_free(&id)?;
        state.insert(CatalogEntry {
            id,
            query,
            storage: Some(storage),
        });
        Ok(())
    }

    /// Whether a table with this identity is registered.
    pub fn exists(&self, id: &StorageId) -> bool {
        self.state.read().resolve(id).is_some()
    }

    /// Current identity of the table registered as `id`.
    pub fn resolve_id(&self, id: &StorageId) -> Option<StorageId> {
        self.state.read().resolve(id).map(|e| e.id.clone())
    }

    /// All registered qualified names, sorted.
    pub fn table_names(&self) -> Vec<QualifiedTableName> {
        self.state.read().tables.keys().cloned().collect()
    }

    pub fn drop_log(&self) -> Vec<DropRequest> {
        self.drop_log.lock().clone()
    }

    pub fn rename_log(&self) -> Vec<RenameQuery> {
        self.rename_log.lock().clone()
    }

    /// Descriptor last persisted for a view by ALTER.
    pub fn persisted_view(&self, id: &StorageId) -> Option<ViewDescriptor> {
        self.views.lock().get(&id.qualified_name()).cloned()
    }

    /// Every `(source, view)` dependency edge.
    pub fn dependencies(&self) -> Vec<(StorageId, StorageId)> {
        self.dependencies.lock().clone()
    }

    fn entry(&self, id: &StorageId) -> Result<CatalogEntry> {
        self.state
            .read()
            .resolve(id)
            .cloned()
            .ok_or_else(|| BlazeError::table_not_found(id.name_for_logs()))
    }
}

impl DatabaseCatalog for MemoryCatalog {
    fn get_table(&self, id: &StorageId, _ctx: &QueryContext) -> Result<Arc<dyn Storage>> {
        let entry = self.entry(id)?;
        entry.storage.ok_or_else(|| {
            BlazeError::catalog(format!(
                "{} is a {:?}, not a table",
                entry.id.name_for_logs(),
                entry.query.kind
            ))
        })
    }

    fn try_get_table(&self, id: &StorageId, _ctx: &QueryContext) -> Option<Arc<dyn Storage>> {
        self.state.read().resolve(id).and_then(|e| e.storage.clone())
    }

    fn get_create_table_query(&self, id: &StorageId, _ctx: &QueryContext) -> Result<CreateQuery> {
        let entry = self.entry(id)?;
        let mut query = entry.query;
        query.set_table_id(&entry.id);
        Ok(query)
    }

    fn create_table(&self, mut query: CreateQuery, _ctx: &QueryContext) -> Result<()> {
        if query.uuid.is_none() {
            query.uuid = Some(Uuid::new_v4());
        }
        let id = query.storage_id();
        self.state.read().check_free(&id)?;

        let storage = match query.kind {
            TableKind::Table => Some(self.storage_factory.create(&StorageCreateArgs {
                table_id: id.clone(),
                query: &query,
            })?),
            TableKind::MaterializedView => {
                return Err(BlazeError::not_implemented(
                    "Creating materialized views through the catalog, attach them instead",
                ))
            }
            _ => None,
        };

        let mut state = self.state.write();
        state.check_free(&id)?;
        debug!(table = %id.name_for_logs(), kind = ?query.kind, "created table");
        state.insert(CatalogEntry { id, query, storage });
        Ok(())
    }

    fn drop_table(&self, request: DropRequest, ctx: &QueryContext) -> Result<()> {
        self.drop_log.lock().push(request.clone());
        match request.kind {
            DropKind::Truncate => {
                let storage = self.get_table(&request.table_id, ctx)?;
                let lock = storage
                    .lock_exclusively(ctx.query_id(), ctx.settings().lock_acquire_timeout)?;
                storage.truncate(&storage.metadata(), ctx, &lock)
            }
            DropKind::Drop | DropKind::Detach => {
                let entry = self
                    .state
                    .write()
                    .remove(&request.table_id)
                    .ok_or_else(|| BlazeError::table_not_found(request.table_id.name_for_logs()))?;
                self.views.lock().remove(&entry.id.qualified_name());
                debug!(table = %entry.id.name_for_logs(), kind = ?request.kind, "removed table");

                // The state lock is released here: dropping a view re-enters
                // the catalog to drop its inner tables.
                if let Some(storage) = entry.storage {
                    storage.shutdown();
                    if request.kind == DropKind::Drop {
                        storage.drop_storage()?;
                    }
                }
                Ok(())
            }
        }
    }

    fn rename_tables(&self, query: &RenameQuery, _ctx: &QueryContext) -> Result<()> {
        let mut renames = Vec::with_capacity(query.elements.len());
        {
            let state = self.state.read();
            let mut targets = Vec::new();
            for element in &query.elements {
                let from = StorageId::new(&element.from_database, &element.from_table);
                let entry = state
                    .resolve(&from)
                    .ok_or_else(|| BlazeError::table_not_found(from.name_for_logs()))?;
                let to = QualifiedTableName::new(&element.to_database, &element.to_table);
                if state.tables.contains_key(&to) || targets.contains(&to) {
                    return Err(BlazeError::table_already_exists(to.to_string()));
                }
                targets.push(to);

                let mut new_id = StorageId::new(&element.to_database, &element.to_table);
                new_id.uuid = entry.id.uuid;
                renames.push((entry.clone(), new_id));
            }
        }

        // Storages are told first; views rename their own inner tables from
        // inside rename_in_memory.
        for (done, (entry, new_id)) in renames.iter().enumerate() {
            let Some(storage) = &entry.storage else {
                continue;
            };
            if let Err(err) = storage.rename_in_memory(new_id) {
                for (entry, _) in renames[..done].iter().rev() {
                    if let Some(storage) = &entry.storage {
                        if let Err(revert_err) = storage.rename_in_memory(&entry.id) {
                            warn!(
                                table = %entry.id.name_for_logs(),
                                error = %revert_err,
                                "failed to revert rename"
                            );
                        }
                    }
                }
                return Err(err);
            }
        }

        {
            let mut state = self.state.write();
            for (entry, new_id) in &renames {
                if let Some(mut moved) = state.remove(&entry.id) {
                    moved.query.set_table_id(new_id);
                    moved.id = new_id.clone();
                    state.insert(moved);
                }
            }
        }
        let mut views = self.views.lock();
        for (entry, new_id) in &renames {
            if let Some(descriptor) = views.remove(&entry.id.qualified_name()) {
                views.insert(new_id.qualified_name(), descriptor);
            }
        }
        drop(views);

        debug!(elements = query.elements.len(), "renamed tables");
        self.rename_log.lock().push(query.clone());
        Ok(())
    }

    fn alter_view(
        &self,
        id: &StorageId,
        descriptor: &ViewDescriptor,
        _ctx: &QueryContext,
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            let name = state
                .resolve(id)
                .map(|e| e.id.qualified_name())
                .ok_or_else(|| BlazeError::table_not_found(id.name_for_logs()))?;
            if let Some(entry) = state.tables.get_mut(&name) {
                entry.query.columns = descriptor.columns.clone();
                entry.query.select = Some(descriptor.select.clone());
                entry.query.refresh_strategy = descriptor.refresh.clone();
                entry.query.comment = descriptor.comment.clone();
            }
        }
        self.views
            .lock()
            .insert(id.qualified_name(), descriptor.clone());
        Ok(())
    }

    fn dependent_views(&self, source: &StorageId) -> Vec<StorageId> {
        self.dependencies
            .lock()
            .iter()
            .filter(|(from, _)| from.refers_to(source))
            .map(|(_, view)| view.clone())
            .collect()
    }

    fn add_view_dependency(&self, source: &StorageId, view: &StorageId) {
        let mut dependencies = self.dependencies.lock();
        let known = dependencies
            .iter()
            .any(|(from, to)| from.refers_to(source) && to.refers_to(view));
        if !known {
            dependencies.push((source.clone(), view.clone()));
        }
    }

    fn remove_view_dependency(&self, source: &StorageId, view: &StorageId) {
        self.dependencies
            .lock()
            .retain(|(from, to)| !(from.refers_to(source) && to.refers_to(view)));
    }
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("tables", &self.table_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StorageClause;
    use arrow::datatypes::{DataType, Field, Schema};

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new(Arc::new(StorageFactory::with_memory_engine()))
    }

    fn create(catalog: &MemoryCatalog, table: &str) -> StorageId {
        let columns = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let query = CreateQuery::table("db", table, columns, StorageClause::new("Memory"));
        catalog.create_table(query, &QueryContext::new()).unwrap();
        StorageId::new("db", table)
    }

    #[test]
    fn test_create_assigns_uuid() {
        let catalog = catalog();
        let id = create(&catalog, "t");
        let table = catalog.get_table(&id, &QueryContext::new()).unwrap();
        assert!(table.storage_id().has_uuid());
        assert_eq!(table.engine_name(), "Memory");
    }

    #[test]
    fn test_create_duplicate_fails() {
        let catalog = catalog();
        create(&catalog, "t");
        let columns = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let query = CreateQuery::table("db", "t", columns, StorageClause::new("Memory"));
        let err = catalog.create_table(query, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, BlazeError::TableAlreadyExists { .. }));
    }

    #[test]
    fn test_unknown_engine() {
        let catalog = catalog();
        let columns = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let query = CreateQuery::table("db", "t", columns, StorageClause::new("Nope"));
        let err = catalog.create_table(query, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, BlazeError::UnknownStorage { .. }));
        assert!(!catalog.exists(&StorageId::new("db", "t")));
    }

    #[test]
    fn test_lookup_by_uuid_survives_rename() {
        let catalog = catalog();
        let ctx = QueryContext::new();
        let id = create(&catalog, "t");
        let uuid_id = catalog.get_table(&id, &ctx).unwrap().storage_id();

        let mut rename = RenameQuery::default();
        rename.add_element("db", "t", "db2", "t2");
        catalog.rename_tables(&rename, &ctx).unwrap();

        let table = catalog.get_table(&uuid_id, &ctx).unwrap();
        assert_eq!(table.storage_id().full_table_name(), "db2.t2");
        assert!(!catalog.exists(&StorageId::new("db", "t")));
        assert_eq!(catalog.rename_log().len(), 1);
    }

    #[test]
    fn test_batched_rename_is_all_or_nothing() {
        let catalog = catalog();
        let ctx = QueryContext::new();
        create(&catalog, "a");
        create(&catalog, "b");

        let mut rename = RenameQuery::default();
        rename.add_element("db", "a", "db", "c");
        rename.add_element("db", "missing", "db", "d");
        assert!(catalog.rename_tables(&rename, &ctx).is_err());
        assert!(catalog.exists(&StorageId::new("db", "a")));
        assert!(!catalog.exists(&StorageId::new("db", "c")));
        assert!(catalog.rename_log().is_empty());
    }

    #[test]
    fn test_drop_and_truncate() {
        let catalog = catalog();
        let ctx = QueryContext::new();
        let id = create(&catalog, "t");

        catalog
            .drop_table(DropRequest::new(DropKind::Truncate, id.clone()).with_sync(true), &ctx)
            .unwrap();
        assert!(catalog.exists(&id));

        catalog
            .drop_table(DropRequest::new(DropKind::Drop, id.clone()), &ctx)
            .unwrap();
        assert!(!catalog.exists(&id));
        let log = catalog.drop_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, DropKind::Truncate);
        assert!(log[0].sync);
    }

    #[test]
    fn test_definition_only_objects() {
        let catalog = catalog();
        let ctx = QueryContext::new();
        let query = CreateQuery::object("db", "dict", TableKind::Dictionary);
        catalog.create_table(query, &ctx).unwrap();

        let id = StorageId::new("db", "dict");
        assert!(catalog.try_get_table(&id, &ctx).is_none());
        let stored = catalog.get_create_table_query(&id, &ctx).unwrap();
        assert_eq!(stored.kind, TableKind::Dictionary);
    }

    #[test]
    fn test_dependency_edges() {
        let catalog = catalog();
        let source = StorageId::new("db", "src");
        let view = StorageId::new("db", "mv");
        catalog.add_view_dependency(&source, &view);
        catalog.add_view_dependency(&source, &view);
        assert_eq!(catalog.dependent_views(&source), vec![view.clone()]);

        let renamed = StorageId::new("db", "mv2");
        catalog.update_view_dependency(Some(&source), &view, Some(&source), &renamed);
        assert_eq!(catalog.dependent_views(&source), vec![renamed.clone()]);

        catalog.remove_view_dependency(&source, &renamed);
        assert!(catalog.dependent_views(&source).is_empty());
    }
}
