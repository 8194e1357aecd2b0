//! Blaze materialized views.
//!
//! This crate manages the lifecycle of materialized views: creating the
//! tables a view stores its rows in, forwarding reads, writes and DDL to
//! them, refreshing refreshable views by populating a scratch table and
//! swapping its contents into the target, and keeping everything consistent
//! across renames and drops.
//!
//! The surrounding engine plugs in through a few traits:
//! [`DatabaseCatalog`](catalog::DatabaseCatalog) resolves and manages tables,
//! [`Storage`](storage::Storage) is a table engine,
//! [`QueryAnalyzer`](materialized::QueryAnalyzer) computes result headers and
//! [`RefresherFactory`](materialized::RefresherFactory) supplies the
//! background refresh tasks. In-memory implementations of all of them are
//! bundled in [`Engine`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use arrow::datatypes::{DataType, Field, Schema};
//! use blaze_matview::ast::{CreateQuery, SelectQuery, StorageClause};
//! use blaze_matview::catalog::StorageId;
//! use blaze_matview::{Engine, Result};
//!
//! fn main() -> Result<()> {
//!     let engine = Engine::in_memory();
//!     let columns = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
//!
//!     engine.create_table(CreateQuery::table(
//!         "db",
//!         "events",
//!         columns.clone(),
//!         StorageClause::new("Memory"),
//!     ))?;
//!
//!     let select = SelectQuery::new("SELECT id FROM db.events")
//!         .from_table(StorageId::new("db", "events"));
//!     let view = engine.create_materialized_view(
//!         CreateQuery::materialized_view("db", "events_mv", columns, select)
//!             .with_engine(StorageClause::new("Memory")),
//!     )?;
//!
//!     println!("view data lives in {}", view.target_table_id());
//!     Ok(())
//! }
//! ```

pub mod ast;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod materialized;
pub mod plan;
pub mod storage;

// Re-export commonly used types
pub use config::{EngineConfig, ServerSettings, Settings};
pub use context::{QueryContext, ServerContext};
pub use error::{BlazeError, Result};
pub use materialized::{MaterializedView, ViewDescriptor};

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use tracing::warn;

use ast::{CreateQuery, InsertQuery, RenameQuery};
use catalog::{DatabaseCatalog, DropKind, DropRequest, MemoryCatalog, StorageId};
use materialized::{ManualRefresherFactory, StaticQueryAnalyzer};
use plan::{QueryPlan, QueryProcessingStage, SelectQueryInfo};
use storage::{Storage, StorageFactory};

/// An in-process engine wiring materialized views to in-memory
/// collaborators.
///
/// SQL is not parsed here: statements are passed as [`ast`] structures and
/// SELECT result headers come from the bundled [`StaticQueryAnalyzer`].
/// Refreshes are requested through [`ManualRefresherFactory`] refreshers
/// and run with [`Engine::run_refresh`].
pub struct Engine {
    catalog: Arc<MemoryCatalog>,
    analyzer: Arc<StaticQueryAnalyzer>,
    refreshers: Arc<ManualRefresherFactory>,
    server: ServerContext,
}

impl Engine {
    /// Create an engine with the `Memory` table engine and default settings.
    pub fn in_memory() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_storage_factory(config, Arc::new(StorageFactory::with_memory_engine()))
    }

    /// Create an engine with a caller-provided set of table engines.
    pub fn with_storage_factory(config: EngineConfig, storage_factory: Arc<StorageFactory>) -> Self {
        let catalog = Arc::new(MemoryCatalog::new(storage_factory.clone()));
        let analyzer = Arc::new(StaticQueryAnalyzer::new());
        let refreshers = Arc::new(ManualRefresherFactory::new());
        let server = ServerContext {
            catalog: catalog.clone(),
            storage_factory,
            analyzer: analyzer.clone(),
            refreshers: refreshers.clone(),
            server_settings: config.server,
            settings: config.settings,
        };
        Self {
            catalog,
            analyzer,
            refreshers,
            server,
        }
    }

    pub fn catalog(&self) -> &Arc<MemoryCatalog> {
        &self.catalog
    }

    pub fn storage_factory(&self) -> &Arc<StorageFactory> {
        &self.server.storage_factory
    }

    pub fn refreshers(&self) -> &Arc<ManualRefresherFactory> {
        &self.refreshers
    }

    pub fn server_context(&self) -> &ServerContext {
        &self.server
    }

    /// A context for one query, with the engine's settings.
    pub fn query_context(&self) -> QueryContext {
        self.server.internal_query_context()
    }

    /// Declare the result header of a SELECT used by a refreshable view.
    pub fn register_query_header(&self, query: impl Into<String>, header: SchemaRef) {
        self.analyzer.register(query, header);
    }

    /// `CREATE TABLE`
    pub fn create_table(&self, query: CreateQuery) -> Result<Arc<dyn Storage>> {
        let ctx = self.query_context();
        let id = query.storage_id();
        self.catalog.create_table(query, &ctx)?;
        self.catalog.get_table(&id, &ctx)
    }

    /// `CREATE MATERIALIZED VIEW`
    pub fn create_materialized_view(&self, query: CreateQuery) -> Result<Arc<MaterializedView>> {
        self.register_materialized_view(query, false)
    }

    /// `ATTACH MATERIALIZED VIEW`: the inner tables already exist.
    pub fn attach_materialized_view(&self, query: CreateQuery) -> Result<Arc<MaterializedView>> {
        self.register_materialized_view(query, true)
    }

    fn register_materialized_view(
        &self,
        query: CreateQuery,
        attach: bool,
    ) -> Result<Arc<MaterializedView>> {
        let ctx = self.query_context();
        let view = MaterializedView::create(
            query.storage_id(),
            &query,
            attach,
            &ctx,
            self.server.clone(),
        )?;

        if let Err(err) = self.catalog.attach_table(query, view.clone()) {
            if !attach {
                if let Err(drop_err) = view.drop_inner_table_if_any(true, &ctx) {
                    warn!(error = %drop_err, "Failed to drop inner tables of unregistered view");
                }
            }
            return Err(err);
        }
        view.startup()?;
        Ok(view)
    }

    /// `DROP TABLE`, for tables and views alike.
    pub fn drop_table(&self, id: &StorageId) -> Result<()> {
        let request = DropRequest::new(DropKind::Drop, id.clone()).with_sync(true);
        self.catalog.drop_table(request, &self.query_context())
    }

    /// `DETACH TABLE`
    pub fn detach_table(&self, id: &StorageId) -> Result<()> {
        let request = DropRequest::new(DropKind::Detach, id.clone());
        self.catalog.drop_table(request, &self.query_context())
    }

    /// `RENAME TABLE from TO to`
    pub fn rename_table(&self, from: &StorageId, to: &StorageId) -> Result<()> {
        let mut rename = RenameQuery::default();
        rename.add_element(&from.database, &from.table, &to.database, &to.table);
        self.catalog.rename_tables(&rename, &self.query_context())
    }

    /// Insert blocks into a table or view. Returns the number of rows written.
    pub fn insert(&self, id: &StorageId, batches: Vec<RecordBatch>) -> Result<usize> {
        let ctx = self.query_context();
        let table = self.catalog.get_table(id, &ctx)?;
        self.insert_into(&table, &InsertQuery::into_table(id.clone()), batches, &ctx)
    }

    /// Read `columns` from a table or view.
    pub fn select(&self, id: &StorageId, columns: &[&str]) -> Result<Vec<RecordBatch>> {
        let ctx = self.query_context();
        let table = self.catalog.get_table(id, &ctx)?;
        let column_names: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mut plan = QueryPlan::new();
        table.read(
            &mut plan,
            &column_names,
            &table.metadata(),
            &SelectQueryInfo::default(),
            &ctx,
            QueryProcessingStage::FetchColumns,
            ctx.settings().max_block_size,
            1,
        )?;
        plan.execute()
    }

    /// Run one refresh of `view` whose SELECT produced `result`.
    ///
    /// This is the cycle a scheduler performs: prepare, execute the INSERT,
    /// transfer. Returns the number of rows inserted.
    pub fn run_refresh(&self, view: &MaterializedView, result: Vec<RecordBatch>) -> Result<usize> {
        let ctx = view.create_refresh_context();
        let insert = view.prepare_refresh(&ctx)?;
        let destination = self.catalog.get_table(&insert.table_id, &ctx)?;
        let rows = self.insert_into(&destination, &insert, result, &ctx)?;
        view.transfer_refreshed_data(&ctx)?;
        Ok(rows)
    }

    fn insert_into(
        &self,
        table: &Arc<dyn Storage>,
        query: &InsertQuery,
        batches: Vec<RecordBatch>,
        ctx: &QueryContext,
    ) -> Result<usize> {
        let mut sink = table.write(query, &table.metadata(), ctx)?;
        for batch in batches {
            sink.consume(batch)?;
        }
        sink.finish()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("catalog", &self.catalog)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::ast::{
        AlterCommand, CreateQuery, InsertQuery, RefreshStrategy, SelectQuery, StorageClause,
    };
    pub use crate::catalog::{DatabaseCatalog, StorageId};
    pub use crate::error::{BlazeError, Result};
    pub use crate::materialized::{MaterializedView, Refresher, RefresherFactory};
    pub use crate::storage::Storage;
    pub use crate::{Engine, EngineConfig, QueryContext};
}
