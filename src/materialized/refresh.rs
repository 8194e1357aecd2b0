//! Refresh protocol and the refresher interface.
//!
//! A refreshable view is refreshed by an external scheduler in two calls:
//! [`MaterializedView::prepare_refresh`] hands out the INSERT statement to
//! execute, and [`MaterializedView::transfer_refreshed_data`] publishes its
//! result. Between the two the scheduler runs the INSERT through the normal
//! query path.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use arrow::datatypes::SchemaRef;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::MaterializedView;
use crate::ast::{InsertQuery, RefreshStrategy, SelectQuery};
use crate::catalog::StorageId;
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};

/// Background task refreshing one view.
pub trait Refresher: Send + Sync {
    /// Register the task with the scheduler and start scheduling refreshes.
    fn initialize_and_start(&self) -> Result<()>;

    /// Schedule one refresh right away.
    fn run(&self);

    /// Use new schedule parameters from now on.
    fn alter_refresh_params(&self, strategy: &RefreshStrategy);

    /// The view was renamed.
    fn rename(&self, new_id: &StorageId);

    /// Stop scheduling refreshes. A refresh already running is not
    /// interrupted.
    fn stop(&self);

    /// Resume scheduling after [`Refresher::stop`].
    fn start(&self);

    fn shutdown(&self);
}

/// Creates the refresher of a refreshable view.
pub trait RefresherFactory: Send + Sync {
    fn create(
        &self,
        view: Weak<MaterializedView>,
        view_id: &StorageId,
        strategy: &RefreshStrategy,
    ) -> Arc<dyn Refresher>;
}

/// Computes the result header of a SELECT without running it.
pub trait QueryAnalyzer: Send + Sync {
    fn sample_header(&self, select: &SelectQuery, ctx: &QueryContext) -> Result<SchemaRef>;
}

/// Analyzer answering from a fixed map of query text to result header.
#[derive(Debug, Default)]
pub struct StaticQueryAnalyzer {
    headers: RwLock<HashMap<String, SchemaRef>>,
}

impl StaticQueryAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the result header of `query`.
    pub fn with_header(self, query: impl Into<String>, header: SchemaRef) -> Self {
        self.register(query, header);
        self
    }

    pub fn register(&self, query: impl Into<String>, header: SchemaRef) {
        self.headers.write().insert(query.into(), header);
    }
}

impl QueryAnalyzer for StaticQueryAnalyzer {
    fn sample_header(&self, select: &SelectQuery, _ctx: &QueryContext) -> Result<SchemaRef> {
        self.headers.read().get(&select.query).cloned().ok_or_else(|| {
            BlazeError::incorrect_query(format!(
                "Cannot determine result header of query: {}",
                select.query
            ))
        })
    }
}

/// One call received by a [`ManualRefresher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefresherEvent {
    InitializeAndStart,
    Run,
    AlterRefreshParams(RefreshStrategy),
    Rename(StorageId),
    Stop,
    Start,
    Shutdown,
}

#[derive(Debug)]
struct ManualRefresherState {
    view_id: StorageId,
    strategy: RefreshStrategy,
    scheduling: bool,
    shut_down: bool,
    pending_runs: usize,
    events: Vec<RefresherEvent>,
}

/// Refresher that never refreshes on its own.
///
/// It keeps track of what a scheduler would do (whether refreshes are
/// scheduled, how many were requested, the current parameters) and leaves
/// running them to the embedder, who drives [`MaterializedView`] through
/// [`ManualRefresher::view`].
#[derive(Debug)]
pub struct ManualRefresher {
    view: Weak<MaterializedView>,
    state: Mutex<ManualRefresherState>,
}

impl ManualRefresher {
    pub fn new(view: Weak<MaterializedView>, view_id: StorageId, strategy: RefreshStrategy) -> Self {
        Self {
            view,
            state: Mutex::new(ManualRefresherState {
                view_id,
                strategy,
                scheduling: false,
                shut_down: false,
                pending_runs: 0,
                events: Vec::new(),
            }),
        }
    }

    /// The refreshed view, while it is alive.
    pub fn view(&self) -> Option<Arc<MaterializedView>> {
        self.view.upgrade()
    }

    pub fn view_id(&self) -> StorageId {
        self.state.lock().view_id.clone()
    }

    pub fn strategy(&self) -> RefreshStrategy {
        self.state.lock().strategy.clone()
    }

    /// Refreshes are being scheduled: started, not stopped, not shut down.
    pub fn is_scheduling(&self) -> bool {
        let state = self.state.lock();
        state.scheduling && !state.shut_down
    }

    /// Number of requested refreshes, resetting the counter.
    pub fn take_pending_runs(&self) -> usize {
        std::mem::take(&mut self.state.lock().pending_runs)
    }

    /// Every call received so far, oldest first.
    pub fn events(&self) -> Vec<RefresherEvent> {
        self.state.lock().events.clone()
    }
}

impl Refresher for ManualRefresher {
    fn initialize_and_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::InitializeAndStart);
        state.scheduling = true;
        Ok(())
    }

    fn run(&self) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::Run);
        state.pending_runs += 1;
    }

    fn alter_refresh_params(&self, strategy: &RefreshStrategy) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::AlterRefreshParams(strategy.clone()));
        state.strategy = strategy.clone();
    }

    fn rename(&self, new_id: &StorageId) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::Rename(new_id.clone()));
        state.view_id = new_id.clone();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::Stop);
        state.scheduling = false;
    }

    fn start(&self) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::Start);
        state.scheduling = true;
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.events.push(RefresherEvent::Shutdown);
        state.shut_down = true;
    }
}

/// Factory of [`ManualRefresher`]s. Keeps every refresher it created.
#[derive(Debug, Default)]
pub struct ManualRefresherFactory {
    created: Mutex<Vec<Arc<ManualRefresher>>>,
}

impl ManualRefresherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresher created for the view currently named `view_id`.
    pub fn refresher_for(&self, view_id: &StorageId) -> Option<Arc<ManualRefresher>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|r| r.view_id().refers_to(view_id))
            .cloned()
    }

    pub fn created(&self) -> Vec<Arc<ManualRefresher>> {
        self.created.lock().clone()
    }
}

impl RefresherFactory for ManualRefresherFactory {
    fn create(
        &self,
        view: Weak<MaterializedView>,
        view_id: &StorageId,
        strategy: &RefreshStrategy,
    ) -> Arc<dyn Refresher> {
        let refresher = Arc::new(ManualRefresher::new(view, view_id.clone(), strategy.clone()));
        self.created.lock().push(refresher.clone());
        refresher
    }
}

impl MaterializedView {
    /// Context a refresh runs in: the view's settings and a fresh query id.
    pub fn create_refresh_context(&self) -> QueryContext {
        self.context.for_refresh()
    }

    /// First step of a refresh.
    ///
    /// Picks the destination (the scratch table when swapping, the target
    /// otherwise), empties the scratch table unless it is known to be empty
    /// and returns the INSERT the caller must execute.
    pub fn prepare_refresh(&self, refresh_ctx: &QueryContext) -> Result<InsertQuery> {
        let destination = match self.inner.scratch_table_id() {
            Some(scratch_id) if self.inner.has_scratch_table() => {
                if self.inner.is_scratch_known_empty() {
                    debug!(scratch = %scratch_id.name_for_logs(), "scratch table known to be empty, skipping truncate");
                } else {
                    let scratch = self.server.catalog.get_table(&scratch_id, refresh_ctx)?;
                    let lock = scratch.lock_exclusively(
                        refresh_ctx.query_id(),
                        refresh_ctx.settings().lock_acquire_timeout,
                    )?;
                    scratch.truncate(&scratch.metadata(), refresh_ctx, &lock)?;
                    debug!(scratch = %scratch_id.name_for_logs(), "truncated scratch table");
                }
                scratch_id
            }
            _ => self.inner.target_table_id(),
        };

        let select = self.descriptor().select.clone();
        let header = self.server.analyzer.sample_header(&select, refresh_ctx)?;
        let columns = header.fields().iter().map(|f| f.name().clone()).collect();

        let mut insert = InsertQuery::into_table(destination).with_columns(columns);
        insert.select = Some(select);

        self.inner.set_scratch_known_empty(false);
        Ok(insert)
    }

    /// Second step of a refresh: move the refreshed rows from the scratch
    /// table into the target table, replacing its contents. Nothing to do in
    /// APPEND mode.
    pub fn transfer_refreshed_data(&self, refresh_ctx: &QueryContext) -> Result<()> {
        if !self.inner.has_scratch_table() {
            return Ok(());
        }
        let ids = self.inner.snapshot();
        let Some(scratch_id) = ids.scratch else {
            return Ok(());
        };
        let target = self.server.catalog.get_table(&ids.target, refresh_ctx)?;
        let scratch = self.server.catalog.get_table(&scratch_id, refresh_ctx)?;
        target.transfer_all_data_from(&scratch, true, true, refresh_ctx)?;

        self.inner.set_scratch_known_empty(true);
        info!(
            view = %self.storage_id().name_for_logs(),
            target = %ids.target.name_for_logs(),
            "transferred refreshed data into target table"
        );
        Ok(())
    }
}
