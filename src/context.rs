//! Execution contexts.
//!
//! A [`QueryContext`] identifies the query on whose behalf a lock is taken or
//! a statement runs. A [`ServerContext`] bundles the long-lived collaborators
//! a materialized view talks to.

use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::DatabaseCatalog;
use crate::config::{ServerSettings, Settings};
use crate::materialized::{QueryAnalyzer, RefresherFactory};
use crate::storage::StorageFactory;

/// Per-query context.
#[derive(Debug, Clone)]
pub struct QueryContext {
    query_id: String,
    settings: Settings,
}

impl QueryContext {
    /// Create a context with a random query id and default settings.
    pub fn new() -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
            settings: Settings::default(),
        }
    }

    /// Set the query id.
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    /// Set the settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Derive the context a background refresh runs in: same settings, a
    /// fresh query id.
    pub fn for_refresh(&self) -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
            settings: self.settings.clone(),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived collaborators shared by every view of a server.
#[derive(Clone)]
pub struct ServerContext {
    /// Catalog holding tables, create statements and dependency edges
    pub catalog: Arc<dyn DatabaseCatalog>,
    /// Registered storage engines and their capabilities
    pub storage_factory: Arc<StorageFactory>,
    /// Evaluates output headers of SELECT queries
    pub analyzer: Arc<dyn QueryAnalyzer>,
    /// Builds background refreshers for refreshable views
    pub refreshers: Arc<dyn RefresherFactory>,
    /// Server-wide limits
    pub server_settings: ServerSettings,
    /// Settings used by statements the view issues on its own behalf
    pub settings: Settings,
}

impl ServerContext {
    /// A query context for statements issued by the server itself.
    pub fn internal_query_context(&self) -> QueryContext {
        QueryContext::new().with_settings(self.settings.clone())
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("server_settings", &self.server_settings)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
