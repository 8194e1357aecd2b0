//! Registry of storage engines.
//!
//! Each engine is registered under its name with the capability flags the
//! view core checks and a creator the catalog uses to instantiate tables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{MemoryTable, Storage, TableMetadata};
use crate::ast::CreateQuery;
use crate::catalog::StorageId;
use crate::error::{BlazeError, Result};

/// Capabilities an engine declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageFeatures {
    /// Can atomically take over all data of another table of the same engine
    pub supports_moving_data_between_tables: bool,
    /// Keeps replicas in sync through a coordination service
    pub supports_replication: bool,
    /// Accepts a `PARTITION BY` clause
    pub supports_partitioning: bool,
}

/// Arguments handed to an engine creator.
#[derive(Debug)]
pub struct StorageCreateArgs<'a> {
    pub table_id: StorageId,
    pub query: &'a CreateQuery,
}

/// Builds tables of one engine.
pub trait TableCreator: Send + Sync {
    fn create(&self, args: &StorageCreateArgs<'_>) -> Result<Arc<dyn Storage>>;
}

/// Creator for the in-memory engine.
#[derive(Debug, Default)]
pub struct MemoryTableCreator;

impl TableCreator for MemoryTableCreator {
    fn create(&self, args: &StorageCreateArgs<'_>) -> Result<Arc<dyn Storage>> {
        let metadata = TableMetadata::from_create_query(args.query);
        Ok(Arc::new(
            MemoryTable::new(args.table_id.clone(), metadata).with_engine_name(args.engine_name()),
        ))
    }
}

#[derive(Clone)]
struct RegisteredEngine {
    features: StorageFeatures,
    creator: Arc<dyn TableCreator>,
}

/// Engine registry.
#[derive(Default)]
pub struct StorageFactory {
    engines: RwLock<BTreeMap<String, RegisteredEngine>>,
}

impl StorageFactory {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-memory engine registered as `Memory`.
    pub fn with_memory_engine() -> Self {
        let factory = Self::new();
        factory.register(
            "Memory",
            StorageFeatures {
                supports_moving_data_between_tables: true,
                supports_replication: false,
                supports_partitioning: false,
            },
            Arc::new(MemoryTableCreator),
        );
        factory
    }

    /// Register (or replace) an engine.
    pub fn register(
        &self,
        name: impl Into<String>,
        features: StorageFeatures,
        creator: Arc<dyn TableCreator>,
    ) {
        self.engines
            .write()
            .insert(name.into(), RegisteredEngine { features, creator });
    }

    /// Capabilities of an engine, if it is registered.
    pub fn try_get_features(&self, engine: &str) -> Option<StorageFeatures> {
        self.engines.read().get(engine).map(|e| e.features)
    }

    /// Sorted names of the engines whose features satisfy `matcher`.
    pub fn registered_names_matching(&self, matcher: impl Fn(&StorageFeatures) -> bool) -> Vec<String> {
        self.engines
            .read()
            .iter()
            .filter(|(_, engine)| matcher(&engine.features))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Instantiate a table for a CREATE statement.
    pub fn create(&self, args: &StorageCreateArgs<'_>) -> Result<Arc<dyn Storage>> {
        let engine_name = args.engine_name();
        let creator = self
            .engines
            .read()
            .get(engine_name)
            .map(|e| e.creator.clone())
            .ok_or_else(|| {
                BlazeError::unknown_storage(format!("Unknown table engine {}", engine_name))
            })?;
        creator.create(args)
    }
}

impl StorageCreateArgs<'_> {
    /// Engine named by the statement's ENGINE clause, empty if it has none.
    pub fn engine_name(&self) -> &str {
        self.query
            .storage
            .as_ref()
            .map(|s| s.engine.as_str())
            .unwrap_or_default()
    }
}

impl fmt::Debug for StorageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engines = self.engines.read();
        f.debug_map()
            .entries(engines.iter().map(|(name, e)| (name, e.features)))
            .finish()
    }
}
