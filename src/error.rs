//! Error types for materialized view management.
//!
//! Every failure raised by the view core, its catalog and its target-table
//! collaborators is expressed as a [`BlazeError`].

use std::time::Duration;

use thiserror::Error;

/// The primary error type for materialized view operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlazeError {
    /// Malformed view definition or a statement issued against the wrong object
    #[error("Incorrect query: {message}")]
    IncorrectQuery { message: String },

    /// Invalid argument in a definition (self reference, non-table target, ...)
    #[error("Bad arguments: {message}")]
    BadArguments { message: String },

    /// Operation or capability not supported
    #[error("Not implemented: {feature}")]
    NotImplemented { feature: String },

    /// Storage engine name is not registered
    #[error("Unknown storage: {message}")]
    UnknownStorage { message: String },

    /// Too many views read from the same source table
    #[error("Too many materialized views: {message}")]
    TooManyMaterializedViews { message: String },

    /// Internal invariant violated (bug in the engine)
    #[error("Logical error: {message}")]
    Logical { message: String },

    /// Table does not exist in the catalog
    #[error("Table {name} does not exist")]
    TableNotFound { name: String },

    /// Table already exists in the catalog
    #[error("Table {name} already exists")]
    TableAlreadyExists { name: String },

    /// Catalog error (database not found, etc.)
    #[error("Catalog error: {message}")]
    Catalog { message: String },

    /// Table lock was not acquired in time
    #[error("Failed to acquire {mode} lock on {table} within {timeout:?} (query {query_id})")]
    LockTimeout {
        mode: &'static str,
        table: String,
        query_id: String,
        timeout: Duration,
    },

    /// Arrow error
    #[error("Arrow error: {message}")]
    Arrow { message: String },
}

impl BlazeError {
    /// Create an incorrect query error.
    pub fn incorrect_query(message: impl Into<String>) -> Self {
        Self::IncorrectQuery {
            message: message.into(),
        }
    }

    /// Create a bad arguments error.
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments {
            message: message.into(),
        }
    }

    /// Create a not implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create an unknown storage error.
    pub fn unknown_storage(message: impl Into<String>) -> Self {
        Self::UnknownStorage {
            message: message.into(),
        }
    }

    /// Create a too many materialized views error.
    pub fn too_many_materialized_views(message: impl Into<String>) -> Self {
        Self::TooManyMaterializedViews {
            message: message.into(),
        }
    }

    /// Create a logical error.
    pub fn logical(message: impl Into<String>) -> Self {
        Self::Logical {
            message: message.into(),
        }
    }

    /// Create a table not found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Create a table already exists error.
    pub fn table_already_exists(name: impl Into<String>) -> Self {
        Self::TableAlreadyExists { name: name.into() }
    }

    /// Create a catalog error.
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Create a lock timeout error.
    pub fn lock_timeout(
        mode: &'static str,
        table: impl Into<String>,
        query_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::LockTimeout {
            mode,
            table: table.into(),
            query_id: query_id.into(),
            timeout,
        }
    }
}

impl From<arrow::error::ArrowError> for BlazeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BlazeError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadArguments {
            message: err.to_string(),
        }
    }
}

/// Result type alias for materialized view operations.
pub type Result<T> = std::result::Result<T, BlazeError>;
