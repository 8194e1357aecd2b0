//! Table identity.

use std::fmt;

use uuid::Uuid;

/// Identity of a table: its current qualified name plus an optional stable
/// uuid that survives renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageId {
    /// Database name
    pub database: String,
    /// Table name
    pub table: String,
    /// Stable identity, if the database assigns one
    pub uuid: Option<Uuid>,
}

impl StorageId {
    /// Create an identity without a uuid.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            uuid: None,
        }
    }

    /// Set the stable identity.
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn has_uuid(&self) -> bool {
        self.uuid.is_some()
    }

    /// Database and table name, the key DDL guards are ordered by.
    pub fn qualified_name(&self) -> QualifiedTableName {
        QualifiedTableName {
            database: self.database.clone(),
            table: self.table.clone(),
        }
    }

    /// `database.table`
    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    /// Name used in log lines and error messages.
    pub fn name_for_logs(&self) -> String {
        match self.uuid {
            Some(uuid) => format!("{}.{} ({})", self.database, self.table, uuid),
            None => self.full_table_name(),
        }
    }

    /// Whether both identities denote the same table. Stable identities win
    /// when both sides carry one; otherwise names are compared.
    pub fn refers_to(&self, other: &StorageId) -> bool {
        match (self.uuid, other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => self.database == other.database && self.table == other.table,
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// `(database, table)` pair, ordered lexicographically by database first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedTableName {
    pub database: String,
    pub table: String,
}

impl QualifiedTableName {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for QualifiedTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}
