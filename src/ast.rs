//! Statement structures consumed and produced by the view core.
//!
//! These are already-analyzed statements: parsing SQL text into them is the
//! job of the surrounding engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::{Schema, SchemaRef};
use uuid::Uuid;

use crate::catalog::StorageId;

/// Kind of object a CREATE statement defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Table,
    Dictionary,
    View,
    MaterializedView,
    LiveView,
    WindowView,
}

impl TableKind {
    /// Whether objects of this kind store their own rows.
    pub fn is_regular_table(&self) -> bool {
        matches!(self, TableKind::Table)
    }
}

/// `ENGINE = ...` clause of a CREATE statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClause {
    /// Engine name
    pub engine: String,
    /// Engine arguments
    pub engine_args: Vec<String>,
    /// `PARTITION BY` expression
    pub partition_by: Option<String>,
    /// `ORDER BY` columns
    pub order_by: Vec<String>,
}

impl StorageClause {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            engine_args: Vec::new(),
            partition_by: None,
            order_by: Vec::new(),
        }
    }

    pub fn with_partition_by(mut self, expr: impl Into<String>) -> Self {
        self.partition_by = Some(expr.into());
        self
    }

    pub fn with_order_by(mut self, columns: Vec<String>) -> Self {
        self.order_by = columns;
        self
    }
}

/// The SELECT a view is defined by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    /// Table the query reads from, when it reads from exactly one
    pub select_table_id: Option<StorageId>,
    /// Query text
    pub query: String,
}

impl SelectQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            select_table_id: None,
            query: query.into(),
        }
    }

    pub fn from_table(mut self, source: StorageId) -> Self {
        self.select_table_id = Some(source);
        self
    }
}

/// How a refresh is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    /// Refresh on period boundaries (`REFRESH EVERY`)
    Every(Duration),
    /// Refresh a fixed time after the previous one finished (`REFRESH AFTER`)
    After(Duration),
}

/// `REFRESH ... [APPEND]` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshStrategy {
    pub schedule: RefreshSchedule,
    /// Random delay added to each scheduled time
    pub randomize_for: Option<Duration>,
    /// Views whose refresh must complete first
    pub depends_on: Vec<StorageId>,
    /// Insert new rows into the target instead of swapping its contents
    pub append: bool,
}

impl RefreshStrategy {
    pub fn every(period: Duration) -> Self {
        Self {
            schedule: RefreshSchedule::Every(period),
            randomize_for: None,
            depends_on: Vec::new(),
            append: false,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            schedule: RefreshSchedule::After(delay),
            randomize_for: None,
            depends_on: Vec::new(),
            append: false,
        }
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn with_randomize_for(mut self, jitter: Duration) -> Self {
        self.randomize_for = Some(jitter);
        self
    }

    pub fn with_depends_on(mut self, views: Vec<StorageId>) -> Self {
        self.depends_on = views;
        self
    }
}

/// A CREATE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateQuery {
    pub database: String,
    pub table: String,
    pub uuid: Option<Uuid>,
    pub kind: TableKind,
    pub columns: SchemaRef,
    pub storage: Option<StorageClause>,
    pub select: Option<SelectQuery>,
    /// `TO db.table`
    pub to_table_id: Option<StorageId>,
    /// `TO INNER UUID ...`
    pub to_inner_uuids: Vec<Uuid>,
    pub refresh_strategy: Option<RefreshStrategy>,
    /// `EMPTY`: skip the initial refresh
    pub is_create_empty: bool,
    pub comment: String,
}

impl CreateQuery {
    fn bare(database: String, table: String, kind: TableKind, columns: SchemaRef) -> Self {
        Self {
            database,
            table,
            uuid: None,
            kind,
            columns,
            storage: None,
            select: None,
            to_table_id: None,
            to_inner_uuids: Vec::new(),
            refresh_strategy: None,
            is_create_empty: false,
            comment: String::new(),
        }
    }

    /// `CREATE TABLE database.table (columns) ENGINE = engine`
    pub fn table(
        database: impl Into<String>,
        table: impl Into<String>,
        columns: SchemaRef,
        storage: StorageClause,
    ) -> Self {
        let mut query = Self::bare(database.into(), table.into(), TableKind::Table, columns);
        query.storage = Some(storage);
        query
    }

    /// `CREATE MATERIALIZED VIEW database.table (columns) AS select`
    pub fn materialized_view(
        database: impl Into<String>,
        table: impl Into<String>,
        columns: SchemaRef,
        select: SelectQuery,
    ) -> Self {
        let mut query = Self::bare(
            database.into(),
            table.into(),
            TableKind::MaterializedView,
            columns,
        );
        query.select = Some(select);
        query
    }

    /// A non-table object (view, dictionary, ...) known by definition only.
    pub fn object(database: impl Into<String>, table: impl Into<String>, kind: TableKind) -> Self {
        Self::bare(
            database.into(),
            table.into(),
            kind,
            Arc::new(Schema::empty()),
        )
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_engine(mut self, storage: StorageClause) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_to_table(mut self, target: StorageId) -> Self {
        self.to_table_id = Some(target);
        self
    }

    pub fn with_inner_uuids(mut self, uuids: Vec<Uuid>) -> Self {
        self.to_inner_uuids = uuids;
        self
    }

    pub fn with_refresh(mut self, strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = Some(strategy);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn empty(mut self) -> Self {
        self.is_create_empty = true;
        self
    }

    pub fn set_table_id(&mut self, id: &StorageId) {
        self.database = id.database.clone();
        self.table = id.table.clone();
        self.uuid = id.uuid;
    }

    pub fn storage_id(&self) -> StorageId {
        StorageId {
            database: self.database.clone(),
            table: self.table.clone(),
            uuid: self.uuid,
        }
    }

    /// A materialized view without a TO clause stores rows in a table it owns.
    pub fn needs_inner_target_table(&self) -> bool {
        self.kind == TableKind::MaterializedView && self.to_table_id.is_none()
    }

    /// A refreshable view that is not in APPEND mode swaps through a scratch
    /// table.
    pub fn needs_scratch_table(&self) -> bool {
        self.kind == TableKind::MaterializedView
            && self.refresh_strategy.as_ref().is_some_and(|r| !r.append)
    }

    /// Number of tables the view creates and owns.
    pub fn needs_inner_tables(&self) -> usize {
        usize::from(self.needs_inner_target_table()) + usize::from(self.needs_scratch_table())
    }
}

/// An INSERT statement, typically `INSERT INTO t (cols) SELECT ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertQuery {
    pub table_id: StorageId,
    /// Explicit column list; empty means all columns in table order
    pub columns: Vec<String>,
    pub select: Option<SelectQuery>,
}

impl InsertQuery {
    pub fn into_table(table_id: StorageId) -> Self {
        Self {
            table_id,
            columns: Vec::new(),
            select: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }
}

/// One command of an ALTER statement.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterCommand {
    /// `MODIFY COMMENT`
    ModifyComment(String),
    /// `COMMENT COLUMN`
    CommentColumn { column: String, comment: String },
    /// `MODIFY QUERY`
    ModifyQuery(SelectQuery),
    /// `MODIFY REFRESH`
    ModifyRefresh(RefreshStrategy),
    /// `ADD COLUMN`
    AddColumn {
        name: String,
        data_type: arrow::datatypes::DataType,
    },
    /// `DROP COLUMN`
    DropColumn { name: String },
    /// `MODIFY SETTING`
    ModifySetting { name: String, value: String },
}

impl AlterCommand {
    pub fn is_comment_alter(&self) -> bool {
        matches!(
            self,
            AlterCommand::ModifyComment(_) | AlterCommand::CommentColumn { .. }
        )
    }

    /// Statement keyword, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AlterCommand::ModifyComment(_) => "MODIFY_COMMENT",
            AlterCommand::CommentColumn { .. } => "COMMENT_COLUMN",
            AlterCommand::ModifyQuery(_) => "MODIFY_QUERY",
            AlterCommand::ModifyRefresh(_) => "MODIFY_REFRESH",
            AlterCommand::AddColumn { .. } => "ADD_COLUMN",
            AlterCommand::DropColumn { .. } => "DROP_COLUMN",
            AlterCommand::ModifySetting { .. } => "MODIFY_SETTING",
        }
    }
}

impl fmt::Display for AlterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A mutation (`ALTER TABLE ... DELETE/UPDATE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationCommand {
    Delete {
        predicate: String,
    },
    Update {
        assignments: Vec<(String, String)>,
        predicate: String,
    },
    MaterializeColumn {
        column: String,
    },
}

/// A partition command (`ALTER TABLE ... DROP/DETACH/ATTACH PARTITION`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionCommand {
    DropPartition { partition: String },
    DetachPartition { partition: String },
    AttachPartition { partition: String },
    FreezePartition { partition: String },
}

/// `OPTIMIZE TABLE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeQuery {
    pub partition: Option<String>,
    pub final_: bool,
    pub deduplicate: bool,
    pub deduplicate_by_columns: Vec<String>,
    pub cleanup: bool,
}

/// One `old TO new` pair of a RENAME statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameElement {
    pub from_database: String,
    pub from_table: String,
    pub to_database: String,
    pub to_table: String,
}

/// `RENAME TABLE a TO b, c TO d`, applied as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameQuery {
    pub elements: Vec<RenameElement>,
}

impl RenameQuery {
    pub fn add_element(
        &mut self,
        from_database: impl Into<String>,
        from_table: impl Into<String>,
        to_database: impl Into<String>,
        to_table: impl Into<String>,
    ) {
        self.elements.push(RenameElement {
            from_database: from_database.into(),
            from_table: from_table.into(),
            to_database: to_database.into(),
            to_table: to_table.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field};

    fn columns() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]))
    }

    #[test]
    fn test_inner_table_requirements() {
        let select = SelectQuery::new("SELECT x FROM src");
        let plain = CreateQuery::materialized_view("db", "v", columns(), select.clone())
            .with_engine(StorageClause::new("Memory"));
        assert!(plain.needs_inner_target_table());
        assert!(!plain.needs_scratch_table());
        assert_eq!(plain.needs_inner_tables(), 1);

        let swap = plain
            .clone()
            .with_refresh(RefreshStrategy::every(Duration::from_secs(60)));
        assert!(swap.needs_scratch_table());
        assert_eq!(swap.needs_inner_tables(), 2);

        let append = plain
            .clone()
            .with_refresh(RefreshStrategy::every(Duration::from_secs(60)).with_append(true));
        assert!(!append.needs_scratch_table());

        let to_table = CreateQuery::materialized_view("db", "v", columns(), select)
            .with_to_table(StorageId::new("db", "dst"))
            .with_refresh(RefreshStrategy::after(Duration::from_secs(5)));
        assert!(!to_table.needs_inner_target_table());
        assert_eq!(to_table.needs_inner_tables(), 1);
    }

    #[test]
    fn test_comment_alters() {
        assert!(AlterCommand::ModifyComment("c".into()).is_comment_alter());
        assert!(!AlterCommand::ModifyQuery(SelectQuery::new("SELECT 1")).is_comment_alter());
        assert_eq!(
            AlterCommand::DropColumn { name: "x".into() }.to_string(),
            "DROP_COLUMN"
        );
    }
}
