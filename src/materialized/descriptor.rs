//! Versioned definition of a materialized view.

use std::collections::BTreeMap;

use arrow::datatypes::SchemaRef;

use crate::ast::{AlterCommand, CreateQuery, RefreshStrategy, SelectQuery};
use crate::catalog::StorageId;
use crate::error::{BlazeError, Result};
use crate::storage::TableMetadata;

/// What a materialized view is: its query, its declared columns, how it is
/// refreshed and its comments.
///
/// A descriptor is never modified in place. ALTER builds a new one with
/// [`ViewDescriptor::apply`] and the view swaps it in after persisting it.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDescriptor {
    pub columns: SchemaRef,
    pub select: SelectQuery,
    pub refresh: Option<RefreshStrategy>,
    pub comment: String,
    pub column_comments: BTreeMap<String, String>,
}

impl ViewDescriptor {
    pub fn new(columns: SchemaRef, select: SelectQuery) -> Self {
        Self {
            columns,
            select,
            refresh: None,
            comment: String::new(),
            column_comments: BTreeMap::new(),
        }
    }

    pub fn with_refresh(mut self, refresh: RefreshStrategy) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Build the descriptor of a `CREATE MATERIALIZED VIEW` statement.
    pub fn from_create_query(query: &CreateQuery) -> Result<Self> {
        let select = query.select.clone().ok_or_else(|| {
            BlazeError::incorrect_query("SELECT query is not specified for MaterializedView")
        })?;
        Ok(Self {
            columns: query.columns.clone(),
            select,
            refresh: query.refresh_strategy.clone(),
            comment: query.comment.clone(),
            column_comments: BTreeMap::new(),
        })
    }

    /// Table the query reads from, if it reads from a single table.
    pub fn source_table_id(&self) -> Option<&StorageId> {
        self.select.select_table_id.as_ref()
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh.is_some()
    }

    /// Refreshable and not in APPEND mode.
    pub fn uses_scratch_table(&self) -> bool {
        self.refresh.as_ref().is_some_and(|r| !r.append)
    }

    /// Metadata of the view as a table.
    pub fn table_metadata(&self) -> TableMetadata {
        let mut metadata = TableMetadata::new(self.columns.clone());
        metadata.comment = self.comment.clone();
        metadata
    }

    /// A copy of this descriptor with `commands` applied.
    pub fn apply(&self, commands: &[AlterCommand]) -> Result<Self> {
        let mut next = self.clone();
        for command in commands {
            match command {
                AlterCommand::ModifyComment(comment) => next.comment = comment.clone(),
                AlterCommand::CommentColumn { column, comment } => {
                    if next.columns.field_with_name(column).is_err() {
                        return Err(BlazeError::bad_arguments(format!(
                            "Wrong column name. Cannot find column {} to comment",
                            column
                        )));
                    }
                    next.column_comments.insert(column.clone(), comment.clone());
                }
                AlterCommand::ModifyQuery(select) => next.select = select.clone(),
                AlterCommand::ModifyRefresh(refresh) => next.refresh = Some(refresh.clone()),
                other => {
                    return Err(BlazeError::not_implemented(format!(
                        "Alter of type '{}' is not supported by storage MaterializedView",
                        other
                    )))
                }
            }
        }
        Ok(next)
    }
}
