//! Query plans produced when reading through a view.
//!
//! A plan is a source step reading blocks from a table followed by
//! expression steps transforming them. Plans also own the table locks and
//! table references that must outlive planning, so a table cannot be
//! dropped or altered under a running query.

mod converting;

pub use converting::{
    blocks_have_equal_structure, project_columns, project_known_columns,
    remove_non_common_columns, ConvertingActions, MatchColumnsMode,
};

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::catalog::StorageId;
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};
use crate::storage::{Storage, TableLockHolder, TableMetadata};

/// How far a query is processed before its result leaves a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryProcessingStage {
    /// Only read the requested columns
    FetchColumns,
    /// Partially aggregated state, to be merged by the initiator
    WithMergeableState,
    /// Fully processed result
    Complete,
}

/// Order in which a table can deliver rows to satisfy an ORDER BY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOrderInfo {
    /// Prefix of the sorting key the query can rely on
    pub sort_prefix: Vec<String>,
    pub reverse: bool,
}

/// Decides whether a read can use a table's physical sort order.
pub trait ReadInOrderOptimizer: fmt::Debug + Send + Sync {
    fn input_order(&self, metadata: &TableMetadata, ctx: &QueryContext) -> Option<InputOrderInfo>;
}

/// Uses the longest prefix shared by the required order and the table's
/// sorting key.
#[derive(Debug, Clone)]
pub struct SortingKeyPrefixOptimizer {
    required_order: Vec<String>,
    reverse: bool,
}

impl SortingKeyPrefixOptimizer {
    pub fn new(required_order: Vec<String>, reverse: bool) -> Self {
        Self {
            required_order,
            reverse,
        }
    }
}

impl ReadInOrderOptimizer for SortingKeyPrefixOptimizer {
    fn input_order(&self, metadata: &TableMetadata, _ctx: &QueryContext) -> Option<InputOrderInfo> {
        let sort_prefix: Vec<String> = self
            .required_order
            .iter()
            .zip(metadata.sorting_key.iter())
            .take_while(|(required, key)| required == key)
            .map(|(required, _)| required.clone())
            .collect();
        if sort_prefix.is_empty() {
            return None;
        }
        Some(InputOrderInfo {
            sort_prefix,
            reverse: self.reverse,
        })
    }
}

/// Per-query information handed to storages while planning a read.
#[derive(Debug, Default, Clone)]
pub struct SelectQueryInfo {
    /// Hint asking storages to read in sorting key order
    pub order_optimizer: Option<Arc<dyn ReadInOrderOptimizer>>,
    /// Order resolved from `order_optimizer`
    pub input_order_info: Option<InputOrderInfo>,
    /// Result header of the query at the processed stage, for stages past
    /// `FetchColumns`
    pub stage_header: Option<SchemaRef>,
}

/// Source step: blocks read from a table.
#[derive(Debug, Clone)]
pub struct ReadFromStorageStep {
    pub table: StorageId,
    pub header: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub input_order: Option<InputOrderInfo>,
}

/// Expression step: converts every block passing through.
#[derive(Debug, Clone)]
pub struct ExpressionStep {
    description: String,
    actions: ConvertingActions,
    output_header: SchemaRef,
}

impl ExpressionStep {
    pub fn new(input_header: &SchemaRef, actions: ConvertingActions) -> Self {
        let output_header = actions.output_header(input_header);
        Self {
            description: String::new(),
            actions,
            output_header,
        }
    }

    pub fn set_step_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn actions(&self) -> &ConvertingActions {
        &self.actions
    }
}

/// One step of a [`QueryPlan`].
#[derive(Debug, Clone)]
pub enum PlanStep {
    ReadFromStorage(ReadFromStorageStep),
    Expression(ExpressionStep),
}

impl PlanStep {
    pub fn output_header(&self) -> &SchemaRef {
        match self {
            PlanStep::ReadFromStorage(step) => &step.header,
            PlanStep::Expression(step) => &step.output_header,
        }
    }
}

/// A linear query plan.
#[derive(Default)]
pub struct QueryPlan {
    steps: Vec<PlanStep>,
    storage_holders: Vec<Arc<dyn Storage>>,
    table_locks: Vec<TableLockHolder>,
}

impl QueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a source step has been added.
    pub fn is_initialized(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Header of the blocks the plan currently produces.
    pub fn current_header(&self) -> Result<SchemaRef> {
        self.steps
            .last()
            .map(|step| step.output_header().clone())
            .ok_or_else(|| BlazeError::logical("Query plan is not initialized"))
    }

    pub fn add_step(&mut self, step: PlanStep) -> Result<()> {
        match (&step, self.is_initialized()) {
            (PlanStep::ReadFromStorage(_), true) => {
                return Err(BlazeError::logical(
                    "Cannot add a source step to an initialized query plan",
                ))
            }
            (PlanStep::Expression(_), false) => {
                return Err(BlazeError::logical(
                    "Cannot add an expression step to an empty query plan",
                ))
            }
            _ => {}
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn expression_steps(&self) -> impl Iterator<Item = &ExpressionStep> {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Expression(step) => Some(step),
            PlanStep::ReadFromStorage(_) => None,
        })
    }

    /// Keep `storage` alive as long as the plan.
    pub fn add_storage_holder(&mut self, storage: Arc<dyn Storage>) {
        self.storage_holders.push(storage);
    }

    /// Keep `lock` held as long as the plan.
    pub fn add_table_lock(&mut self, lock: TableLockHolder) {
        self.table_locks.push(lock);
    }

    pub fn storage_holders(&self) -> &[Arc<dyn Storage>] {
        &self.storage_holders
    }

    pub fn table_locks(&self) -> &[TableLockHolder] {
        &self.table_locks
    }

    /// Run the plan to completion. Held locks are released afterwards.
    pub fn execute(self) -> Result<Vec<RecordBatch>> {
        let mut steps = self.steps.into_iter();
        let mut batches = match steps.next() {
            Some(PlanStep::ReadFromStorage(source)) => source.batches,
            Some(PlanStep::Expression(_)) | None => {
                return Err(BlazeError::logical("Query plan has no source step"))
            }
        };
        for step in steps {
            if let PlanStep::Expression(step) = step {
                batches = batches
                    .iter()
                    .map(|batch| step.actions.execute(batch))
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        Ok(batches)
    }
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPlan")
            .field("steps", &self.steps)
            .field("storage_holders", &self.storage_holders.len())
            .field("table_locks", &self.table_locks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn source_step() -> ReadFromStorageStep {
        let header = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            header.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        ReadFromStorageStep {
            table: StorageId::new("db", "t"),
            header,
            batches: vec![batch],
            input_order: None,
        }
    }

    #[test]
    fn test_plan_requires_source_first() {
        let mut plan = QueryPlan::new();
        assert!(!plan.is_initialized());
        assert!(plan.current_header().is_err());

        let source = source_step();
        let target = Schema::new(vec![Field::new("a", DataType::Utf8, false)]);
        let actions =
            ConvertingActions::new(&source.header, &target, MatchColumnsMode::Name).unwrap();
        let step = ExpressionStep::new(&source.header, actions);
        assert!(plan.add_step(PlanStep::Expression(step.clone())).is_err());

        plan.add_step(PlanStep::ReadFromStorage(source.clone())).unwrap();
        assert!(plan.add_step(PlanStep::ReadFromStorage(source)).is_err());
        plan.add_step(PlanStep::Expression(step)).unwrap();
        assert_eq!(plan.expression_steps().count(), 1);
        assert_eq!(
            plan.current_header().unwrap().field(0).data_type(),
            &DataType::Utf8
        );
    }

    #[test]
    fn test_execute_applies_expression_steps() {
        let mut plan = QueryPlan::new();
        let source = source_step();
        let target = Schema::new(vec![Field::new("a", DataType::Utf8, false)]);
        let actions =
            ConvertingActions::new(&source.header, &target, MatchColumnsMode::Name).unwrap();
        let step = ExpressionStep::new(&source.header, actions);
        plan.add_step(PlanStep::ReadFromStorage(source)).unwrap();
        plan.add_step(PlanStep::Expression(step)).unwrap();

        let batches = plan.execute().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].schema().field(0).data_type(), &DataType::Utf8);
        assert_eq!(batches[0].num_rows(), 3);
    }

    #[test]
    fn test_sorting_key_prefix_optimizer() {
        let columns = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ]));
        let metadata =
            TableMetadata::new(columns).with_sorting_key(vec!["a".to_string(), "b".to_string()]);
        let ctx = QueryContext::new();

        let optimizer = SortingKeyPrefixOptimizer::new(vec!["a".to_string(), "x".to_string()], true);
        let info = optimizer.input_order(&metadata, &ctx).unwrap();
        assert_eq!(info.sort_prefix, vec!["a".to_string()]);
        assert!(info.reverse);

        let optimizer = SortingKeyPrefixOptimizer::new(vec!["b".to_string()], false);
        assert!(optimizer.input_order(&metadata, &ctx).is_none());
    }
}
