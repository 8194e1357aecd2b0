//! Reads and writes addressed to a view are served by its target table.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;

use super::MaterializedView;
use crate::ast::InsertQuery;
use crate::context::QueryContext;
use crate::error::Result;
use crate::plan::{
    blocks_have_equal_structure, project_known_columns, remove_non_common_columns,
    ConvertingActions, ExpressionStep, MatchColumnsMode, PlanStep, QueryPlan,
    QueryProcessingStage, SelectQueryInfo,
};
use crate::storage::{SinkToStorage, StorageSnapshot};

impl MaterializedView {
    /// The stage the target table can process the query to, judged on the
    /// target's own metadata.
    pub fn query_processing_stage(
        &self,
        ctx: &QueryContext,
        to_stage: QueryProcessingStage,
        query_info: &SelectQueryInfo,
    ) -> Result<QueryProcessingStage> {
        let target = self.target_table()?;
        let target_snapshot = target.metadata();
        target.query_processing_stage(ctx, to_stage, &target_snapshot, query_info)
    }

    /// Plan reading `column_names` from the target table.
    ///
    /// Where the target's columns differ from the view's declared ones, a
    /// converting step casts them to the view's types. Only columns known to
    /// both are compared; any other column the target returns is passed
    /// through unchanged. The target table and its share lock stay attached
    /// to the plan until it is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        plan: &mut QueryPlan,
        column_names: &[String],
        snapshot: &StorageSnapshot,
        query_info: &SelectQueryInfo,
        ctx: &QueryContext,
        processed_stage: QueryProcessingStage,
        max_block_size: usize,
        num_streams: usize,
    ) -> Result<()> {
        let target = self.target_table()?;
        let lock = target.lock_for_share(ctx.query_id(), ctx.settings().lock_acquire_timeout)?;
        let target_snapshot = target.metadata();

        let mut query_info = query_info.clone();
        if let Some(optimizer) = &query_info.order_optimizer {
            query_info.input_order_info = optimizer.input_order(&target_snapshot, ctx);
        }

        target.read(
            plan,
            column_names,
            &target_snapshot,
            &query_info,
            ctx,
            processed_stage,
            max_block_size,
            num_streams,
        )?;

        if plan.is_initialized() {
            let view_header = header_for_processing_stage(
                column_names,
                snapshot,
                &query_info,
                processed_stage,
            );
            let current_header = plan.current_header()?;

            let target_header = remove_non_common_columns(&view_header, &current_header);
            let view_header = remove_non_common_columns(&target_header, &view_header);

            if !blocks_have_equal_structure(&view_header, &target_header) {
                let mut actions =
                    ConvertingActions::new(&target_header, &view_header, MatchColumnsMode::Name)?;
                actions.project_input(false);
                let mut step = ExpressionStep::new(&current_header, actions);
                step.set_step_description(
                    "Convert target table structure to MaterializedView structure",
                );
                plan.add_step(PlanStep::Expression(step))?;
            }

            plan.add_storage_holder(target);
            plan.add_table_lock(lock);
        }
        Ok(())
    }

    /// Build an insert sink on the target table. The sink holds a share lock
    /// on the target until it is finished.
    pub fn write(&self, query: &InsertQuery, ctx: &QueryContext) -> Result<SinkToStorage> {
        let target = self.target_table()?;
        let lock = target.lock_for_share(ctx.query_id(), ctx.settings().lock_acquire_timeout)?;
        let target_snapshot = target.metadata();

        let mut sink = target.write(query, &target_snapshot, ctx)?;
        sink.add_table_lock(lock);
        Ok(sink)
    }
}

/// Header the view itself would produce for the query at `processed_stage`.
fn header_for_processing_stage(
    column_names: &[String],
    snapshot: &StorageSnapshot,
    query_info: &SelectQueryInfo,
    processed_stage: QueryProcessingStage,
) -> SchemaRef {
    match (&query_info.stage_header, processed_stage) {
        (Some(header), stage) if stage != QueryProcessingStage::FetchColumns => header.clone(),
        _ => Arc::new(project_known_columns(&snapshot.columns, column_names)),
    }
}
