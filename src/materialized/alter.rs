//! ALTER validation and forwarding of DDL to the target table.

use std::sync::Arc;

use super::MaterializedView;
use crate::ast::{AlterCommand, MutationCommand, OptimizeQuery, PartitionCommand};
use crate::catalog::{DropKind, DropRequest};
use crate::config::Settings;
use crate::context::QueryContext;
use crate::error::{BlazeError, Result};

impl MaterializedView {
    /// Reject ALTER commands a view cannot apply.
    ///
    /// Comments and MODIFY QUERY are always allowed. MODIFY REFRESH needs a
    /// refreshable view and must keep its APPEND mode.
    pub fn check_alter_is_possible(&self, commands: &[AlterCommand]) -> Result<()> {
        for command in commands {
            match command {
                command if command.is_comment_alter() => continue,
                AlterCommand::ModifyQuery(_) => continue,
                AlterCommand::ModifyRefresh(strategy) => {
                    if self.refresher.is_none() {
                        return Err(BlazeError::not_implemented(
                            "MODIFY REFRESH is not supported by non-refreshable materialized views",
                        ));
                    }
                    if strategy.append == self.inner.has_scratch_table() {
                        return Err(BlazeError::not_implemented(
                            "Adding/removing APPEND is not supported by refreshable materialized views",
                        ));
                    }
                }
                other => {
                    return Err(BlazeError::not_implemented(format!(
                        "Alter of type '{}' is not supported by storage {}",
                        other,
                        super::ENGINE_NAME
                    )))
                }
            }
        }
        Ok(())
    }

    /// Apply ALTER commands to the view definition.
    ///
    /// ALTERs of one view run one at a time, each against the descriptor the
    /// previous one left behind.
    pub fn alter(&self, commands: &[AlterCommand], ctx: &QueryContext) -> Result<()> {
        let _alter_guard = self.alter_lock.lock();
        self.check_alter_is_possible(commands)?;

        let table_id = self.storage_id();
        let old = self.descriptor();
        let new = Arc::new(old.apply(commands)?);

        let catalog = &self.server.catalog;
        catalog.update_view_dependency(
            old.source_table_id(),
            &table_id,
            new.source_table_id(),
            &table_id,
        );
        if let Err(err) = catalog.alter_view(&table_id, &new, ctx) {
            catalog.update_view_dependency(
                new.source_table_id(),
                &table_id,
                old.source_table_id(),
                &table_id,
            );
            return Err(err);
        }
        *self.descriptor.write() = new.clone();

        if let (Some(refresher), Some(strategy)) = (&self.refresher, &new.refresh) {
            refresher.alter_refresh_params(strategy);
        }
        Ok(())
    }

    /// DDL is forwarded only to inner target tables. A `TO` target belongs to
    /// someone else and must be altered directly.
    pub fn check_statement_can_be_forwarded(&self) -> Result<()> {
        if !self.inner.has_inner_target_table() {
            return Err(BlazeError::incorrect_query(format!(
                "MATERIALIZED VIEW targets existing table {}. Execute the statement directly on it.",
                self.inner.target_table_id().name_for_logs()
            )));
        }
        Ok(())
    }

    /// Truncate the inner target table.
    pub fn truncate(&self, ctx: &QueryContext) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        let request =
            DropRequest::new(DropKind::Truncate, self.inner.target_table_id()).with_sync(true);
        self.server.catalog.drop_table(request, ctx)
    }

    pub fn optimize(&self, query: &OptimizeQuery, ctx: &QueryContext) -> Result<bool> {
        self.check_statement_can_be_forwarded()?;
        let target = self.target_table()?;
        let target_snapshot = target.metadata();
        target.optimize(query, &target_snapshot, ctx)
    }

    pub fn check_mutation_is_possible(
        &self,
        commands: &[MutationCommand],
        settings: &Settings,
    ) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        self.target_table()?
            .check_mutation_is_possible(commands, settings)
    }

    pub fn mutate(&self, commands: &[MutationCommand], ctx: &QueryContext) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        self.target_table()?.mutate(commands, ctx)
    }

    pub fn check_alter_partition_is_possible(
        &self,
        commands: &[PartitionCommand],
        settings: &Settings,
    ) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        let target = self.target_table()?;
        let target_snapshot = target.metadata();
        target.check_alter_partition_is_possible(commands, &target_snapshot, settings)
    }

    pub fn alter_partition(&self, commands: &[PartitionCommand], ctx: &QueryContext) -> Result<()> {
        self.check_statement_can_be_forwarded()?;
        let target = self.target_table()?;
        let target_snapshot = target.metadata();
        target.alter_partition(&target_snapshot, commands, ctx)
    }
}
