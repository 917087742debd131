//! Running approved migrations.
//!
//! [`MigrationRunner::run`] checks that a migration may run, marks it in
//! progress, then applies its steps one at a time in their stored order.
//! Every status change is persisted before the next statement runs, so a
//! crashed run can be inspected and resumed.

use crate::diff::Operation;
use crate::executor::{PrintExecutor, StatementExecutor};
use crate::migration::{Migration, MigrationStatus, Step, StepStatus};
use crate::store::{IdentityStore, MigrationStore, StoreError};
use keel_config::ExecutionDefaults;
use keel_schema::EntityKind;
use std::collections::HashSet;
use std::sync::Arc;

/// Flags for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub migration_id: i64,
    /// Check everything and print the statements; change nothing.
    pub dry_run: bool,
    /// Run even if not approved; steps end `Forced`.
    pub force: bool,
    /// The migration undoes a newer one, so it need not be the latest.
    pub rollback: bool,
    /// Run every statement directly, never through the online tool.
    pub disable_online_tool: bool,
    /// Run Delete and Modify steps instead of skipping them. Without it, an
    /// Add that rebuilds an object whose Delete was skipped is skipped too.
    pub allow_destructive: bool,
    pub sandbox: bool,
}

impl ExecOptions {
    pub fn new(migration_id: i64) -> Self {
        Self {
            migration_id,
            ..Self::default()
        }
    }

    /// Options seeded from configured defaults.
    pub fn from_defaults(migration_id: i64, defaults: &ExecutionDefaults) -> Self {
        Self {
            migration_id,
            allow_destructive: defaults.allow_destructive,
            disable_online_tool: defaults.disable_online_tool,
            ..Self::default()
        }
    }
}

/// Why a migration didn't run to completion.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// No migration has this id.
    #[error("migration {id} not found")]
    NotFound { id: i64 },

    /// The migration was superseded; not even force runs it.
    #[error("migration {id} is depreciated and can never run")]
    Depreciated { id: i64 },

    /// The migration isn't approved and the run wasn't forced.
    #[error("migration {id} is {status}, not approved")]
    NotApproved { id: i64, status: MigrationStatus },

    /// A newer migration exists for the project. Outside a dry run the
    /// migration is marked depreciated.
    #[error("migration {id} ({version}) is not the latest version; {latest} is")]
    Stale {
        id: i64,
        version: String,
        latest: String,
    },

    /// Another migration is in progress.
    #[error("migration {running} is already in progress; not starting {id}")]
    AlreadyRunning { id: i64, running: i64 },

    /// A statement failed. The step and the migration are marked failed.
    #[error("step {step_id} of migration {migration_id} failed: {message}")]
    StepFailed {
        migration_id: i64,
        step_id: i64,
        message: String,
    },

    /// Reading or persisting state failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs migrations against a target database.
pub struct MigrationRunner<'a, M, I> {
    migrations: &'a M,
    identity: &'a I,
    direct: Arc<dyn StatementExecutor>,
    online: Option<Arc<dyn StatementExecutor>>,
    printer: Arc<dyn StatementExecutor>,
}

impl<'a, M, I> MigrationRunner<'a, M, I>
where
    M: MigrationStore,
    I: IdentityStore,
{
    pub fn new(migrations: &'a M, identity: &'a I, direct: Arc<dyn StatementExecutor>) -> Self {
        Self {
            migrations,
            identity,
            direct,
            online: None,
            printer: Arc::new(PrintExecutor),
        }
    }

    /// Route alterations through an online-schema-change executor.
    pub fn with_online(mut self, online: Arc<dyn StatementExecutor>) -> Self {
        self.online = Some(online);
        self
    }

    /// Replace the executor used for dry runs.
    pub fn with_printer(mut self, printer: Arc<dyn StatementExecutor>) -> Self {
        self.printer = printer;
        self
    }

    /// Run a migration. Returns it with the statuses it ended with.
    pub async fn run(&self, options: &ExecOptions) -> Result<Migration, ExecError> {
        let id = options.migration_id;
        let mut migration = self
            .migrations
            .get_migration(id)
            .await?
            .ok_or(ExecError::NotFound { id })?;

        self.check_preconditions(&migration, options).await?;

        if !options.dry_run {
            self.migrations
                .update_migration_status(id, MigrationStatus::InProgress)
                .await?;
            migration.status = MigrationStatus::InProgress;
        }
        tracing::info!(
            id,
            project = %migration.project,
            version = %migration.version,
            steps = migration.steps.len(),
            dry_run = options.dry_run,
            "running migration"
        );

        let add_targets: Vec<(usize, i64)> = migration
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.operation == Operation::Add)
            .map(|(i, s)| (i, s.metadata_id))
            .collect();

        // Objects whose destructive steps were skipped. A later Add of the
        // same object rebuilds what was kept, so it is skipped with them.
        let mut kept: HashSet<i64> = HashSet::new();

        for position in 0..migration.steps.len() {
            let step = &mut migration.steps[position];
            if step.status.is_done() {
                if step.status == StepStatus::Skipped && step.operation != Operation::Add {
                    kept.insert(step.metadata_id);
                }
                tracing::debug!(step = step.id, status = %step.status, "step already done");
                continue;
            }

            let rebuilds_kept = step.operation == Operation::Add && kept.contains(&step.metadata_id);
            if (step.operation != Operation::Add || rebuilds_kept) && !options.allow_destructive {
                tracing::warn!(
                    step = step.id,
                    operation = %step.operation,
                    name = %step.name,
                    rebuild = rebuilds_kept,
                    "skipping destructive step"
                );
                kept.insert(step.metadata_id);
                step.status = StepStatus::Skipped;
                if !options.dry_run {
                    self.migrations.update_step(step).await?;
                }
                continue;
            }

            let executor = self.executor_for(step, options);
            if !options.dry_run {
                step.status = StepStatus::InProgress;
                self.migrations.update_step(step).await?;
            }

            let result = executor.execute(&step.forward, options.dry_run).await;
            match result {
                Ok(output) => {
                    step.output = output;
                    if options.dry_run {
                        continue;
                    }
                    step.status = if options.force {
                        StepStatus::Forced
                    } else {
                        StepStatus::Complete
                    };
                    self.migrations.update_step(step).await?;
                    tracing::info!(
                        step = step.id,
                        executor = executor.name(),
                        output = %step.output,
                        "step complete"
                    );

                    let recreated = add_targets
                        .iter()
                        .any(|(i, mid)| *i > position && *mid == step.metadata_id);
                    let step = step.clone();
                    self.record_identity(&step, recreated).await?;
                }
                Err(err) => {
                    let message = err.to_string();
                    step.output = message.clone();
                    step.status = StepStatus::Failed;
                    tracing::error!(
                        migration = id,
                        step = step.id,
                        executor = executor.name(),
                        error = %message,
                        "step failed"
                    );
                    let failed = ExecError::StepFailed {
                        migration_id: id,
                        step_id: step.id,
                        message,
                    };
                    if !options.dry_run {
                        self.migrations.update_step(step).await?;
                        self.migrations
                            .update_migration_status(id, MigrationStatus::Failed)
                            .await?;
                    }
                    return Err(failed);
                }
            }
        }

        if !options.dry_run {
            let status = if options.rollback {
                MigrationStatus::Rollback
            } else if options.force {
                MigrationStatus::Forced
            } else {
                MigrationStatus::Complete
            };
            self.migrations.update_migration_status(id, status).await?;
            migration.status = status;
            tracing::info!(id, status = %status, "migration finished");
        }
        Ok(migration)
    }

    async fn check_preconditions(
        &self,
        migration: &Migration,
        options: &ExecOptions,
    ) -> Result<(), ExecError> {
        let id = migration.id;
        if migration.status == MigrationStatus::Depreciated {
            return Err(ExecError::Depreciated { id });
        }
        if migration.status != MigrationStatus::Approved && !options.force {
            return Err(ExecError::NotApproved {
                id,
                status: migration.status,
            });
        }

        if !options.rollback && !options.sandbox {
            let latest = self.migrations.latest_migration(&migration.project).await?;
            if let Some(latest) = latest.filter(|l| l.id != id) {
                if !options.dry_run {
                    self.migrations
                        .update_migration_status(id, MigrationStatus::Depreciated)
                        .await?;
                }
                tracing::warn!(
                    id,
                    version = %migration.version,
                    latest = %latest.version,
                    "migration superseded; marked depreciated"
                );
                return Err(ExecError::Stale {
                    id,
                    version: migration.version.clone(),
                    latest: latest.version,
                });
            }
        }

        let running = self
            .migrations
            .with_status(MigrationStatus::InProgress)
            .await?;
        if let Some(other) = running.iter().find(|m| m.id != id) {
            return Err(ExecError::AlreadyRunning {
                id,
                running: other.id,
            });
        }
        Ok(())
    }

    fn executor_for(&self, step: &Step, options: &ExecOptions) -> &dyn StatementExecutor {
        if options.dry_run {
            return self.printer.as_ref();
        }
        let whole_table = step.kind == EntityKind::Table && step.operation != Operation::Modify;
        match &self.online {
            Some(online) if !whole_table && !options.disable_online_tool => online.as_ref(),
            _ => self.direct.as_ref(),
        }
    }

    /// Bring identity records in line with a step that has just run.
    async fn record_identity(&self, step: &Step, recreated: bool) -> Result<(), StoreError> {
        let Some(mut record) = self.identity.get(step.metadata_id).await? else {
            tracing::warn!(
                step = step.id,
                metadata = step.metadata_id,
                "no identity record for step"
            );
            return Ok(());
        };

        match step.operation {
            Operation::Add if record.kind == EntityKind::Table => {
                for mut row in self.identity.list_for_table(&record.property_id).await? {
                    row.exists = true;
                    self.identity.update(&row).await?;
                }
            }
            Operation::Add => {
                record.exists = true;
                record.name = step.name.clone();
                self.identity.update(&record).await?;
            }
            Operation::Modify => {
                record.name = step.name.clone();
                record.exists = true;
                self.identity.update(&record).await?;
            }
            Operation::Delete if recreated => {
                record.exists = false;
                self.identity.update(&record).await?;
            }
            Operation::Delete if record.kind == EntityKind::Table => {
                for row in self.identity.list_for_table(&record.property_id).await? {
                    self.identity.delete(row.id).await?;
                }
            }
            Operation::Delete => self.identity.delete(record.id).await?,
        }
        Ok(())
    }
}
