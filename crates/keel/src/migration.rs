//! Migrations, their steps, and the builder that turns a plan into a
//! persisted migration.

use crate::diff::Operation;
use crate::plan::PlannedOp;
use crate::store::{IdentityStore, MigrationStore, StoreError};
use chrono::{DateTime, Utc};
use keel_schema::{EntityKind, Metadata, PropertyId};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStatus {
    Unapproved,
    Approved,
    InProgress,
    Complete,
    Failed,
    Skipped,
    Forced,
    /// Superseded by a newer version; can never run.
    Depreciated,
    /// Finished as a rollback.
    Rollback,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Unapproved => "unapproved",
            MigrationStatus::Approved => "approved",
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Complete => "complete",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Skipped => "skipped",
            MigrationStatus::Forced => "forced",
            MigrationStatus::Depreciated => "depreciated",
            MigrationStatus::Rollback => "rollback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unapproved" => Some(MigrationStatus::Unapproved),
            "approved" => Some(MigrationStatus::Approved),
            "in_progress" => Some(MigrationStatus::InProgress),
            "complete" => Some(MigrationStatus::Complete),
            "failed" => Some(MigrationStatus::Failed),
            "skipped" => Some(MigrationStatus::Skipped),
            "forced" => Some(MigrationStatus::Forced),
            "depreciated" => Some(MigrationStatus::Depreciated),
            "rollback" => Some(MigrationStatus::Rollback),
            _ => None,
        }
    }

    /// Statuses after which the migration has nothing left to run.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Complete
                | MigrationStatus::Skipped
                | MigrationStatus::Forced
                | MigrationStatus::Depreciated
                | MigrationStatus::Rollback
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Skipped,
    Forced,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Forced => "forced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "in_progress" => Some(StepStatus::InProgress),
            "complete" => Some(StepStatus::Complete),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            "forced" => Some(StepStatus::Forced),
            _ => None,
        }
    }

    /// A step in one of these statuses is not run again on resume.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            StepStatus::Complete | StepStatus::Skipped | StepStatus::Forced
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned, approvable unit of schema change.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub id: i64,
    pub database_id: i64,
    pub project: String,
    pub version: String,
    pub version_timestamp: DateTime<Utc>,
    pub version_description: String,
    pub status: MigrationStatus,
    /// When the migration was created.
    pub timestamp: DateTime<Utc>,
    pub sandbox: bool,
    /// Steps in execution order. Empty for headers returned by listings.
    pub steps: Vec<Step>,
}

/// One statement of a migration, with its inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: i64,
    pub migration_id: i64,
    pub operation: Operation,
    /// Kind of the target object.
    pub kind: EntityKind,
    /// Identity record of the target object.
    pub metadata_id: i64,
    /// Name of the target object after the step has run.
    pub name: String,
    pub forward: String,
    pub backward: String,
    pub output: String,
    pub status: StepStatus,
}

/// Everything needed to build a migration from a plan.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub database_id: i64,
    pub project: String,
    pub version: String,
    pub version_timestamp: DateTime<Utc>,
    pub description: String,
    pub forward: Vec<PlannedOp>,
    /// Inverse of `forward`, index for index.
    pub backward: Vec<PlannedOp>,
    pub rollback: bool,
    pub sandbox: bool,
}

/// Errors raised while building or approving a migration.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("migration {version} already exists for project {project}")]
    DuplicateVersion { project: String, version: String },

    #[error(
        "version {version} ({timestamp}) is not newer than the latest version {latest} ({latest_timestamp})"
    )]
    StaleVersion {
        version: String,
        timestamp: DateTime<Utc>,
        latest: String,
        latest_timestamp: DateTime<Utc>,
    },

    #[error("migration {version} has no operations")]
    Empty { version: String },

    #[error("migration {id} not found")]
    NotFound { id: i64 },

    #[error("migration {id} is {status}; only unapproved migrations can be approved")]
    NotApprovable { id: i64, status: MigrationStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create and persist a migration from planned operations.
///
/// Outside a sandbox the version must be new for the project and, unless this
/// is a rollback, strictly newer than the latest version. Identity records
/// referenced by the operations are inserted (as not yet existing) if they
/// haven't been persisted yet.
pub async fn new_migration<M, I>(
    migrations: &M,
    identity: &I,
    request: MigrationRequest,
) -> Result<Migration, BuildError>
where
    M: MigrationStore,
    I: IdentityStore,
{
    if request.forward.is_empty() {
        return Err(BuildError::Empty {
            version: request.version,
        });
    }

    if !request.sandbox {
        if migrations
            .find_version(&request.project, &request.version)
            .await?
            .is_some()
        {
            return Err(BuildError::DuplicateVersion {
                project: request.project,
                version: request.version,
            });
        }

        if !request.rollback {
            if let Some(latest) = migrations.latest_migration(&request.project).await? {
                if request.version_timestamp <= latest.version_timestamp {
                    return Err(BuildError::StaleVersion {
                        version: request.version,
                        timestamp: request.version_timestamp,
                        latest: latest.version,
                        latest_timestamp: latest.version_timestamp,
                    });
                }
            }
        }
    }

    let mut ids: HashMap<PropertyId, i64> = HashMap::new();
    let mut steps = Vec::with_capacity(request.forward.len());

    for (position, op) in request.forward.iter().enumerate() {
        let metadata_id =
            ensure_metadata(identity, request.database_id, &op.metadata, &mut ids).await?;
        for child in &op.children {
            ensure_metadata(identity, request.database_id, child, &mut ids).await?;
        }

        let backward = request
            .backward
            .get(position)
            .map(|b| b.statement.clone())
            .unwrap_or_default();

        steps.push(Step {
            id: 0,
            migration_id: 0,
            operation: op.operation,
            kind: op.metadata.kind,
            metadata_id,
            name: op.name.clone(),
            forward: op.statement.clone(),
            backward,
            output: String::new(),
            status: StepStatus::Pending,
        });
    }

    let status = if request.sandbox {
        MigrationStatus::Approved
    } else {
        MigrationStatus::Unapproved
    };

    let migration = Migration {
        id: 0,
        database_id: request.database_id,
        project: request.project,
        version: request.version,
        version_timestamp: request.version_timestamp,
        version_description: request.description,
        status,
        timestamp: Utc::now(),
        sandbox: request.sandbox,
        steps,
    };

    let migration = migrations.create_migration(migration).await?;
    tracing::info!(
        id = migration.id,
        project = %migration.project,
        version = %migration.version,
        steps = migration.steps.len(),
        status = %migration.status,
        "created migration"
    );
    Ok(migration)
}

/// Return the identity id for `metadata`, inserting a provisional record when
/// none exists yet.
async fn ensure_metadata<I: IdentityStore>(
    identity: &I,
    database_id: i64,
    metadata: &Metadata,
    ids: &mut HashMap<PropertyId, i64>,
) -> Result<i64, StoreError> {
    if metadata.is_persisted() {
        return Ok(metadata.id);
    }
    if let Some(id) = ids.get(&metadata.property_id) {
        return Ok(*id);
    }

    let table = if metadata.kind == EntityKind::Table {
        &metadata.property_id
    } else {
        &metadata.parent_id
    };
    let existing = identity
        .list_for_table(table)
        .await?
        .into_iter()
        .find(|m| m.property_id == metadata.property_id && m.kind == metadata.kind);

    let id = match existing {
        Some(m) => m.id,
        None => {
            let mut record = metadata.clone();
            record.database_id = database_id;
            record.exists = false;
            let id = identity.insert(&record).await?;
            tracing::debug!(id, property_id = %record.property_id, kind = %record.kind, "inserted identity record");
            id
        }
    };

    ids.insert(metadata.property_id.clone(), id);
    Ok(id)
}

/// Approve an unapproved migration.
pub async fn approve<M: MigrationStore>(migrations: &M, id: i64) -> Result<(), BuildError> {
    let migration = migrations
        .get_migration(id)
        .await?
        .ok_or(BuildError::NotFound { id })?;

    if migration.status != MigrationStatus::Unapproved {
        return Err(BuildError::NotApprovable {
            id,
            status: migration.status,
        });
    }

    migrations
        .update_migration_status(id, MigrationStatus::Approved)
        .await?;
    tracing::info!(id, version = %migration.version, "approved migration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn op(name: &str) -> PlannedOp {
        let mut metadata = Metadata::new(EntityKind::Column, format!("c-{name}"), name);
        metadata.parent_id = PropertyId::new("t-dogs");
        PlannedOp {
            operation: Operation::Add,
            table: "dogs".into(),
            name: name.into(),
            statement: format!("ALTER TABLE `dogs` ADD COLUMN `{name}` int NOT NULL"),
            metadata,
            children: Vec::new(),
        }
    }

    fn request(version: &str, day: u32) -> MigrationRequest {
        MigrationRequest {
            database_id: 1,
            project: "kennel".into(),
            version: version.into(),
            version_timestamp: ts(day),
            description: "add columns".into(),
            forward: vec![op("age"), op("weight")],
            backward: vec![],
            rollback: false,
            sandbox: false,
        }
    }

    #[tokio::test]
    async fn test_new_migration_is_unapproved_with_pending_steps() {
        let store = MemoryStore::new();
        let migration = new_migration(&store, &store, request("v1", 1)).await.unwrap();

        assert_ne!(migration.id, 0);
        assert_eq!(migration.status, MigrationStatus::Unapproved);
        assert_eq!(migration.steps.len(), 2);
        assert!(migration.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(migration.steps.iter().all(|s| s.backward.is_empty()));

        let record = store.get(migration.steps[0].metadata_id).await.unwrap().unwrap();
        assert_eq!(record.name, "age");
        assert_eq!(record.database_id, 1);
        assert!(!record.exists);
    }

    #[tokio::test]
    async fn test_sandbox_is_preapproved() {
        let store = MemoryStore::new();
        let mut req = request("v1", 1);
        req.sandbox = true;
        let migration = new_migration(&store, &store, req).await.unwrap();
        assert_eq!(migration.status, MigrationStatus::Approved);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = MemoryStore::new();
        new_migration(&store, &store, request("v1", 1)).await.unwrap();
        let err = new_migration(&store, &store, request("v1", 2)).await.unwrap_err();
        assert!(matches!(err, BuildError::DuplicateVersion { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_stale_version_rejected_unless_rollback() {
        let store = MemoryStore::new();
        new_migration(&store, &store, request("v2", 2)).await.unwrap();

        let err = new_migration(&store, &store, request("v1", 1)).await.unwrap_err();
        assert!(matches!(err, BuildError::StaleVersion { .. }), "{err}");

        let err = new_migration(&store, &store, request("v2b", 2)).await.unwrap_err();
        assert!(matches!(err, BuildError::StaleVersion { .. }), "{err}");

        let mut req = request("v1", 1);
        req.rollback = true;
        new_migration(&store, &store, req).await.unwrap();
    }

    #[tokio::test]
    async fn test_sandbox_skips_version_checks() {
        let store = MemoryStore::new();
        new_migration(&store, &store, request("v2", 2)).await.unwrap();
        let mut req = request("v2", 1);
        req.sandbox = true;
        new_migration(&store, &store, req).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_migration_rejected() {
        let store = MemoryStore::new();
        let mut req = request("v1", 1);
        req.forward.clear();
        let err = new_migration(&store, &store, req).await.unwrap_err();
        assert!(matches!(err, BuildError::Empty { .. }));
        assert_eq!(store.count("kennel").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shared_property_id_inserted_once() {
        let store = MemoryStore::new();
        let mut req = request("v1", 1);
        let mut again = op("age");
        again.operation = Operation::Modify;
        req.forward.push(again);

        let migration = new_migration(&store, &store, req).await.unwrap();
        assert_eq!(migration.steps[0].metadata_id, migration.steps[2].metadata_id);
        let records = store.list_for_table(&PropertyId::new("t-dogs")).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_persisted_metadata_reused() {
        let store = MemoryStore::new();
        let mut existing = Metadata::new(EntityKind::Column, "c-age", "age");
        existing.parent_id = PropertyId::new("t-dogs");
        existing.exists = true;
        let id = store.insert(&existing).await.unwrap();

        let migration = new_migration(&store, &store, request("v1", 1)).await.unwrap();
        assert_eq!(migration.steps[0].metadata_id, id);
        assert!(store.get(id).await.unwrap().unwrap().exists);
    }

    #[tokio::test]
    async fn test_approve_only_from_unapproved() {
        let store = MemoryStore::new();
        let migration = new_migration(&store, &store, request("v1", 1)).await.unwrap();

        approve(&store, migration.id).await.unwrap();
        let approved = store.get_migration(migration.id).await.unwrap().unwrap();
        assert_eq!(approved.status, MigrationStatus::Approved);

        let err = approve(&store, migration.id).await.unwrap_err();
        assert!(matches!(err, BuildError::NotApprovable { .. }));
        assert!(matches!(
            approve(&store, 999).await.unwrap_err(),
            BuildError::NotFound { id: 999 }
        ));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            MigrationStatus::Unapproved,
            MigrationStatus::InProgress,
            MigrationStatus::Depreciated,
            MigrationStatus::Rollback,
        ] {
            assert_eq!(MigrationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::parse("forced"), Some(StepStatus::Forced));
        assert_eq!(StepStatus::parse("done"), None);
        assert!(StepStatus::Skipped.is_done());
        assert!(!StepStatus::Failed.is_done());
    }
}
