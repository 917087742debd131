//! Postgres-backed store.
//!
//! Bookkeeping lives in three tables inside a dedicated schema:
//! `keel_metadata`, `keel_migration` and `keel_step`. [`PostgresStore::init_schema`]
//! creates them if they don't exist yet.

use super::{IdentityStore, MigrationStore, StoreError};
use crate::diff::Operation;
use crate::migration::{Migration, MigrationStatus, Step, StepStatus};
use crate::traced::{TracedClient, TracedPool};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use keel_config::StoreConfig;
use keel_schema::{EntityKind, Metadata, PropertyId};
use tokio_postgres::{NoTls, Row};

const METADATA_COLUMNS: &str = "id, database_id, property_id, parent_id, kind, name, present";
const MIGRATION_COLUMNS: &str = "id, database_id, project, version, version_timestamp, \
     version_description, status, created_at, sandbox";
const STEP_COLUMNS: &str = "id, migration_id, operation, kind, metadata_id, name, \
     forward_sql, backward_sql, output, status";

/// Identity and migration store on Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: TracedPool,
    schema: String,
}

impl PostgresStore {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool: TracedPool::new(pool),
            schema: schema.into(),
        }
    }

    /// Build a connection pool from configuration.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = config.url.parse()?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr).max_size(config.pool_size).build()?;
        tracing::debug!(
            url = %keel_config::mask_password(&config.url),
            schema = %config.schema,
            "created store pool"
        );
        Ok(Self::new(pool, config.schema.clone()))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", pg_ident(&self.schema), name)
    }

    /// Create the bookkeeping schema and tables.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let schema = pg_ident(&self.schema);
        let ddl = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.keel_metadata (
    id BIGSERIAL PRIMARY KEY,
    database_id BIGINT NOT NULL,
    property_id TEXT NOT NULL,
    parent_id TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    present BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS keel_metadata_property_idx
    ON {schema}.keel_metadata (property_id);

CREATE INDEX IF NOT EXISTS keel_metadata_parent_idx
    ON {schema}.keel_metadata (parent_id, name);

CREATE TABLE IF NOT EXISTS {schema}.keel_migration (
    id BIGSERIAL PRIMARY KEY,
    database_id BIGINT NOT NULL,
    project TEXT NOT NULL,
    version TEXT NOT NULL,
    version_timestamp TIMESTAMPTZ NOT NULL,
    version_description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    sandbox BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE INDEX IF NOT EXISTS keel_migration_project_idx
    ON {schema}.keel_migration (project, version_timestamp);

CREATE TABLE IF NOT EXISTS {schema}.keel_step (
    id BIGSERIAL PRIMARY KEY,
    migration_id BIGINT NOT NULL REFERENCES {schema}.keel_migration (id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    operation TEXT NOT NULL,
    kind TEXT NOT NULL,
    metadata_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    forward_sql TEXT NOT NULL,
    backward_sql TEXT NOT NULL DEFAULT '',
    output TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL
);
"#
        );
        let conn = self.pool.get().await?;
        conn.batch_execute(&ddl).await?;
        tracing::info!(schema = %self.schema, "initialized store schema");
        Ok(())
    }

    async fn insert_with_steps(
        &self,
        conn: &TracedClient,
        migration: &mut Migration,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (database_id, project, version, version_timestamp, \
             version_description, status, created_at, sandbox) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            self.table("keel_migration")
        );
        let row = conn
            .query_one(
                &sql,
                &[
                    &migration.database_id,
                    &migration.project,
                    &migration.version,
                    &migration.version_timestamp,
                    &migration.version_description,
                    &migration.status.as_str(),
                    &migration.timestamp,
                    &migration.sandbox,
                ],
            )
            .await?;
        migration.id = row.get(0);

        let sql = format!(
            "INSERT INTO {} (migration_id, position, operation, kind, metadata_id, name, \
             forward_sql, backward_sql, output, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            self.table("keel_step")
        );
        for (position, step) in migration.steps.iter_mut().enumerate() {
            step.migration_id = migration.id;
            let position = position as i32;
            let row = conn
                .query_one(
                    &sql,
                    &[
                        &step.migration_id,
                        &position,
                        &step.operation.as_str(),
                        &step.kind.as_str(),
                        &step.metadata_id,
                        &step.name,
                        &step.forward,
                        &step.backward,
                        &step.output,
                        &step.status.as_str(),
                    ],
                )
                .await?;
            step.id = row.get(0);
        }
        Ok(())
    }

    async fn migration_headers(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Migration>, StoreError> {
        let sql = format!(
            "SELECT {MIGRATION_COLUMNS} FROM {} WHERE {filter}",
            self.table("keel_migration")
        );
        let conn = self.pool.get().await?;
        conn.query(&sql, params)
            .await?
            .iter()
            .map(migration_from_row)
            .collect()
    }
}

/// Quote a Postgres identifier.
fn pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn metadata_from_row(row: &Row) -> Result<Metadata, StoreError> {
    let id: i64 = row.get("id");
    let kind: String = row.get("kind");
    let kind = EntityKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
        entity: "metadata",
        id,
        message: format!("unknown kind {kind:?}"),
    })?;
    Ok(Metadata {
        id,
        database_id: row.get("database_id"),
        property_id: PropertyId::new(row.get::<_, String>("property_id")),
        parent_id: PropertyId::new(row.get::<_, String>("parent_id")),
        kind,
        name: row.get("name"),
        exists: row.get("present"),
    })
}

fn migration_from_row(row: &Row) -> Result<Migration, StoreError> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    let status = MigrationStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
        entity: "migration",
        id,
        message: format!("unknown status {status:?}"),
    })?;
    Ok(Migration {
        id,
        database_id: row.get("database_id"),
        project: row.get("project"),
        version: row.get("version"),
        version_timestamp: row.get("version_timestamp"),
        version_description: row.get("version_description"),
        status,
        timestamp: row.get("created_at"),
        sandbox: row.get("sandbox"),
        steps: Vec::new(),
    })
}

fn step_from_row(row: &Row) -> Result<Step, StoreError> {
    let id: i64 = row.get("id");
    let corrupt = |message: String| StoreError::Corrupt {
        entity: "step",
        id,
        message,
    };
    let operation: String = row.get("operation");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(Step {
        id,
        migration_id: row.get("migration_id"),
        operation: Operation::parse(&operation)
            .ok_or_else(|| corrupt(format!("unknown operation {operation:?}")))?,
        kind: EntityKind::parse(&kind).ok_or_else(|| corrupt(format!("unknown kind {kind:?}")))?,
        metadata_id: row.get("metadata_id"),
        name: row.get("name"),
        forward: row.get("forward_sql"),
        backward: row.get("backward_sql"),
        output: row.get("output"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("unknown status {status:?}")))?,
    })
}

impl IdentityStore for PostgresStore {
    async fn get(&self, id: i64) -> Result<Option<Metadata>, StoreError> {
        let sql = format!(
            "SELECT {METADATA_COLUMNS} FROM {} WHERE id = $1",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        conn.query_opt(&sql, &[&id])
            .await?
            .as_ref()
            .map(metadata_from_row)
            .transpose()
    }

    async fn insert(&self, metadata: &Metadata) -> Result<i64, StoreError> {
        let sql = format!(
            "INSERT INTO {} (database_id, property_id, parent_id, kind, name, present) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &sql,
                &[
                    &metadata.database_id,
                    &metadata.property_id.as_str(),
                    &metadata.parent_id.as_str(),
                    &metadata.kind.as_str(),
                    &metadata.name,
                    &metadata.exists,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn update(&self, metadata: &Metadata) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET database_id = $2, property_id = $3, parent_id = $4, kind = $5, \
             name = $6, present = $7 WHERE id = $1",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        let affected = conn
            .execute(
                &sql,
                &[
                    &metadata.id,
                    &metadata.database_id,
                    &metadata.property_id.as_str(),
                    &metadata.parent_id.as_str(),
                    &metadata.kind.as_str(),
                    &metadata.name,
                    &metadata.exists,
                ],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "metadata",
                id: metadata.id,
            });
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table("keel_metadata"));
        let conn = self.pool.get().await?;
        conn.execute(&sql, &[&id]).await?;
        Ok(())
    }

    async fn find_table(&self, name: &str) -> Result<Option<Metadata>, StoreError> {
        let sql = format!(
            "SELECT {METADATA_COLUMNS} FROM {} WHERE kind = $1 AND name = $2 \
             ORDER BY id DESC LIMIT 1",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        conn.query_opt(&sql, &[&EntityKind::Table.as_str(), &name])
            .await?
            .as_ref()
            .map(metadata_from_row)
            .transpose()
    }

    async fn find_child(
        &self,
        parent: &PropertyId,
        name: &str,
    ) -> Result<Vec<Metadata>, StoreError> {
        let sql = format!(
            "SELECT {METADATA_COLUMNS} FROM {} WHERE parent_id = $1 AND name = $2 ORDER BY id",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        conn.query(&sql, &[&parent.as_str(), &name])
            .await?
            .iter()
            .map(metadata_from_row)
            .collect()
    }

    async fn list_for_table(&self, table: &PropertyId) -> Result<Vec<Metadata>, StoreError> {
        let sql = format!(
            "SELECT {METADATA_COLUMNS} FROM {} \
             WHERE (kind = $1 AND property_id = $2) OR parent_id = $2 \
             ORDER BY (parent_id <> '') , id",
            self.table("keel_metadata")
        );
        let conn = self.pool.get().await?;
        conn.query(&sql, &[&EntityKind::Table.as_str(), &table.as_str()])
            .await?
            .iter()
            .map(metadata_from_row)
            .collect()
    }
}

impl MigrationStore for PostgresStore {
    async fn create_migration(&self, mut migration: Migration) -> Result<Migration, StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute("BEGIN").await?;
        match self.insert_with_steps(&conn, &mut migration).await {
            Ok(()) => {
                conn.batch_execute("COMMIT").await?;
                Ok(migration)
            }
            Err(e) => {
                if let Err(rollback) = conn.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %rollback, "rollback of migration insert failed");
                }
                Err(e)
            }
        }
    }

    async fn get_migration(&self, id: i64) -> Result<Option<Migration>, StoreError> {
        let sql = format!(
            "SELECT {MIGRATION_COLUMNS} FROM {} WHERE id = $1",
            self.table("keel_migration")
        );
        let conn = self.pool.get().await?;
        let Some(row) = conn.query_opt(&sql, &[&id]).await? else {
            return Ok(None);
        };
        let mut migration = migration_from_row(&row)?;

        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM {} WHERE migration_id = $1 ORDER BY position",
            self.table("keel_step")
        );
        migration.steps = conn
            .query(&sql, &[&id])
            .await?
            .iter()
            .map(step_from_row)
            .collect::<Result<_, _>>()?;
        Ok(Some(migration))
    }

    async fn latest_migration(&self, project: &str) -> Result<Option<Migration>, StoreError> {
        let mut found = self
            .migration_headers(
                "project = $1 ORDER BY version_timestamp DESC, id DESC LIMIT 1",
                &[&project],
            )
            .await?;
        Ok(found.pop())
    }

    async fn find_version(
        &self,
        project: &str,
        version: &str,
    ) -> Result<Option<Migration>, StoreError> {
        let mut found = self
            .migration_headers("project = $1 AND version = $2 LIMIT 1", &[&project, &version])
            .await?;
        Ok(found.pop())
    }

    async fn count(&self, project: &str) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE project = $1",
            self.table("keel_migration")
        );
        let conn = self.pool.get().await?;
        let row = conn.query_one(&sql, &[&project]).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn list(&self, project: &str) -> Result<Vec<Migration>, StoreError> {
        self.migration_headers(
            "project = $1 ORDER BY version_timestamp, id",
            &[&project],
        )
        .await
    }

    async fn with_status(&self, status: MigrationStatus) -> Result<Vec<Migration>, StoreError> {
        self.migration_headers("status = $1 ORDER BY id", &[&status.as_str()])
            .await
    }

    async fn update_migration_status(
        &self,
        id: i64,
        status: MigrationStatus,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $2 WHERE id = $1",
            self.table("keel_migration")
        );
        let conn = self.pool.get().await?;
        let affected = conn.execute(&sql, &[&id, &status.as_str()]).await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "migration",
                id,
            });
        }
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $2, output = $3 WHERE id = $1",
            self.table("keel_step")
        );
        let conn = self.pool.get().await?;
        let affected = conn
            .execute(&sql, &[&step.id, &step.status.as_str(), &step.output])
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "step",
                id: step.id,
            });
        }
        Ok(())
    }
}
