//! In-process store for tests and sandboxes.

use super::{IdentityStore, MigrationStore, StoreError};
use crate::migration::{Migration, MigrationStatus, Step};
use keel_schema::{EntityKind, Metadata, PropertyId};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Both stores held in memory behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_metadata_id: i64,
    metadata: BTreeMap<i64, Metadata>,
    last_migration_id: i64,
    last_step_id: i64,
    migrations: BTreeMap<i64, Migration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All identity records, ordered by id.
    pub fn metadata(&self) -> Vec<Metadata> {
        self.lock().metadata.values().cloned().collect()
    }
}

fn header(migration: &Migration) -> Migration {
    Migration {
        steps: Vec::new(),
        ..migration.clone()
    }
}

impl IdentityStore for MemoryStore {
    async fn get(&self, id: i64) -> Result<Option<Metadata>, StoreError> {
        Ok(self.lock().metadata.get(&id).cloned())
    }

    async fn insert(&self, metadata: &Metadata) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        inner.last_metadata_id += 1;
        let id = inner.last_metadata_id;
        let mut record = metadata.clone();
        record.id = id;
        inner.metadata.insert(id, record);
        Ok(id)
    }

    async fn update(&self, metadata: &Metadata) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.metadata.get_mut(&metadata.id) {
            Some(record) => {
                *record = metadata.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "metadata",
                id: metadata.id,
            }),
        }
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.lock().metadata.remove(&id);
        Ok(())
    }

    async fn find_table(&self, name: &str) -> Result<Option<Metadata>, StoreError> {
        Ok(self
            .lock()
            .metadata
            .values()
            .find(|m| m.kind == EntityKind::Table && m.name == name)
            .cloned())
    }

    async fn find_child(
        &self,
        parent: &PropertyId,
        name: &str,
    ) -> Result<Vec<Metadata>, StoreError> {
        Ok(self
            .lock()
            .metadata
            .values()
            .filter(|m| &m.parent_id == parent && m.name == name)
            .cloned()
            .collect())
    }

    async fn list_for_table(&self, table: &PropertyId) -> Result<Vec<Metadata>, StoreError> {
        let inner = self.lock();
        let own = inner
            .metadata
            .values()
            .filter(|m| m.kind == EntityKind::Table && &m.property_id == table);
        let children = inner.metadata.values().filter(|m| &m.parent_id == table);
        Ok(own.chain(children).cloned().collect())
    }
}

impl MigrationStore for MemoryStore {
    async fn create_migration(&self, mut migration: Migration) -> Result<Migration, StoreError> {
        let mut inner = self.lock();
        inner.last_migration_id += 1;
        migration.id = inner.last_migration_id;
        for step in &mut migration.steps {
            inner.last_step_id += 1;
            step.id = inner.last_step_id;
            step.migration_id = migration.id;
        }
        inner.migrations.insert(migration.id, migration.clone());
        Ok(migration)
    }

    async fn get_migration(&self, id: i64) -> Result<Option<Migration>, StoreError> {
        Ok(self.lock().migrations.get(&id).cloned())
    }

    async fn latest_migration(&self, project: &str) -> Result<Option<Migration>, StoreError> {
        Ok(self
            .lock()
            .migrations
            .values()
            .filter(|m| m.project == project)
            .max_by_key(|m| (m.version_timestamp, m.id))
            .map(header))
    }

    async fn find_version(
        &self,
        project: &str,
        version: &str,
    ) -> Result<Option<Migration>, StoreError> {
        Ok(self
            .lock()
            .migrations
            .values()
            .find(|m| m.project == project && m.version == version)
            .map(header))
    }

    async fn count(&self, project: &str) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .migrations
            .values()
            .filter(|m| m.project == project)
            .count() as u64)
    }

    async fn list(&self, project: &str) -> Result<Vec<Migration>, StoreError> {
        let mut out: Vec<Migration> = self
            .lock()
            .migrations
            .values()
            .filter(|m| m.project == project)
            .map(header)
            .collect();
        out.sort_by_key(|m| (m.version_timestamp, m.id));
        Ok(out)
    }

    async fn with_status(&self, status: MigrationStatus) -> Result<Vec<Migration>, StoreError> {
        Ok(self
            .lock()
            .migrations
            .values()
            .filter(|m| m.status == status)
            .map(header)
            .collect())
    }

    async fn update_migration_status(
        &self,
        id: i64,
        status: MigrationStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let migration = inner.migrations.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "migration",
            id,
        })?;
        migration.status = status;
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .migrations
            .get_mut(&step.migration_id)
            .and_then(|m| m.steps.iter_mut().find(|s| s.id == step.id))
            .ok_or(StoreError::NotFound {
                entity: "step",
                id: step.id,
            })?;
        stored.status = step.status;
        stored.output = step.output.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(table: &str, pid: &str, name: &str) -> Metadata {
        let mut m = Metadata::new(EntityKind::Column, pid, name);
        m.parent_id = PropertyId::new(table);
        m
    }

    #[tokio::test]
    async fn test_identity_lookups() {
        let store = MemoryStore::new();
        let table = store
            .insert(&Metadata::new(EntityKind::Table, "t-dogs", "dogs"))
            .await
            .unwrap();
        store.insert(&column("t-dogs", "c-id", "id")).await.unwrap();
        store.insert(&column("t-cats", "c-id2", "id")).await.unwrap();

        assert_eq!(store.find_table("dogs").await.unwrap().unwrap().id, table);
        assert!(store.find_table("id").await.unwrap().is_none());

        let hits = store.find_child(&PropertyId::new("t-dogs"), "id").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].property_id.as_str(), "c-id");

        let all = store.list_for_table(&PropertyId::new("t-dogs")).await.unwrap();
        let names: Vec<&str> = all.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["dogs", "id"]);
    }

    #[tokio::test]
    async fn test_update_missing_metadata_fails() {
        let store = MemoryStore::new();
        let mut m = column("t", "c", "c");
        m.id = 42;
        assert!(matches!(
            store.update(&m).await,
            Err(StoreError::NotFound { id: 42, .. })
        ));
    }
}
