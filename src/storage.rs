use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::{Entity, TargetIdentity, VersionedEntity};
use crate::commit::mutation::Mutation;
use crate::error::RemodbError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// One target's new snapshot inside a committed batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchEntry {
    pub target: TargetIdentity,
    pub snapshot: VersionedEntity,
    pub mutations: Vec<Mutation>,
}

/// Everything one transaction changed, tagged with its catalog commit version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedBatch {
    pub catalog: String,
    pub catalog_version: u64,
    pub transaction_id: u64,
    pub entries: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistAck {
    pub catalog_version: u64,
}

/// Persistence collaborator. Calls are short and synchronous; the commit
/// pipeline invokes `persist` from its own task, strictly in commit order.
pub trait StorageEngine: Send + Sync + 'static {
    /// Catalog schema when `entity` is `None`, otherwise that entity.
    fn read_snapshot(
        &self,
        catalog: &str,
        entity: Option<(&str, u32)>,
    ) -> Result<Option<VersionedEntity>, RemodbError>;

    fn persist(&self, batch: &VersionedBatch) -> Result<PersistAck, RemodbError>;

    fn current_schema_state(&self, catalog: &str) -> Result<CatalogSchema, RemodbError>;

    /// Last catalog version acknowledged by `persist`.
    fn catalog_version(&self, catalog: &str) -> Result<u64, RemodbError>;

    fn catalog_names(&self) -> Vec<String>;

    fn entities(&self, catalog: &str) -> Result<Vec<Arc<Entity>>, RemodbError>;

    fn drop_catalog(&self, catalog: &str) -> Result<(), RemodbError>;
}

#[derive(Debug, Default)]
struct StoredCatalog {
    version: u64,
    schema: Option<Arc<CatalogSchema>>,
    entities: BTreeMap<(String, u32), Arc<Entity>>,
}

/// Map-backed storage for tests and embedders without a storage engine.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    catalogs: RwLock<HashMap<String, StoredCatalog>>,
    fail_next: AtomicUsize,
    persisted: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` persist calls fail.
    pub fn fail_next_persist(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn persisted_batches(&self) -> u64 {
        self.persisted.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StorageEngine for InMemoryStorage {
    fn read_snapshot(
        &self,
        catalog: &str,
        entity: Option<(&str, u32)>,
    ) -> Result<Option<VersionedEntity>, RemodbError> {
        let catalogs = self.catalogs.read();
        let Some(stored) = catalogs.get(catalog) else {
            return Ok(None);
        };
        Ok(match entity {
            None => stored.schema.clone().map(VersionedEntity::CatalogSchema),
            Some((entity_type, primary_key)) => stored
                .entities
                .get(&(entity_type.to_string(), primary_key))
                .map(|entity| VersionedEntity::Entity {
                    catalog: catalog.to_string(),
                    entity: Arc::clone(entity),
                }),
        })
    }

    fn persist(&self, batch: &VersionedBatch) -> Result<PersistAck, RemodbError> {
        if self.take_injected_failure() {
            return Err(RemodbError::Persistence {
                catalog: batch.catalog.clone(),
                message: format!("injected failure at version {}", batch.catalog_version),
            });
        }
        let mut catalogs = self.catalogs.write();
        let stored = catalogs.entry(batch.catalog.clone()).or_default();
        for entry in &batch.entries {
            match &entry.snapshot {
                VersionedEntity::CatalogSchema(schema) => stored.schema = Some(Arc::clone(schema)),
                VersionedEntity::Entity { entity, .. } => {
                    let key = (entity.entity_type.clone(), entity.primary_key);
                    if entity.version == 0 {
                        stored.entities.remove(&key);
                    } else {
                        stored.entities.insert(key, Arc::clone(entity));
                    }
                }
            }
        }
        stored.version = stored.version.max(batch.catalog_version);
        self.persisted.fetch_add(1, Ordering::SeqCst);
        Ok(PersistAck {
            catalog_version: batch.catalog_version,
        })
    }

    fn current_schema_state(&self, catalog: &str) -> Result<CatalogSchema, RemodbError> {
        self.catalogs
            .read()
            .get(catalog)
            .and_then(|c| c.schema.as_deref().cloned())
            .ok_or_else(|| RemodbError::CatalogNotFound {
                catalog: catalog.to_string(),
            })
    }

    fn catalog_version(&self, catalog: &str) -> Result<u64, RemodbError> {
        self.catalogs
            .read()
            .get(catalog)
            .map(|c| c.version)
            .ok_or_else(|| RemodbError::CatalogNotFound {
                catalog: catalog.to_string(),
            })
    }

    fn catalog_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .catalogs
            .read()
            .iter()
            .filter(|(_, c)| c.schema.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn entities(&self, catalog: &str) -> Result<Vec<Arc<Entity>>, RemodbError> {
        let catalogs = self.catalogs.read();
        let stored = catalogs
            .get(catalog)
            .ok_or_else(|| RemodbError::CatalogNotFound {
                catalog: catalog.to_string(),
            })?;
        Ok(stored.entities.values().cloned().collect())
    }

    fn drop_catalog(&self, catalog: &str) -> Result<(), RemodbError> {
        self.catalogs.write().remove(catalog);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchEntry, InMemoryStorage, StorageEngine, VersionedBatch};
    use crate::catalog::schema::CatalogSchema;
    use crate::catalog::types::{Entity, TargetIdentity, VersionedEntity};
    use std::sync::Arc;

    fn batch(version: u64) -> VersionedBatch {
        let mut entity = Entity::empty("product", 1);
        entity.version = version;
        VersionedBatch {
            catalog: "products".into(),
            catalog_version: version,
            transaction_id: version,
            entries: vec![
                BatchEntry {
                    target: TargetIdentity::schema("products"),
                    snapshot: VersionedEntity::CatalogSchema(Arc::new(CatalogSchema::new(
                        "products",
                    ))),
                    mutations: Vec::new(),
                },
                BatchEntry {
                    target: TargetIdentity::entity("products", "product", 1),
                    snapshot: VersionedEntity::Entity {
                        catalog: "products".into(),
                        entity: Arc::new(entity),
                    },
                    mutations: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn persisted_batches_are_readable() {
        let storage = InMemoryStorage::new();
        storage.persist(&batch(1)).expect("persist");
        assert_eq!(storage.catalog_version("products").expect("version"), 1);
        let snapshot = storage
            .read_snapshot("products", Some(("product", 1)))
            .expect("read")
            .expect("present");
        assert_eq!(snapshot.version(), 1);
        assert_eq!(storage.catalog_names(), vec!["products".to_string()]);
        assert_eq!(storage.entities("products").expect("entities").len(), 1);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let storage = InMemoryStorage::new();
        storage.fail_next_persist(1);
        assert!(storage.persist(&batch(1)).is_err());
        storage.persist(&batch(1)).expect("second attempt");
        assert_eq!(storage.persisted_batches(), 1);
        storage.drop_catalog("products").expect("drop");
        assert!(storage.catalog_names().is_empty());
    }
}
