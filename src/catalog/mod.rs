pub mod schema;
pub mod types;

use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::{Entity, TargetIdentity, VersionedEntity};
use crate::config::RemodbConfig;
use crate::error::RemodbError;
use crate::storage::{BatchEntry, StorageEngine, VersionedBatch};
use crate::version_store::{ReadViewGuard, VersionStore};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CatalogState {
    Alive,
    Restoring,
}

impl fmt::Display for CatalogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogState::Alive => f.write_str("ALIVE"),
            CatalogState::Restoring => f.write_str("RESTORING"),
        }
    }
}

/// Mutable catalog state guarded by the catalog's write lock.
///
/// `commit_seq` is the last assigned catalog version, `durable_seq` the last
/// one storage acknowledged and `visible_seq` the last one readers observe.
/// `epoch` changes whenever a persistence failure aborts queued commits.
#[derive(Debug)]
pub(crate) struct CatalogInner {
    pub(crate) state: CatalogState,
    schema: VersionStore,
    entities: HashMap<(String, u32), VersionStore>,
    pub(crate) commit_seq: u64,
    pub(crate) durable_seq: u64,
    pub(crate) visible_seq: u64,
    pub(crate) epoch: u64,
    max_versions: usize,
    min_version_age_ms: u64,
}

impl CatalogInner {
    pub(crate) fn write_head(
        &mut self,
        catalog: &str,
        storage: &dyn StorageEngine,
        target: &TargetIdentity,
    ) -> Result<VersionedEntity, RemodbError> {
        let store = self.store_mut(catalog, storage, target)?;
        store
            .write_head()
            .cloned()
            .ok_or_else(|| RemodbError::Validation(format!("no write head for {target}")))
    }

    /// Schema the next commit validates against.
    pub(crate) fn head_schema(&self) -> Result<Arc<CatalogSchema>, RemodbError> {
        self.schema
            .write_head()
            .and_then(VersionedEntity::as_schema)
            .cloned()
            .ok_or_else(|| RemodbError::Validation("catalog schema is not loaded".into()))
    }

    pub(crate) fn install(&mut self, seq: u64, target: &TargetIdentity, snapshot: VersionedEntity) {
        let visible = self.visible_seq;
        match target {
            TargetIdentity::CatalogSchema { .. } => self.schema.publish(seq, snapshot, visible),
            TargetIdentity::Entity {
                entity_type,
                primary_key,
                ..
            } => {
                let (max_versions, min_age) = (self.max_versions, self.min_version_age_ms);
                self.entities
                    .entry((entity_type.clone(), *primary_key))
                    .or_insert_with(|| VersionStore::new(max_versions, min_age))
                    .publish(seq, snapshot, visible);
            }
        }
    }

    /// Drops every pending snapshot from commits after `seq`.
    pub(crate) fn abort_after(&mut self, seq: u64) {
        self.schema.truncate_after(seq);
        self.entities.retain(|_, store| !store.truncate_after(seq));
        self.commit_seq = seq;
        self.epoch += 1;
    }

    fn gc(&mut self) {
        let visible = self.visible_seq;
        self.schema.gc(visible);
        for store in self.entities.values_mut() {
            store.gc(visible);
        }
    }

    fn visible(
        &mut self,
        catalog: &str,
        storage: &dyn StorageEngine,
        target: &TargetIdentity,
    ) -> Result<ReadViewGuard, RemodbError> {
        let visible = self.visible_seq;
        self.store_mut(catalog, storage, target)?
            .acquire_visible(visible)
    }

    fn store_mut(
        &mut self,
        catalog: &str,
        storage: &dyn StorageEngine,
        target: &TargetIdentity,
    ) -> Result<&mut VersionStore, RemodbError> {
        match target {
            TargetIdentity::CatalogSchema { .. } => Ok(&mut self.schema),
            TargetIdentity::Entity {
                entity_type,
                primary_key,
                ..
            } => {
                let key = (entity_type.clone(), *primary_key);
                if !self.entities.contains_key(&key) {
                    let snapshot = storage
                        .read_snapshot(catalog, Some((entity_type, *primary_key)))?
                        .unwrap_or_else(|| VersionedEntity::absent(target));
                    let mut store = VersionStore::new(self.max_versions, self.min_version_age_ms);
                    store.bootstrap(0, snapshot);
                    self.entities.insert(key.clone(), store);
                }
                self.entities
                    .get_mut(&key)
                    .ok_or_else(|| RemodbError::Validation(format!("no version store for {target}")))
            }
        }
    }
}

/// One catalog: its schema, the entities written since load, and the heads
/// that drive optimistic checks and reader visibility.
pub struct CatalogHandle {
    name: String,
    storage: Arc<dyn StorageEngine>,
    inner: Mutex<CatalogInner>,
    visible_tx: watch::Sender<u64>,
    next_transaction_id: AtomicU64,
}

impl fmt::Debug for CatalogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl CatalogHandle {
    fn new(
        name: String,
        storage: Arc<dyn StorageEngine>,
        schema: CatalogSchema,
        catalog_version: u64,
        state: CatalogState,
        config: &RemodbConfig,
    ) -> Self {
        let mut schema_store = VersionStore::new(config.max_versions, config.min_version_age_ms);
        schema_store.bootstrap(
            catalog_version,
            VersionedEntity::CatalogSchema(Arc::new(schema)),
        );
        let (visible_tx, _) = watch::channel(catalog_version);
        Self {
            name,
            storage,
            inner: Mutex::new(CatalogInner {
                state,
                schema: schema_store,
                entities: HashMap::new(),
                commit_seq: catalog_version,
                durable_seq: catalog_version,
                visible_seq: catalog_version,
                epoch: 0,
                max_versions: config.max_versions,
                min_version_age_ms: config.min_version_age_ms,
            }),
            visible_tx,
            next_transaction_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CatalogState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: CatalogState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CatalogInner> {
        self.inner.lock()
    }

    pub(crate) fn next_transaction_id(&self) -> u64 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn visible_version(&self) -> u64 {
        self.inner.lock().visible_seq
    }

    pub fn durable_version(&self) -> u64 {
        self.inner.lock().durable_seq
    }

    pub fn watch_visible(&self) -> watch::Receiver<u64> {
        self.visible_tx.subscribe()
    }

    /// Returns false when `epoch` was invalidated by an earlier failure.
    pub(crate) fn mark_durable(&self, seq: u64, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.durable_seq = inner.durable_seq.max(seq);
        true
    }

    pub(crate) fn mark_visible(&self, seq: u64) {
        let mut inner = self.inner.lock();
        inner.visible_seq = inner.visible_seq.max(seq);
        let visible = inner.visible_seq;
        drop(inner);
        self.visible_tx.send_replace(visible);
    }

    pub(crate) fn is_current_epoch(&self, epoch: u64) -> bool {
        self.inner.lock().epoch == epoch
    }

    pub(crate) fn gc(&self) {
        self.inner.lock().gc();
    }

    /// Snapshot of `target` as readers currently see it.
    pub fn read(&self, target: &TargetIdentity) -> Result<VersionedEntity, RemodbError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .visible(&self.name, self.storage.as_ref(), target)?
            .to_snapshot())
    }

    /// Pins the visible snapshot of `target`; it survives pruning until the
    /// guard is dropped.
    pub fn pin(&self, target: &TargetIdentity) -> Result<ReadViewGuard, RemodbError> {
        let mut inner = self.inner.lock();
        inner.visible(&self.name, self.storage.as_ref(), target)
    }

    /// A specific retained version of `target`, for readers that started
    /// before later commits became visible.
    pub fn read_at_version(
        &self,
        target: &TargetIdentity,
        version: u64,
    ) -> Result<VersionedEntity, RemodbError> {
        let mut inner = self.inner.lock();
        let visible = inner.visible_seq;
        let store = inner.store_mut(&self.name, self.storage.as_ref(), target)?;
        Ok(store.acquire_at_version(version, visible)?.to_snapshot())
    }

    pub fn schema(&self) -> Result<Arc<CatalogSchema>, RemodbError> {
        let snapshot = self.read(&TargetIdentity::schema(self.name.clone()))?;
        snapshot
            .as_schema()
            .cloned()
            .ok_or_else(|| RemodbError::Validation("schema target returned an entity".into()))
    }

    /// Visible entities: persisted ones overlaid with what is in memory.
    pub fn visible_entities(&self) -> Result<Vec<Arc<Entity>>, RemodbError> {
        let persisted = match self.storage.entities(&self.name) {
            Ok(entities) => entities,
            Err(RemodbError::CatalogNotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let mut merged: BTreeMap<(String, u32), Arc<Entity>> = persisted
            .into_iter()
            .map(|e| ((e.entity_type.clone(), e.primary_key), e))
            .collect();
        let inner = self.inner.lock();
        for (key, store) in &inner.entities {
            match store.acquire_visible(inner.visible_seq) {
                Ok(view) => match view.snapshot().as_entity() {
                    Some(entity) if entity.version > 0 => {
                        merged.insert(key.clone(), Arc::clone(entity));
                    }
                    _ => {
                        merged.remove(key);
                    }
                },
                Err(_) => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Installs restored content as durable and visible state at
    /// `catalog_version`.
    pub(crate) fn install_restored(&self, catalog_version: u64, entities: Vec<Arc<Entity>>) {
        let mut inner = self.inner.lock();
        for entity in entities {
            let key = (entity.entity_type.clone(), entity.primary_key);
            let mut store = VersionStore::new(inner.max_versions, inner.min_version_age_ms);
            store.bootstrap(
                catalog_version,
                VersionedEntity::Entity {
                    catalog: self.name.clone(),
                    entity,
                },
            );
            inner.entities.insert(key, store);
        }
        inner.commit_seq = catalog_version;
        inner.durable_seq = catalog_version;
        inner.visible_seq = catalog_version;
        drop(inner);
        self.visible_tx.send_replace(catalog_version);
    }
}

/// Name-keyed set of catalogs sharing one storage engine.
pub struct CatalogRegistry {
    catalogs: RwLock<HashMap<String, Arc<CatalogHandle>>>,
    storage: Arc<dyn StorageEngine>,
    config: Arc<RemodbConfig>,
}

impl CatalogRegistry {
    pub fn new(storage: Arc<dyn StorageEngine>, config: Arc<RemodbConfig>) -> Self {
        Self {
            catalogs: RwLock::new(HashMap::new()),
            storage,
            config,
        }
    }

    /// Registers every catalog the storage engine already holds.
    pub fn load_existing(&self) -> Result<usize, RemodbError> {
        let mut loaded = 0;
        for name in self.storage.catalog_names() {
            let schema = self.storage.current_schema_state(&name)?;
            let version = self.storage.catalog_version(&name)?;
            let handle = CatalogHandle::new(
                name.clone(),
                Arc::clone(&self.storage),
                schema,
                version,
                CatalogState::Alive,
                &self.config,
            );
            self.catalogs.write().insert(name.clone(), Arc::new(handle));
            debug!(catalog = %name, version, "catalog loaded");
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Creates an empty catalog and persists its initial schema.
    pub fn define(&self, name: &str) -> Result<Arc<CatalogHandle>, RemodbError> {
        validate_catalog_name(name)?;
        let mut catalogs = self.catalogs.write();
        if catalogs.contains_key(name) {
            return Err(RemodbError::CatalogNameConflict {
                catalog: name.to_string(),
            });
        }
        let mut schema = CatalogSchema::new(name);
        schema.version = 1;
        self.storage.persist(&VersionedBatch {
            catalog: name.to_string(),
            catalog_version: 0,
            transaction_id: 0,
            entries: vec![BatchEntry {
                target: TargetIdentity::schema(name),
                snapshot: VersionedEntity::CatalogSchema(Arc::new(schema.clone())),
                mutations: Vec::new(),
            }],
        })?;
        let handle = Arc::new(CatalogHandle::new(
            name.to_string(),
            Arc::clone(&self.storage),
            schema,
            0,
            CatalogState::Alive,
            &self.config,
        ));
        catalogs.insert(name.to_string(), Arc::clone(&handle));
        info!(catalog = %name, "catalog defined");
        Ok(handle)
    }

    /// Registers a catalog that a restore is still filling in.
    pub(crate) fn begin_restore(
        &self,
        name: &str,
        schema: CatalogSchema,
        catalog_version: u64,
    ) -> Result<Arc<CatalogHandle>, RemodbError> {
        validate_catalog_name(name)?;
        let mut catalogs = self.catalogs.write();
        if catalogs.contains_key(name) || self.storage.catalog_names().iter().any(|n| n == name) {
            return Err(RemodbError::CatalogNameConflict {
                catalog: name.to_string(),
            });
        }
        let handle = Arc::new(CatalogHandle::new(
            name.to_string(),
            Arc::clone(&self.storage),
            schema,
            catalog_version,
            CatalogState::Restoring,
            &self.config,
        ));
        catalogs.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Result<Arc<CatalogHandle>, RemodbError> {
        self.catalogs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RemodbError::CatalogNotFound {
                catalog: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalogs.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.catalogs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<Arc<CatalogHandle>> {
        self.catalogs.read().values().cloned().collect()
    }

    /// Forgets the catalog and drops its persisted state.
    pub(crate) fn remove(&self, name: &str) -> Result<(), RemodbError> {
        self.catalogs.write().remove(name);
        self.storage.drop_catalog(name)
    }
}

fn validate_catalog_name(name: &str) -> Result<(), RemodbError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RemodbError::Validation(format!(
            "invalid catalog name '{name}'"
        )));
    }
    Ok(())
}
