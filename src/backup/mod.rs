pub mod archive;

use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::{Entity, EntityReference, TargetIdentity, VersionedEntity};
use crate::catalog::{CatalogHandle, CatalogRegistry, CatalogState};
use crate::cdc::CaptureHub;
use crate::commit::mutation::{AssociatedDataMutation, AttributeMutation, Mutation, ReferenceMutation};
use crate::commit::validation::validate_entity_mutation;
use crate::config::RemodbConfig;
use crate::error::RemodbError;
use crate::storage::{BatchEntry, VersionedBatch};
use crate::traffic::now_micros;
use archive::{BackupPayload, decode_archive, encode_archive};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

const RESTORE_OUTCOME_BUFFER: usize = 64;
/// Completed uploads remembered to reject late chunks.
const TRIGGERED_UPLOAD_HISTORY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadChunk {
    /// Omitted on the first chunk to have one generated.
    pub file_id: Option<Uuid>,
    pub catalog_name: String,
    pub bytes: Vec<u8>,
    pub total_size_in_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadProgress {
    pub file_id: Uuid,
    pub catalog_name: String,
    pub accumulated_bytes: u64,
    pub total_size_in_bytes: u64,
    pub restore_triggered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestoreStatus {
    Restored { reference: EntityReference },
    Failed { code: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreEntityOutcome {
    pub entity_type: String,
    pub primary_key: u32,
    pub status: RestoreStatus,
}

impl RestoreEntityOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RestoreStatus::Restored { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RestoreResult {
    /// The archive held one entity and it was restored.
    Single(EntityReference),
    PerEntity {
        catalog: String,
        catalog_version: u64,
        outcomes: Vec<RestoreEntityOutcome>,
    },
}

pub struct UploadResponse {
    pub progress: UploadProgress,
    /// Present on the chunk that completed the upload.
    pub restore: Option<RestoreHandle>,
}

/// Handle on a running restore. Outcomes are streamed in archive order.
pub struct RestoreHandle {
    file_id: Uuid,
    catalog: String,
    outcomes: mpsc::Receiver<RestoreEntityOutcome>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<Result<RestoreResult, RemodbError>>,
}

impl RestoreHandle {
    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub async fn next_outcome(&mut self) -> Option<RestoreEntityOutcome> {
        self.outcomes.recv().await
    }

    /// Asks the restore to stop before its next entity.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Waits for the restore to end. Outcomes not pulled yet are discarded.
    pub async fn finish(mut self) -> Result<RestoreResult, RemodbError> {
        while self.outcomes.recv().await.is_some() {}
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RemodbError::Cancelled(format!("restore task ended: {e}"))),
        }
    }
}

struct UploadTask {
    catalog_name: String,
    total_size_in_bytes: u64,
    buffer: Vec<u8>,
    triggered: bool,
}

/// Catalog backups and chunked restores. Uploads accumulate per file id until
/// the declared size is reached, then the restore starts exactly once as a
/// background task streaming one outcome per entity.
pub struct BackupController {
    registry: Arc<CatalogRegistry>,
    hub: Arc<CaptureHub>,
    config: Arc<RemodbConfig>,
    uploads: Mutex<HashMap<Uuid, Arc<Mutex<UploadTask>>>>,
    triggered: Mutex<VecDeque<Uuid>>,
}

impl BackupController {
    pub fn new(
        registry: Arc<CatalogRegistry>,
        hub: Arc<CaptureHub>,
        config: Arc<RemodbConfig>,
    ) -> Self {
        Self {
            registry,
            hub,
            config,
            uploads: Mutex::new(HashMap::new()),
            triggered: Mutex::new(VecDeque::new()),
        }
    }

    /// Archives the visible state of a catalog.
    pub fn backup_catalog(&self, name: &str) -> Result<Vec<u8>, RemodbError> {
        let catalog = self.registry.get(name)?;
        let state = catalog.state();
        if state != CatalogState::Alive {
            return Err(RemodbError::CatalogInWrongState {
                catalog: name.to_string(),
                state: state.to_string(),
                expected: CatalogState::Alive.to_string(),
            });
        }
        let catalog_version = catalog.visible_version();
        let schema = catalog.schema()?;
        let entities: Vec<Entity> = catalog
            .visible_entities()?
            .into_iter()
            .map(|e| (*e).clone())
            .collect();
        let entity_count = entities.len();
        let payload = BackupPayload::new(
            name,
            catalog_version,
            now_micros(),
            (*schema).clone(),
            entities,
        );
        let bytes = encode_archive(&payload, self.config.signing_key())?;
        info!(
            catalog = %name,
            catalog_version,
            entity_count,
            bytes = bytes.len(),
            signed = self.config.signing_key().is_some(),
            "catalog backup created"
        );
        Ok(bytes)
    }

    /// Accepts one chunk. The chunk that completes the upload starts the
    /// restore and returns its handle.
    pub fn upload_chunk(&self, chunk: UploadChunk) -> Result<UploadResponse, RemodbError> {
        let file_id = chunk.file_id.unwrap_or_else(Uuid::new_v4);
        let task = self.task_for(file_id, &chunk)?;
        let Some(mut guard) = task.try_lock() else {
            self.uploads.lock().remove(&file_id);
            warn!(%file_id, "concurrent chunk upload, discarding upload task");
            return Err(RemodbError::ConcurrentUploadViolation { file_id });
        };
        if guard.triggered {
            return Err(RemodbError::RestoreAlreadyTriggered { file_id });
        }
        if guard.catalog_name != chunk.catalog_name {
            return Err(RemodbError::Validation(format!(
                "upload {file_id} targets catalog '{}', chunk names '{}'",
                guard.catalog_name, chunk.catalog_name
            )));
        }
        let accumulated = guard.buffer.len() as u64 + chunk.bytes.len() as u64;
        if accumulated > guard.total_size_in_bytes {
            let expected = guard.total_size_in_bytes;
            drop(guard);
            self.uploads.lock().remove(&file_id);
            return Err(RemodbError::BackupSizeExceeded {
                file_id,
                expected,
                actual: accumulated,
            });
        }
        guard.buffer.extend_from_slice(&chunk.bytes);

        let mut progress = UploadProgress {
            file_id,
            catalog_name: guard.catalog_name.clone(),
            accumulated_bytes: accumulated,
            total_size_in_bytes: guard.total_size_in_bytes,
            restore_triggered: false,
        };
        if accumulated < guard.total_size_in_bytes {
            return Ok(UploadResponse {
                progress,
                restore: None,
            });
        }

        guard.triggered = true;
        let bytes = std::mem::take(&mut guard.buffer);
        let catalog_name = guard.catalog_name.clone();
        drop(guard);
        self.uploads.lock().remove(&file_id);
        self.remember_triggered(file_id);
        if self.registry.contains(&catalog_name) {
            return Err(RemodbError::CatalogNameConflict {
                catalog: catalog_name,
            });
        }
        progress.restore_triggered = true;
        info!(%file_id, catalog = %catalog_name, bytes = bytes.len(), "restore triggered");
        let restore = self.spawn_restore(file_id, catalog_name, bytes);
        Ok(UploadResponse {
            progress,
            restore: Some(restore),
        })
    }

    fn task_for(
        &self,
        file_id: Uuid,
        chunk: &UploadChunk,
    ) -> Result<Arc<Mutex<UploadTask>>, RemodbError> {
        if self.triggered.lock().contains(&file_id) {
            return Err(RemodbError::RestoreAlreadyTriggered { file_id });
        }
        let mut uploads = self.uploads.lock();
        if let Some(task) = uploads.get(&file_id) {
            return Ok(Arc::clone(task));
        }
        if self.registry.contains(&chunk.catalog_name) {
            return Err(RemodbError::CatalogNameConflict {
                catalog: chunk.catalog_name.clone(),
            });
        }
        if chunk.total_size_in_bytes == 0 {
            return Err(RemodbError::Validation(
                "declared backup size must be positive".into(),
            ));
        }
        if chunk.total_size_in_bytes > self.config.max_backup_bytes {
            return Err(RemodbError::Validation(format!(
                "declared backup size {} exceeds the limit of {} bytes",
                chunk.total_size_in_bytes, self.config.max_backup_bytes
            )));
        }
        let task = Arc::new(Mutex::new(UploadTask {
            catalog_name: chunk.catalog_name.clone(),
            total_size_in_bytes: chunk.total_size_in_bytes,
            buffer: Vec::new(),
            triggered: false,
        }));
        uploads.insert(file_id, Arc::clone(&task));
        Ok(task)
    }

    fn remember_triggered(&self, file_id: Uuid) {
        let mut triggered = self.triggered.lock();
        if triggered.len() == TRIGGERED_UPLOAD_HISTORY {
            triggered.pop_front();
        }
        triggered.push_back(file_id);
    }

    /// Uploads still accumulating chunks.
    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    fn spawn_restore(&self, file_id: Uuid, catalog: String, bytes: Vec<u8>) -> RestoreHandle {
        let (tx, rx) = mpsc::channel(RESTORE_OUTCOME_BUFFER);
        let cancel = Arc::new(AtomicBool::new(false));
        let job = RestoreJob {
            registry: Arc::clone(&self.registry),
            hub: Arc::clone(&self.hub),
            signing_key: self.config.signing_key().map(<[u8]>::to_vec),
            catalog: catalog.clone(),
            cancel: Arc::clone(&cancel),
            outcomes: tx,
        };
        let task = tokio::spawn(async move { job.run(file_id, bytes).await });
        RestoreHandle {
            file_id,
            catalog,
            outcomes: rx,
            cancel,
            task,
        }
    }
}

struct RestoreJob {
    registry: Arc<CatalogRegistry>,
    hub: Arc<CaptureHub>,
    signing_key: Option<Vec<u8>>,
    catalog: String,
    cancel: Arc<AtomicBool>,
    outcomes: mpsc::Sender<RestoreEntityOutcome>,
}

impl RestoreJob {
    async fn run(self, file_id: Uuid, bytes: Vec<u8>) -> Result<RestoreResult, RemodbError> {
        let mut payload = decode_archive(&bytes, self.signing_key.as_deref())?;
        drop(bytes);
        payload.schema.name = self.catalog.clone();
        let catalog_version = payload.catalog_version;
        let schema = payload.schema.clone();
        let handle = self
            .registry
            .begin_restore(&self.catalog, payload.schema, catalog_version)?;

        match self
            .restore_entities(&handle, &schema, payload.entities, catalog_version)
            .await
        {
            Ok(result) => {
                self.hub.register_catalog(&self.catalog, catalog_version);
                handle.set_state(CatalogState::Alive);
                info!(%file_id, catalog = %self.catalog, catalog_version, "restore finished");
                Ok(result)
            }
            Err(err) => {
                error!(%file_id, catalog = %self.catalog, error = %err, "restore failed, removing catalog");
                if let Err(cleanup) = self.registry.remove(&self.catalog) {
                    warn!(catalog = %self.catalog, error = %cleanup, "failed to drop partially restored catalog");
                }
                self.hub.forget_catalog(&self.catalog);
                Err(err)
            }
        }
    }

    async fn restore_entities(
        &self,
        handle: &CatalogHandle,
        schema: &CatalogSchema,
        entities: Vec<Entity>,
        catalog_version: u64,
    ) -> Result<RestoreResult, RemodbError> {
        let mut restored = Vec::new();
        let mut outcomes = Vec::with_capacity(entities.len());
        for entity in entities {
            if self.cancel.load(Ordering::Acquire) {
                return Err(RemodbError::Cancelled(format!(
                    "restore of catalog '{}' cancelled",
                    self.catalog
                )));
            }
            let status = match validate_restored_entity(&self.catalog, schema, &entity) {
                Ok(()) => {
                    let reference = entity.to_reference();
                    restored.push(Arc::new(entity.clone()));
                    RestoreStatus::Restored { reference }
                }
                Err(err) => RestoreStatus::Failed {
                    code: err.code_str().to_string(),
                    message: err.to_string(),
                },
            };
            let outcome = RestoreEntityOutcome {
                entity_type: entity.entity_type,
                primary_key: entity.primary_key,
                status,
            };
            // A dropped handle only stops streaming; the restore itself goes on.
            let _ = self.outcomes.send(outcome.clone()).await;
            outcomes.push(outcome);
        }

        let mut entries = vec![BatchEntry {
            target: TargetIdentity::schema(self.catalog.clone()),
            snapshot: VersionedEntity::CatalogSchema(Arc::new(schema.clone())),
            mutations: Vec::new(),
        }];
        entries.extend(restored.iter().map(|entity| BatchEntry {
            target: TargetIdentity::entity(
                self.catalog.clone(),
                entity.entity_type.clone(),
                entity.primary_key,
            ),
            snapshot: VersionedEntity::Entity {
                catalog: self.catalog.clone(),
                entity: Arc::clone(entity),
            },
            mutations: Vec::new(),
        }));
        handle.storage().persist(&VersionedBatch {
            catalog: self.catalog.clone(),
            catalog_version,
            transaction_id: 0,
            entries,
        })?;
        handle.install_restored(catalog_version, restored);

        if let [only] = outcomes.as_slice() {
            if let RestoreStatus::Restored { reference } = &only.status {
                return Ok(RestoreResult::Single(reference.clone()));
            }
        }
        Ok(RestoreResult::PerEntity {
            catalog: self.catalog.clone(),
            catalog_version,
            outcomes,
        })
    }
}

/// Checks a restored entity against the restored schema the same way a
/// mutation writing the same content would be checked.
fn validate_restored_entity(
    catalog: &str,
    schema: &CatalogSchema,
    entity: &Entity,
) -> Result<(), RemodbError> {
    let target = TargetIdentity::entity(catalog, entity.entity_type.clone(), entity.primary_key);
    if entity.primary_key == 0 || entity.version == 0 {
        return Err(RemodbError::InvalidMutation {
            target,
            reason: "restored entity needs a positive primary key and version".into(),
        });
    }
    let mut mutations = Vec::new();
    for (key, value) in &entity.attributes {
        mutations.push(Mutation::Attribute(AttributeMutation::Upsert {
            name: key.name.clone(),
            locale: key.locale.clone(),
            value: value.clone(),
        }));
    }
    for (key, value) in &entity.associated_data {
        mutations.push(Mutation::AssociatedData(AssociatedDataMutation::Upsert {
            name: key.name.clone(),
            locale: key.locale.clone(),
            value: value.clone(),
        }));
    }
    for (key, state) in &entity.references {
        mutations.push(Mutation::Reference(ReferenceMutation::Insert {
            name: key.name.clone(),
            primary_key: key.primary_key,
        }));
        for (field, value) in &state.attributes {
            mutations.push(Mutation::Reference(ReferenceMutation::Attribute {
                name: key.name.clone(),
                primary_key: key.primary_key,
                mutation: AttributeMutation::Upsert {
                    name: field.name.clone(),
                    locale: field.locale.clone(),
                    value: value.clone(),
                },
            }));
        }
    }
    if schema.entity_schema(&entity.entity_type).is_none() {
        return Err(RemodbError::InvalidMutation {
            target,
            reason: format!("entity schema '{}' does not exist", entity.entity_type),
        });
    }
    for mutation in &mutations {
        validate_entity_mutation(schema, &target, mutation)?;
    }
    Ok(())
}
