pub mod api;
pub mod backup;
pub mod catalog;
pub mod cdc;
pub mod commit;
pub mod config;
pub mod error;
pub mod session;
pub mod storage;
pub mod sync_bridge;
pub mod traffic;
pub mod version_store;

pub use crate::backup::{
    RestoreEntityOutcome, RestoreHandle, RestoreResult, RestoreStatus, UploadChunk,
    UploadProgress, UploadResponse,
};
pub use crate::catalog::CatalogState;
pub use crate::catalog::types::{Entity, EntityReference, TargetIdentity, Value, VersionedEntity};
pub use crate::cdc::{
    CaptureCriteria, CapturePointer, CaptureResponseType, CaptureStart, ChangeCaptureRecord,
    Subscription,
};
pub use crate::commit::CommitOutcome;
pub use crate::commit::mutation::Mutation;
pub use crate::commit::tx::CommitBehaviour;
pub use crate::config::RemodbConfig;
pub use crate::error::{ErrorCode, RemodbError};
pub use crate::session::{OpenTransactionResponse, SessionInfo, SessionOptions, SessionType};
pub use crate::storage::{InMemoryStorage, StorageEngine};

use crate::backup::BackupController;
use crate::catalog::schema::CatalogSchema;
use crate::catalog::{CatalogHandle, CatalogRegistry};
use crate::cdc::CaptureHub;
use crate::commit::engine::MutationEngine;
use crate::commit::pipeline::CommitPipeline;
use crate::commit::tx::Transaction;
use crate::commit::{CommitContext, commit_transaction, stage_batch};
use crate::session::{Session, SessionManager};
use crate::traffic::{
    TaskStatus, TrafficCriteria, TrafficRecord, TrafficRecordType, TrafficRecorder,
    TrafficRecordingSettings, now_micros,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of submitting one mutation batch through a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationResponse {
    pub transaction_id: u64,
    pub target: TargetIdentity,
    /// Version the target has once the transaction commits.
    pub next_version: u64,
    /// Set when the batch ran as an implicit transaction.
    pub commit: Option<CommitOutcome>,
}

/// Releases the session from its committing state even if the commit future
/// is dropped half way.
struct CommitGuard<'a>(&'a Session);

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_commit();
    }
}

pub struct RemodbInstance {
    config: Arc<RemodbConfig>,
    catalogs: Arc<CatalogRegistry>,
    engine: MutationEngine,
    hub: Arc<CaptureHub>,
    pipeline: CommitPipeline,
    sessions: Arc<SessionManager>,
    traffic: TrafficRecorder,
    backups: BackupController,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemodbInstance {
    /// Opens an instance over `storage`. Must be called from within a tokio
    /// runtime; the commit pipeline and maintenance loops run as tasks.
    pub fn open(
        config: RemodbConfig,
        storage: Arc<dyn StorageEngine>,
    ) -> Result<Self, RemodbError> {
        config.validate()?;
        info!(
            default_commit_behaviour = ?config.default_commit_behaviour,
            commit_queue_capacity = config.commit_queue_capacity,
            commit_timeout_ms = config.commit_timeout_ms,
            max_versions = config.max_versions,
            min_version_age_ms = config.min_version_age_ms,
            version_gc_interval_ms = config.version_gc_interval_ms,
            capture_ring_capacity = config.capture_ring_capacity,
            subscriber_buffer_capacity = config.subscriber_buffer_capacity,
            capture_heartbeat_interval_ms = config.capture_heartbeat_interval_ms,
            session_inactivity_timeout_ms = config.session_inactivity_timeout_ms,
            traffic_buffer_capacity = config.traffic_buffer_capacity,
            max_backup_bytes = config.max_backup_bytes,
            backup_signing_enabled = config.signing_key().is_some(),
            "remodb config"
        );
        let config = Arc::new(config);
        let catalogs = Arc::new(CatalogRegistry::new(storage, Arc::clone(&config)));
        let loaded = catalogs.load_existing()?;
        let hub = Arc::new(CaptureHub::new(
            config.capture_ring_capacity,
            config.subscriber_buffer_capacity,
            config.heartbeat_interval(),
        ));
        for catalog in catalogs.all() {
            hub.register_catalog(catalog.name(), catalog.visible_version());
        }
        let pipeline = CommitPipeline::start(Arc::clone(&hub), config.commit_queue_capacity);
        let sessions = Arc::new(SessionManager::new());
        let backups = BackupController::new(
            Arc::clone(&catalogs),
            Arc::clone(&hub),
            Arc::clone(&config),
        );

        let instance = Self {
            traffic: TrafficRecorder::new(config.traffic_buffer_capacity),
            config,
            catalogs,
            engine: MutationEngine,
            hub,
            pipeline,
            sessions,
            backups,
            background_tasks: Mutex::new(Vec::new()),
        };
        instance.spawn_maintenance();
        info!(catalogs = loaded, "remodb opened");
        Ok(instance)
    }

    pub fn open_in_memory(config: RemodbConfig) -> Result<Self, RemodbError> {
        Self::open(config, Arc::new(InMemoryStorage::new()))
    }

    fn spawn_maintenance(&self) {
        let sweep_sessions = Arc::clone(&self.sessions);
        let sweep_interval = Duration::from_millis(self.config.session_sweep_interval_ms);
        let inactivity = Duration::from_millis(self.config.session_inactivity_timeout_ms);
        let sweep_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                for session_id in sweep_sessions.expired(inactivity) {
                    let Ok(session) = sweep_sessions.remove(session_id) else {
                        continue;
                    };
                    let rolled_back = session.close();
                    warn!(
                        session = %session_id,
                        catalog = %session.catalog().name(),
                        rolled_back_transaction = ?rolled_back,
                        "closing inactive session"
                    );
                }
            }
        });

        let gc_catalogs = Arc::clone(&self.catalogs);
        let gc_interval = Duration::from_millis(self.config.version_gc_interval_ms.max(1));
        let gc_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(gc_interval).await;
                for catalog in gc_catalogs.all() {
                    catalog.gc();
                }
            }
        });

        let mut tasks = self.background_tasks.lock();
        tasks.push(sweep_handle);
        tasks.push(gc_handle);
    }

    pub fn config(&self) -> &RemodbConfig {
        &self.config
    }

    fn commit_context(&self) -> CommitContext<'_> {
        CommitContext {
            engine: &self.engine,
            hub: &self.hub,
            pipeline: &self.pipeline,
            timeout: self.config.commit_timeout(),
        }
    }

    // ---- catalogs ----

    pub fn define_catalog(&self, name: &str) -> Result<(), RemodbError> {
        let handle = self.catalogs.define(name)?;
        self.hub.register_catalog(name, handle.visible_version());
        Ok(())
    }

    pub fn catalog_names(&self) -> Vec<String> {
        self.catalogs.names()
    }

    pub fn catalog_state(&self, name: &str) -> Result<CatalogState, RemodbError> {
        Ok(self.catalogs.get(name)?.state())
    }

    /// Catalog version currently visible to readers.
    pub fn catalog_version(&self, name: &str) -> Result<u64, RemodbError> {
        Ok(self.catalogs.get(name)?.visible_version())
    }

    fn catalog(&self, name: &str) -> Result<Arc<CatalogHandle>, RemodbError> {
        self.catalogs.get(name)
    }

    // ---- sessions ----

    pub fn open_session(
        &self,
        catalog: &str,
        options: SessionOptions,
    ) -> Result<SessionInfo, RemodbError> {
        let handle = self.catalog(catalog)?;
        let session = Session::open(handle, options, self.config.default_commit_behaviour)?;
        let session = self.sessions.register(session);
        let info = session.info();
        debug!(
            session = %info.id,
            catalog = %info.catalog,
            session_type = ?info.session_type,
            commit_behaviour = ?info.commit_behaviour,
            dry_run = info.dry_run,
            "session opened"
        );
        Ok(info)
    }

    /// Closes the session, rolling back its open transaction if any.
    pub fn close_session(&self, session_id: Uuid) -> Result<Option<u64>, RemodbError> {
        let session = self.sessions.remove(session_id)?;
        let rolled_back = session.close();
        debug!(session = %session_id, rolled_back_transaction = ?rolled_back, "session closed");
        Ok(rolled_back)
    }

    pub fn session_info(&self, session_id: Uuid) -> Result<SessionInfo, RemodbError> {
        Ok(self.sessions.get(session_id)?.info())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    // ---- transactions ----

    pub fn open_transaction(
        &self,
        session_id: Uuid,
    ) -> Result<OpenTransactionResponse, RemodbError> {
        self.sessions.get(session_id)?.open_transaction()
    }

    pub fn set_rollback_only(&self, session_id: Uuid) -> Result<(), RemodbError> {
        self.sessions.get(session_id)?.set_rollback_only()
    }

    /// Submits a batch for one target. With a transaction open the batch is
    /// validated and buffered; otherwise it commits right away as an implicit
    /// transaction using the session's commit behaviour.
    pub async fn apply_mutations(
        &self,
        session_id: Uuid,
        target: TargetIdentity,
        mutations: Vec<Mutation>,
        expected_version: u64,
    ) -> Result<MutationResponse, RemodbError> {
        let started = Instant::now();
        let session = self.sessions.get(session_id)?;
        let catalog = Arc::clone(session.catalog());
        let mutation_count = mutations.len();
        let ((transaction_id, next_version), implicit) = session.with_transaction(|txn| {
            let next = stage_batch(
                &self.engine,
                &catalog,
                txn,
                target.clone(),
                mutations,
                expected_version,
            )?;
            Ok((txn.id(), next))
        })?;

        let commit = match implicit {
            Some(txn) => {
                let _guard = CommitGuard(&session);
                let behaviour = session.commit_behaviour();
                Some(self.finish_transaction(&session, txn, behaviour).await?)
            }
            None => None,
        };

        self.traffic.record(TrafficRecord {
            source_query_id: Uuid::new_v4(),
            session_id,
            catalog: catalog.name().to_string(),
            query: format!("mutate {target} ({mutation_count} mutations)"),
            record_type: TrafficRecordType::Mutation,
            returned_records: 0,
            total_records: mutation_count as u64,
            labels: Vec::new(),
            recorded_at_micros: now_micros(),
            duration_micros: started.elapsed().as_micros() as u64,
        });
        Ok(MutationResponse {
            transaction_id,
            target,
            next_version,
            commit,
        })
    }

    /// Commits the open transaction with the session's commit behaviour.
    pub async fn commit(&self, session_id: Uuid) -> Result<CommitOutcome, RemodbError> {
        let session = self.sessions.get(session_id)?;
        let behaviour = session.commit_behaviour();
        self.commit_session(&session, behaviour).await
    }

    pub async fn commit_with_behaviour(
        &self,
        session_id: Uuid,
        behaviour: CommitBehaviour,
    ) -> Result<CommitOutcome, RemodbError> {
        let session = self.sessions.get(session_id)?;
        self.commit_session(&session, behaviour).await
    }

    async fn commit_session(
        &self,
        session: &Session,
        behaviour: CommitBehaviour,
    ) -> Result<CommitOutcome, RemodbError> {
        let txn = session.take_for_commit()?;
        let _guard = CommitGuard(session);
        self.finish_transaction(session, txn, behaviour).await
    }

    async fn finish_transaction(
        &self,
        session: &Session,
        txn: Transaction,
        behaviour: CommitBehaviour,
    ) -> Result<CommitOutcome, RemodbError> {
        if session.is_dry_run() || txn.is_rollback_only() {
            debug!(
                session = %session.id(),
                transaction_id = txn.id(),
                dry_run = session.is_dry_run(),
                "transaction rolled back instead of committed"
            );
            return Ok(CommitOutcome::rolled_back(txn.id(), behaviour));
        }
        let transaction_id = txn.id();
        let result = commit_transaction(&self.commit_context(), session.catalog(), txn, behaviour).await;
        if let Err(err) = &result {
            debug!(
                session = %session.id(),
                transaction_id,
                code = err.code_str(),
                "commit failed"
            );
        }
        result
    }

    /// Discards the open transaction. Returns its id.
    pub fn rollback(&self, session_id: Uuid) -> Result<u64, RemodbError> {
        let transaction_id = self.sessions.get(session_id)?.rollback()?;
        debug!(session = %session_id, transaction_id, "transaction rolled back");
        Ok(transaction_id)
    }

    // ---- reads ----

    pub fn catalog_schema(&self, session_id: Uuid) -> Result<Arc<CatalogSchema>, RemodbError> {
        self.sessions.get(session_id)?.catalog().schema()
    }

    /// Visible snapshot of any target of the session's catalog.
    pub fn read_target(
        &self,
        session_id: Uuid,
        target: &TargetIdentity,
    ) -> Result<VersionedEntity, RemodbError> {
        let session = self.sessions.get(session_id)?;
        session.catalog().read(target)
    }

    pub fn read_at_version(
        &self,
        session_id: Uuid,
        target: &TargetIdentity,
        version: u64,
    ) -> Result<VersionedEntity, RemodbError> {
        let session = self.sessions.get(session_id)?;
        session.catalog().read_at_version(target, version)
    }

    /// Visible entity, or `None` when it was never written or was removed.
    pub fn get_entity(
        &self,
        session_id: Uuid,
        entity_type: &str,
        primary_key: u32,
    ) -> Result<Option<Arc<Entity>>, RemodbError> {
        let started = Instant::now();
        let session = self.sessions.get(session_id)?;
        let catalog = session.catalog();
        let target = TargetIdentity::entity(catalog.name(), entity_type, primary_key);
        let snapshot = catalog.read(&target)?;
        let entity = snapshot
            .as_entity()
            .filter(|e| e.version > 0)
            .cloned();
        self.traffic.record(TrafficRecord {
            source_query_id: Uuid::new_v4(),
            session_id,
            catalog: catalog.name().to_string(),
            query: format!("fetch {entity_type}#{primary_key}"),
            record_type: TrafficRecordType::Fetch,
            returned_records: u64::from(entity.is_some()),
            total_records: u64::from(entity.is_some()),
            labels: Vec::new(),
            recorded_at_micros: now_micros(),
            duration_micros: started.elapsed().as_micros() as u64,
        });
        Ok(entity)
    }

    // ---- change capture ----

    pub fn subscribe(
        &self,
        criteria: CaptureCriteria,
        start: CaptureStart,
    ) -> Result<Subscription, RemodbError> {
        if let Some(catalog) = criteria.catalog.as_deref() {
            self.catalog(catalog)?;
        }
        self.hub.subscribe(criteria, start)
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    // ---- traffic recording ----

    pub fn start_traffic_recording(
        &self,
        settings: TrafficRecordingSettings,
    ) -> Result<TaskStatus, RemodbError> {
        if let Some(catalog) = settings.catalog.as_deref() {
            self.catalog(catalog)?;
        }
        self.traffic.start_recording(settings)
    }

    pub fn stop_traffic_recording(&self, task_id: Uuid) -> Result<TaskStatus, RemodbError> {
        self.traffic.stop_recording(task_id)
    }

    pub fn traffic_recording_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.traffic.status(task_id)
    }

    /// Reports a query executed by a session to the running recording.
    #[allow(clippy::too_many_arguments)]
    pub fn record_query(
        &self,
        session_id: Uuid,
        source_query_id: Uuid,
        query: impl Into<String>,
        returned_records: u64,
        total_records: u64,
        labels: Vec<(String, String)>,
        duration: Duration,
    ) -> Result<bool, RemodbError> {
        let session = self.sessions.get(session_id)?;
        Ok(self.traffic.record(TrafficRecord {
            source_query_id,
            session_id,
            catalog: session.catalog().name().to_string(),
            query: query.into(),
            record_type: TrafficRecordType::Query,
            returned_records,
            total_records,
            labels,
            recorded_at_micros: now_micros(),
            duration_micros: duration.as_micros() as u64,
        }))
    }

    pub fn list_traffic(&self, limit: usize, criteria: &TrafficCriteria) -> Vec<TrafficRecord> {
        self.traffic.list(limit, criteria)
    }

    pub fn list_traffic_label_names(&self, limit: usize) -> Vec<String> {
        self.traffic.list_label_names(limit)
    }

    pub fn list_traffic_label_values(
        &self,
        label_name: &str,
        limit: usize,
        value_starts_with: Option<&str>,
    ) -> Vec<String> {
        self.traffic
            .list_label_values(label_name, limit, value_starts_with)
    }

    // ---- backup / restore ----

    pub fn backup_catalog(&self, name: &str) -> Result<Vec<u8>, RemodbError> {
        self.backups.backup_catalog(name)
    }

    pub fn upload_backup_chunk(&self, chunk: UploadChunk) -> Result<UploadResponse, RemodbError> {
        self.backups.upload_chunk(chunk)
    }

    /// Closes every session and stops background work. Queued commits that
    /// did not reach storage are abandoned.
    pub fn shutdown(&self) {
        for catalog in self.catalogs.names() {
            for session_id in self.sessions.for_catalog(&catalog) {
                if let Ok(session) = self.sessions.remove(session_id) {
                    session.close();
                }
            }
        }
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
        self.pipeline.shutdown();
        info!("remodb shut down");
    }
}

impl Drop for RemodbInstance {
    fn drop(&mut self) {
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
