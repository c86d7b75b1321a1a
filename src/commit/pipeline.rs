use crate::catalog::CatalogHandle;
use crate::cdc::CaptureHub;
use crate::error::RemodbError;
use crate::storage::VersionedBatch;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub(crate) type AckSender = oneshot::Sender<Result<(), RemodbError>>;
pub(crate) type AckReceiver = oneshot::Receiver<Result<(), RemodbError>>;

pub(crate) struct PersistRequest {
    pub(crate) catalog: Arc<CatalogHandle>,
    pub(crate) epoch: u64,
    pub(crate) batch: VersionedBatch,
    pub(crate) durable_tx: AckSender,
    pub(crate) visible_tx: AckSender,
}

struct PropagateTask {
    catalog: Arc<CatalogHandle>,
    catalog_version: u64,
    visible_tx: AckSender,
}

/// Ordered background stages behind every commit: persistence first, then
/// visibility plus capture release. Both stages handle requests strictly in
/// enqueue order, which is commit order within each catalog.
pub struct CommitPipeline {
    persist_tx: mpsc::Sender<PersistRequest>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitPipeline {
    pub fn start(hub: Arc<CaptureHub>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (persist_tx, mut persist_rx) = mpsc::channel::<PersistRequest>(capacity);
        let (propagate_tx, mut propagate_rx) = mpsc::channel::<PropagateTask>(capacity);

        let persist_hub = Arc::clone(&hub);
        let persist_handle = tokio::spawn(async move {
            while let Some(req) = persist_rx.recv().await {
                let catalog_name = req.batch.catalog.clone();
                let version = req.batch.catalog_version;
                if !req.catalog.is_current_epoch(req.epoch) {
                    let _ = req.durable_tx.send(Err(RemodbError::Persistence {
                        catalog: catalog_name,
                        message: format!(
                            "commit at version {version} aborted by an earlier persistence failure"
                        ),
                    }));
                    continue;
                }
                match req.catalog.storage().persist(&req.batch) {
                    Ok(ack) => {
                        req.catalog.mark_durable(ack.catalog_version, req.epoch);
                        let _ = req.durable_tx.send(Ok(()));
                        let task = PropagateTask {
                            catalog: req.catalog,
                            catalog_version: version,
                            visible_tx: req.visible_tx,
                        };
                        if let Err(send_err) = propagate_tx.send(task).await {
                            let _ = send_err.0.visible_tx.send(Err(RemodbError::Validation(
                                "commit propagation stage closed".into(),
                            )));
                        }
                    }
                    Err(err) => {
                        error!(
                            catalog = %catalog_name,
                            version,
                            error = %err,
                            "commit persistence failed, aborting this and all queued commits"
                        );
                        let forgotten = {
                            let mut inner = req.catalog.lock();
                            inner.abort_after(version.saturating_sub(1));
                            persist_hub.forget_after(&catalog_name, version.saturating_sub(1))
                        };
                        debug!(catalog = %catalog_name, forgotten, "aborted commits discarded");
                        let err = match err {
                            RemodbError::Persistence { .. } => err,
                            other => RemodbError::Persistence {
                                catalog: catalog_name,
                                message: other.to_string(),
                            },
                        };
                        let _ = req.durable_tx.send(Err(err));
                    }
                }
            }
        });

        let propagate_handle = tokio::spawn(async move {
            while let Some(task) = propagate_rx.recv().await {
                task.catalog.mark_visible(task.catalog_version);
                hub.release(task.catalog.name(), task.catalog_version);
                let _ = task.visible_tx.send(Ok(()));
            }
        });

        Self {
            persist_tx,
            background_tasks: Mutex::new(vec![persist_handle, propagate_handle]),
        }
    }

    /// Queues a prepared commit. Never waits: a full queue is reported as
    /// `QueueFull` and the caller keeps its state untouched.
    pub(crate) fn try_enqueue(&self, req: PersistRequest) -> Result<(), RemodbError> {
        match self.persist_tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RemodbError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                Err(RemodbError::Validation("commit pipeline is closed".into()))
            }
        }
    }

    pub fn shutdown(&self) {
        for handle in self.background_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for CommitPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
