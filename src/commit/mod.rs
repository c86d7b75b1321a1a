pub mod apply;
pub mod engine;
pub mod mutation;
pub mod pipeline;
pub mod tx;
pub mod validation;

use crate::catalog::{CatalogHandle, CatalogState};
use crate::catalog::types::TargetIdentity;
use crate::cdc::{CaptureHub, CapturePointer, CaptureResponseType, ChangeCaptureRecord};
use crate::commit::engine::MutationEngine;
use crate::commit::mutation::Mutation;
use crate::commit::pipeline::{AckReceiver, CommitPipeline, PersistRequest};
use crate::commit::tx::{CommitBehaviour, Transaction};
use crate::error::RemodbError;
use crate::storage::{BatchEntry, VersionedBatch};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitOutcome {
    pub transaction_id: u64,
    /// Catalog version assigned to the commit; `None` when nothing was written.
    pub catalog_version: Option<u64>,
    /// New version of every target the transaction touched.
    pub versions: Vec<(TargetIdentity, u64)>,
    pub behaviour: CommitBehaviour,
    /// False when the transaction was rolled back instead (dry run, rollback-only).
    pub committed: bool,
}

impl CommitOutcome {
    pub fn version_of(&self, target: &TargetIdentity) -> Option<u64> {
        self.versions
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, v)| *v)
    }

    pub(crate) fn rolled_back(transaction_id: u64, behaviour: CommitBehaviour) -> Self {
        Self {
            transaction_id,
            catalog_version: None,
            versions: Vec::new(),
            behaviour,
            committed: false,
        }
    }
}

pub(crate) struct CommitContext<'a> {
    pub(crate) engine: &'a MutationEngine,
    pub(crate) hub: &'a CaptureHub,
    pub(crate) pipeline: &'a CommitPipeline,
    pub(crate) timeout: Duration,
}

fn ensure_alive(catalog: &CatalogHandle, state: CatalogState) -> Result<(), RemodbError> {
    if state != CatalogState::Alive {
        return Err(RemodbError::CatalogInWrongState {
            catalog: catalog.name().to_string(),
            state: state.to_string(),
            expected: CatalogState::Alive.to_string(),
        });
    }
    Ok(())
}

/// Validates a batch against the transaction's view and buffers it.
///
/// The batch is dry-run on top of what the transaction already buffered for
/// the target, so invalid input fails here rather than at commit. Returns
/// the version the target will have once the transaction commits.
pub(crate) fn stage_batch(
    engine: &MutationEngine,
    catalog: &CatalogHandle,
    txn: &mut Transaction,
    target: TargetIdentity,
    mutations: Vec<Mutation>,
    expected_version: u64,
) -> Result<u64, RemodbError> {
    if target.catalog() != catalog.name() {
        return Err(RemodbError::Validation(format!(
            "target {target} does not belong to catalog '{}'",
            catalog.name()
        )));
    }
    let (head, schema) = {
        let mut inner = catalog.lock();
        ensure_alive(catalog, inner.state)?;
        let head = inner.write_head(catalog.name(), catalog.storage().as_ref(), &target)?;
        let schema = match txn.working_schema() {
            Some(schema) => Arc::clone(schema),
            None => inner.head_schema()?,
        };
        (head, schema)
    };

    let buffered = txn.batch_for(&target);
    let base_version = buffered.map(|b| b.base_version).unwrap_or(head.version());
    if expected_version != base_version {
        return Err(RemodbError::VersionMismatch {
            target,
            expected: expected_version,
            actual: base_version,
        });
    }
    let mut merged = buffered.map(|b| b.mutations.clone()).unwrap_or_default();
    merged.extend(mutations.iter().cloned());
    let applied = engine.apply(&head, &merged, base_version, &schema)?;
    if let Some(schema) = applied.snapshot.as_schema() {
        txn.set_working_schema(Arc::clone(schema));
    }
    let next_version = applied.snapshot.version();
    txn.stage(target, base_version, mutations);
    Ok(next_version)
}

/// Commits a transaction and waits for the requested durability tier.
///
/// Every target is re-checked and re-applied under the catalog lock; the
/// whole transaction then lands at one catalog version or not at all.
pub(crate) async fn commit_transaction(
    ctx: &CommitContext<'_>,
    catalog: &Arc<CatalogHandle>,
    txn: Transaction,
    behaviour: CommitBehaviour,
) -> Result<CommitOutcome, RemodbError> {
    if txn.is_empty() {
        return Ok(CommitOutcome {
            transaction_id: txn.id(),
            catalog_version: None,
            versions: Vec::new(),
            behaviour,
            committed: true,
        });
    }

    let (catalog_version, versions, durable_rx, visible_rx) = {
        let mut inner = catalog.lock();
        ensure_alive(catalog, inner.state)?;
        let mut schema = inner.head_schema()?;
        let mut entries = Vec::new();
        for batch in txn.commit_order() {
            let head =
                inner.write_head(catalog.name(), catalog.storage().as_ref(), &batch.target)?;
            let applied = ctx
                .engine
                .apply(&head, &batch.mutations, batch.base_version, &schema)?;
            if let Some(next) = applied.snapshot.as_schema() {
                schema = Arc::clone(next);
            }
            entries.push(BatchEntry {
                target: batch.target.clone(),
                snapshot: applied.snapshot,
                mutations: applied.mutations,
            });
        }

        let catalog_version = inner.commit_seq + 1;
        let records = capture_records(catalog.name(), txn.id(), catalog_version, &entries);
        let installs: Vec<_> = entries
            .iter()
            .map(|e| (e.target.clone(), e.snapshot.clone()))
            .collect();
        let (durable_tx, durable_rx) = oneshot::channel();
        let (visible_tx, visible_rx) = oneshot::channel();
        ctx.pipeline.try_enqueue(PersistRequest {
            catalog: Arc::clone(catalog),
            epoch: inner.epoch,
            batch: VersionedBatch {
                catalog: catalog.name().to_string(),
                catalog_version,
                transaction_id: txn.id(),
                entries,
            },
            durable_tx,
            visible_tx,
        })?;

        inner.commit_seq = catalog_version;
        let versions = installs
            .iter()
            .map(|(target, snapshot)| (target.clone(), snapshot.version()))
            .collect::<Vec<_>>();
        for (target, snapshot) in installs {
            inner.install(catalog_version, &target, snapshot);
        }
        ctx.hub.stage(catalog.name(), catalog_version, records);
        (catalog_version, versions, durable_rx, visible_rx)
    };

    debug!(
        catalog = %catalog.name(),
        transaction_id = txn.id(),
        catalog_version,
        mutations = txn.mutation_count(),
        "transaction queued for persistence"
    );

    if behaviour.waits_for_persistence() {
        await_ack(catalog.name(), durable_rx, ctx.timeout).await?;
    }
    if behaviour.waits_for_visibility() {
        await_ack(catalog.name(), visible_rx, ctx.timeout).await?;
    }

    Ok(CommitOutcome {
        transaction_id: txn.id(),
        catalog_version: Some(catalog_version),
        versions,
        behaviour,
        committed: true,
    })
}

async fn await_ack(
    catalog: &str,
    rx: AckReceiver,
    timeout: Duration,
) -> Result<(), RemodbError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(RemodbError::Persistence {
            catalog: catalog.to_string(),
            message: "commit was dropped before it completed".into(),
        }),
        Err(_) => Err(RemodbError::Timeout),
    }
}

fn capture_records(
    catalog: &str,
    transaction_id: u64,
    catalog_version: u64,
    entries: &[BatchEntry],
) -> Vec<ChangeCaptureRecord> {
    let mut records = Vec::new();
    let mut index = 0u32;
    for entry in entries {
        for mutation in &entry.mutations {
            records.push(ChangeCaptureRecord {
                catalog: catalog.to_string(),
                transaction_id,
                pointer: CapturePointer::new(catalog_version, index),
                response_type: CaptureResponseType::Change,
                target: Some(entry.target.clone()),
                mutation: Some(mutation.clone()),
            });
            index += 1;
        }
    }
    records
}
