use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::TargetIdentity;
use crate::commit::mutation::Mutation;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Durability tier a commit waits for. Ordered: each tier implies the ones
/// before it.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum CommitBehaviour {
    /// Return once the batch passed its version checks and is queued.
    WaitForConflictResolution,
    /// Return once the storage engine acknowledged the batch.
    WaitForWalPersistence,
    /// Return once new readers observe the batch.
    #[default]
    WaitForChangesVisible,
}

impl CommitBehaviour {
    pub fn waits_for_persistence(self) -> bool {
        self >= CommitBehaviour::WaitForWalPersistence
    }

    pub fn waits_for_visibility(self) -> bool {
        self >= CommitBehaviour::WaitForChangesVisible
    }
}

/// Mutations buffered for one target. All of them land in a single version
/// step on top of `base_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetBatch {
    pub target: TargetIdentity,
    pub base_version: u64,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed { catalog_version: u64 },
    RolledBack,
    Failed { code: String },
}

impl TransactionOutcome {
    pub fn failed(code: ErrorCode) -> Self {
        TransactionOutcome::Failed {
            code: code.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    catalog: String,
    rollback_only: bool,
    batches: Vec<TargetBatch>,
    working_schema: Option<Arc<CatalogSchema>>,
    opened_at: Instant,
}

impl Transaction {
    pub fn new(id: u64, catalog: impl Into<String>) -> Self {
        Self {
            id,
            catalog: catalog.into(),
            rollback_only: false,
            batches: Vec::new(),
            working_schema: None,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn mutation_count(&self) -> usize {
        self.batches.iter().map(|b| b.mutations.len()).sum()
    }

    pub fn batch_for(&self, target: &TargetIdentity) -> Option<&TargetBatch> {
        self.batches.iter().find(|b| &b.target == target)
    }

    /// Schema as modified by this transaction so far, if it touched the schema.
    pub fn working_schema(&self) -> Option<&Arc<CatalogSchema>> {
        self.working_schema.as_ref()
    }

    pub(crate) fn set_working_schema(&mut self, schema: Arc<CatalogSchema>) {
        self.working_schema = Some(schema);
    }

    /// Appends an already validated batch for `target`.
    pub(crate) fn stage(&mut self, target: TargetIdentity, base_version: u64, mutations: Vec<Mutation>) {
        if let Some(batch) = self.batches.iter_mut().find(|b| b.target == target) {
            batch.mutations.extend(mutations);
            return;
        }
        self.batches.push(TargetBatch {
            target,
            base_version,
            mutations,
        });
    }

    /// Buffered batches in commit order: the schema first, then entities in
    /// the order they were first touched.
    pub fn commit_order(&self) -> Vec<&TargetBatch> {
        let (schema, entities): (Vec<_>, Vec<_>) = self
            .batches
            .iter()
            .partition(|b| matches!(b.target, TargetIdentity::CatalogSchema { .. }));
        schema.into_iter().chain(entities).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitBehaviour, Transaction};
    use crate::catalog::types::{TargetIdentity, Value};
    use crate::commit::mutation::{Mutation, SchemaMutation};

    #[test]
    fn tiers_are_ordered() {
        assert!(!CommitBehaviour::WaitForConflictResolution.waits_for_persistence());
        assert!(CommitBehaviour::WaitForWalPersistence.waits_for_persistence());
        assert!(!CommitBehaviour::WaitForWalPersistence.waits_for_visibility());
        assert!(CommitBehaviour::WaitForChangesVisible.waits_for_persistence());
        assert_eq!(CommitBehaviour::default(), CommitBehaviour::WaitForChangesVisible);
    }

    #[test]
    fn batches_for_one_target_are_merged_and_schema_goes_first() {
        let mut tx = Transaction::new(1, "products");
        let widget = TargetIdentity::entity("products", "product", 1);
        tx.stage(
            widget.clone(),
            3,
            vec![Mutation::set_attribute("name", Value::text("Widget"))],
        );
        tx.stage(
            TargetIdentity::schema("products"),
            1,
            vec![Mutation::Schema(SchemaMutation::ModifyDescription {
                description: None,
            })],
        );
        tx.stage(
            widget.clone(),
            3,
            vec![Mutation::set_attribute("name", Value::text("Gadget"))],
        );
        assert_eq!(tx.mutation_count(), 3);
        let order = tx.commit_order();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].target, TargetIdentity::schema("products"));
        assert_eq!(order[1].mutations.len(), 2);
        assert_eq!(tx.batch_for(&widget).map(|b| b.base_version), Some(3));
    }
}
