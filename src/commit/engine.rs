use crate::catalog::schema::CatalogSchema;
use crate::catalog::types::VersionedEntity;
use crate::commit::apply::{apply_entity_mutations, apply_schema_mutations};
use crate::commit::mutation::{Mutation, coalesce};
use crate::commit::validation::{validate_batch_shape, validate_entity_mutation};
use crate::error::RemodbError;
use std::sync::Arc;

/// Result of folding one batch into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    pub snapshot: VersionedEntity,
    /// The batch after last-write-wins folding; this is what capture publishes.
    pub mutations: Vec<Mutation>,
}

/// Validates and applies ordered mutation batches under optimistic locking.
///
/// The engine is pure: it never touches shared state. The commit path runs
/// it under the catalog's write lock and publishes the returned batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutationEngine;

impl MutationEngine {
    /// Applies `mutations` to `current`.
    ///
    /// `schema` is the catalog schema entity mutations are checked against;
    /// it is ignored when `current` is the schema itself. The result is one
    /// version above `current` however many mutations the batch carries.
    /// The batch is validated and applied as submitted; only the published
    /// copy is folded.
    pub fn apply(
        &self,
        current: &VersionedEntity,
        mutations: &[Mutation],
        expected_version: u64,
        schema: &CatalogSchema,
    ) -> Result<AppliedBatch, RemodbError> {
        let target = current.identity();
        if expected_version != current.version() {
            return Err(RemodbError::VersionMismatch {
                target,
                expected: expected_version,
                actual: current.version(),
            });
        }
        validate_batch_shape(&target, mutations)?;
        let coalesced = coalesce(mutations);

        let snapshot = match current {
            VersionedEntity::CatalogSchema(base) => {
                let next = apply_schema_mutations(&target, base, &coalesced)?;
                VersionedEntity::CatalogSchema(Arc::new(next))
            }
            VersionedEntity::Entity { catalog, entity } => {
                // Every submitted mutation must be valid, including ones a
                // later write to the same field supersedes.
                for mutation in mutations {
                    validate_entity_mutation(schema, &target, mutation)?;
                }
                let mut next = apply_entity_mutations(&target, entity, mutations)?;
                next.version = entity.version + 1;
                VersionedEntity::Entity {
                    catalog: catalog.clone(),
                    entity: Arc::new(next),
                }
            }
        };

        Ok(AppliedBatch {
            snapshot,
            mutations: coalesced,
        })
    }
}
