use crate::cdc::ChangeCaptureRecord;
use crate::commit::mutation::MutationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Filter applied to committed mutations before they reach a subscriber.
/// Empty criteria match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureCriteria {
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub kinds: BTreeSet<MutationKind>,
    #[serde(default)]
    pub transaction_id_from: Option<u64>,
    #[serde(default)]
    pub transaction_id_to: Option<u64>,
}

impl CaptureCriteria {
    pub fn catalog(name: impl Into<String>) -> Self {
        Self {
            catalog: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_kind(mut self, kind: MutationKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn with_transaction_range(mut self, from: Option<u64>, to: Option<u64>) -> Self {
        self.transaction_id_from = from;
        self.transaction_id_to = to;
        self
    }

    pub fn matches(&self, record: &ChangeCaptureRecord) -> bool {
        if self
            .catalog
            .as_deref()
            .is_some_and(|catalog| catalog != record.catalog)
        {
            return false;
        }
        if self
            .transaction_id_from
            .is_some_and(|from| record.transaction_id < from)
            || self
                .transaction_id_to
                .is_some_and(|to| record.transaction_id > to)
        {
            return false;
        }
        let Some(mutation) = &record.mutation else {
            return true;
        };
        if !self.kinds.is_empty() && !self.kinds.contains(&mutation.kind()) {
            return false;
        }
        if let Some(entity_type) = &self.entity_type {
            let record_type = record
                .target
                .as_ref()
                .and_then(|t| t.entity_type())
                .or_else(|| mutation.schema_entity_type());
            if record_type != Some(entity_type.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureCriteria;
    use crate::catalog::types::{TargetIdentity, Value};
    use crate::cdc::{CapturePointer, CaptureResponseType, ChangeCaptureRecord};
    use crate::commit::mutation::{Mutation, MutationKind, SchemaMutation};

    fn record(target: TargetIdentity, mutation: Mutation, transaction_id: u64) -> ChangeCaptureRecord {
        ChangeCaptureRecord {
            catalog: target.catalog().to_string(),
            transaction_id,
            pointer: CapturePointer::new(transaction_id, 0),
            response_type: CaptureResponseType::Change,
            target: Some(target),
            mutation: Some(mutation),
        }
    }

    #[test]
    fn filters_by_catalog_entity_type_kind_and_transaction() {
        let product = record(
            TargetIdentity::entity("products", "product", 1),
            Mutation::set_attribute("name", Value::text("Widget")),
            4,
        );
        let schema = record(
            TargetIdentity::schema("products"),
            Mutation::Schema(SchemaMutation::CreateEntitySchema {
                entity_type: "product".into(),
            }),
            5,
        );

        assert!(CaptureCriteria::default().matches(&product));
        assert!(!CaptureCriteria::catalog("orders").matches(&product));
        let by_type = CaptureCriteria::catalog("products").with_entity_type("product");
        assert!(by_type.matches(&product));
        assert!(by_type.matches(&schema));
        assert!(!CaptureCriteria::default()
            .with_entity_type("category")
            .matches(&product));
        let schema_only = CaptureCriteria::default().with_kind(MutationKind::Schema);
        assert!(!schema_only.matches(&product));
        assert!(schema_only.matches(&schema));
        let range = CaptureCriteria::default().with_transaction_range(Some(5), None);
        assert!(!range.matches(&product));
        assert!(range.matches(&schema));
    }
}
