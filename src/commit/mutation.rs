use crate::catalog::schema::{
    AssociatedDataSchema, AttributeElement, AttributeSchema, ReferenceSchema,
    SortableAttributeCompoundSchema,
};
use crate::catalog::types::{FieldKey, Locale, ReferenceKey, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttributeMutation {
    Upsert {
        name: String,
        locale: Option<Locale>,
        value: Value,
    },
    Remove {
        name: String,
        locale: Option<Locale>,
    },
}

impl AttributeMutation {
    pub fn field_key(&self) -> FieldKey {
        match self {
            AttributeMutation::Upsert { name, locale, .. }
            | AttributeMutation::Remove { name, locale } => FieldKey::new(name.clone(), locale.clone()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttributeMutation::Upsert { name, .. } | AttributeMutation::Remove { name, .. } => name,
        }
    }

    pub fn locale(&self) -> Option<&Locale> {
        match self {
            AttributeMutation::Upsert { locale, .. } | AttributeMutation::Remove { locale, .. } => {
                locale.as_ref()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssociatedDataMutation {
    Upsert {
        name: String,
        locale: Option<Locale>,
        value: Value,
    },
    Remove {
        name: String,
        locale: Option<Locale>,
    },
}

impl AssociatedDataMutation {
    pub fn field_key(&self) -> FieldKey {
        match self {
            AssociatedDataMutation::Upsert { name, locale, .. }
            | AssociatedDataMutation::Remove { name, locale } => {
                FieldKey::new(name.clone(), locale.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReferenceMutation {
    Insert {
        name: String,
        primary_key: u32,
    },
    Remove {
        name: String,
        primary_key: u32,
    },
    Attribute {
        name: String,
        primary_key: u32,
        mutation: AttributeMutation,
    },
}

impl ReferenceMutation {
    pub fn reference_key(&self) -> ReferenceKey {
        match self {
            ReferenceMutation::Insert { name, primary_key }
            | ReferenceMutation::Remove { name, primary_key }
            | ReferenceMutation::Attribute {
                name, primary_key, ..
            } => ReferenceKey {
                name: name.clone(),
                primary_key: *primary_key,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttributeChange {
    Description(Option<String>),
    ValueType(ValueType),
    Localized(bool),
    Filterable(bool),
    Sortable(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompoundChange {
    Description(Option<String>),
    Elements(Vec<AttributeElement>),
}

/// Schema changes. Attribute, description and entity-schema lifecycle
/// mutations apply to the catalog schema; the remaining ones are only valid
/// inside `ModifyEntitySchema`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchemaMutation {
    ModifyDescription {
        description: Option<String>,
    },
    CreateAttribute(AttributeSchema),
    RemoveAttribute {
        name: String,
    },
    ModifyAttribute {
        name: String,
        change: AttributeChange,
    },
    CreateSortableAttributeCompound(SortableAttributeCompoundSchema),
    RemoveSortableAttributeCompound {
        name: String,
    },
    ModifySortableAttributeCompound {
        name: String,
        change: CompoundChange,
    },
    CreateAssociatedData(AssociatedDataSchema),
    RemoveAssociatedData {
        name: String,
    },
    CreateReference(ReferenceSchema),
    RemoveReference {
        name: String,
    },
    SetReferenceFilterable {
        name: String,
        filterable: bool,
        inherited: bool,
    },
    CreateEntitySchema {
        entity_type: String,
    },
    RemoveEntitySchema {
        entity_type: String,
    },
    ModifyEntitySchema {
        entity_type: String,
        mutations: Vec<SchemaMutation>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationKind {
    Attribute,
    AssociatedData,
    Reference,
    Schema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mutation {
    Attribute(AttributeMutation),
    AssociatedData(AssociatedDataMutation),
    Reference(ReferenceMutation),
    Schema(SchemaMutation),
}

impl Mutation {
    pub fn set_attribute(name: impl Into<String>, value: Value) -> Self {
        Mutation::Attribute(AttributeMutation::Upsert {
            name: name.into(),
            locale: None,
            value,
        })
    }

    pub fn set_localized_attribute(name: impl Into<String>, locale: Locale, value: Value) -> Self {
        Mutation::Attribute(AttributeMutation::Upsert {
            name: name.into(),
            locale: Some(locale),
            value,
        })
    }

    pub fn remove_attribute(name: impl Into<String>, locale: Option<Locale>) -> Self {
        Mutation::Attribute(AttributeMutation::Remove {
            name: name.into(),
            locale,
        })
    }

    pub fn set_associated_data(
        name: impl Into<String>,
        locale: Option<Locale>,
        value: Value,
    ) -> Self {
        Mutation::AssociatedData(AssociatedDataMutation::Upsert {
            name: name.into(),
            locale,
            value,
        })
    }

    pub fn insert_reference(name: impl Into<String>, primary_key: u32) -> Self {
        Mutation::Reference(ReferenceMutation::Insert {
            name: name.into(),
            primary_key,
        })
    }

    pub fn remove_reference(name: impl Into<String>, primary_key: u32) -> Self {
        Mutation::Reference(ReferenceMutation::Remove {
            name: name.into(),
            primary_key,
        })
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Attribute(_) => MutationKind::Attribute,
            Mutation::AssociatedData(_) => MutationKind::AssociatedData,
            Mutation::Reference(_) => MutationKind::Reference,
            Mutation::Schema(_) => MutationKind::Schema,
        }
    }

    pub fn is_schema(&self) -> bool {
        matches!(self, Mutation::Schema(_))
    }

    /// Entity type a schema mutation is scoped to, if any.
    pub fn schema_entity_type(&self) -> Option<&str> {
        match self {
            Mutation::Schema(
                SchemaMutation::CreateEntitySchema { entity_type }
                | SchemaMutation::RemoveEntitySchema { entity_type }
                | SchemaMutation::ModifyEntitySchema { entity_type, .. },
            ) => Some(entity_type),
            _ => None,
        }
    }

    fn content_key(&self) -> Option<ContentKey> {
        match self {
            Mutation::Attribute(m) => Some(ContentKey::Attribute(m.field_key())),
            Mutation::AssociatedData(m) => Some(ContentKey::AssociatedData(m.field_key())),
            Mutation::Reference(ReferenceMutation::Attribute {
                name,
                primary_key,
                mutation,
            }) => Some(ContentKey::ReferenceAttribute(
                ReferenceKey {
                    name: name.clone(),
                    primary_key: *primary_key,
                },
                mutation.field_key(),
            )),
            Mutation::Reference(m) => Some(ContentKey::ReferenceExistence(m.reference_key())),
            Mutation::Schema(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ContentKey {
    Attribute(FieldKey),
    AssociatedData(FieldKey),
    ReferenceExistence(ReferenceKey),
    ReferenceAttribute(ReferenceKey, FieldKey),
}

/// Folds a batch so that each field keeps only its last write.
///
/// Survivors keep their submission order. A reference removal also drops the
/// earlier writes to that reference's attributes. An insert after a removal of
/// the same reference is kept next to it since the pair resets the reference,
/// while a repeated insert is dropped in favour of the first one.
/// Schema mutations are applied sequentially and never folded.
pub fn coalesce(mutations: &[Mutation]) -> Vec<Mutation> {
    let mut slots: Vec<Option<Mutation>> = Vec::with_capacity(mutations.len());
    let mut latest: HashMap<ContentKey, usize> = HashMap::new();

    for mutation in mutations {
        let Some(key) = mutation.content_key() else {
            slots.push(Some(mutation.clone()));
            continue;
        };
        match mutation {
            Mutation::Reference(ReferenceMutation::Remove { .. }) => {
                let reference = mutation_reference_key(mutation);
                if let Some(idx) = latest.remove(&key) {
                    slots[idx] = None;
                }
                latest.retain(|k, idx| {
                    let drop = matches!(k, ContentKey::ReferenceAttribute(r, _) if Some(r) == reference.as_ref());
                    if drop {
                        slots[*idx] = None;
                    }
                    !drop
                });
            }
            Mutation::Reference(ReferenceMutation::Insert { .. }) => {
                let previous_is_insert = latest.get(&key).is_some_and(|idx| {
                    matches!(
                        slots[*idx],
                        Some(Mutation::Reference(ReferenceMutation::Insert { .. }))
                    )
                });
                if previous_is_insert {
                    // The reference already exists at that point; writes to
                    // its attributes after the first insert must stay after it.
                    continue;
                }
            }
            _ => {
                if let Some(idx) = latest.remove(&key) {
                    slots[idx] = None;
                }
            }
        }
        latest.insert(key, slots.len());
        slots.push(Some(mutation.clone()));
    }

    slots.into_iter().flatten().collect()
}

fn mutation_reference_key(mutation: &Mutation) -> Option<ReferenceKey> {
    match mutation {
        Mutation::Reference(m) => Some(m.reference_key()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Mutation, ReferenceMutation, SchemaMutation, coalesce};
    use crate::catalog::types::{Locale, Value};

    #[test]
    fn last_write_wins_per_field() {
        let batch = vec![
            Mutation::set_attribute("name", Value::text("Widget")),
            Mutation::set_attribute("code", Value::text("W-1")),
            Mutation::set_attribute("name", Value::text("Gadget")),
        ];
        let folded = coalesce(&batch);
        assert_eq!(
            folded,
            vec![
                Mutation::set_attribute("code", Value::text("W-1")),
                Mutation::set_attribute("name", Value::text("Gadget")),
            ]
        );
    }

    #[test]
    fn locales_are_distinct_fields() {
        let en = Locale::parse("en").expect("en");
        let de = Locale::parse("de").expect("de");
        let batch = vec![
            Mutation::set_localized_attribute("title", en.clone(), Value::text("Hello")),
            Mutation::set_localized_attribute("title", de, Value::text("Hallo")),
            Mutation::remove_attribute("title", Some(en)),
        ];
        let folded = coalesce(&batch);
        assert_eq!(folded.len(), 2);
        assert!(matches!(folded[1], Mutation::Attribute(super::AttributeMutation::Remove { .. })));
    }

    #[test]
    fn reference_removal_drops_earlier_reference_writes() {
        let batch = vec![
            Mutation::insert_reference("brand", 5),
            Mutation::Reference(ReferenceMutation::Attribute {
                name: "brand".into(),
                primary_key: 5,
                mutation: super::AttributeMutation::Upsert {
                    name: "priority".into(),
                    locale: None,
                    value: Value::Integer(1),
                },
            }),
            Mutation::remove_reference("brand", 5),
            Mutation::insert_reference("brand", 5),
        ];
        let folded = coalesce(&batch);
        assert_eq!(
            folded,
            vec![
                Mutation::remove_reference("brand", 5),
                Mutation::insert_reference("brand", 5),
            ]
        );
    }

    #[test]
    fn schema_mutations_are_never_folded() {
        let batch = vec![
            Mutation::Schema(SchemaMutation::ModifyDescription {
                description: Some("a".into()),
            }),
            Mutation::Schema(SchemaMutation::ModifyDescription {
                description: Some("b".into()),
            }),
        ];
        assert_eq!(coalesce(&batch).len(), 2);
    }
}
