use crate::catalog::schema::{AttributeSchema, CatalogSchema, EntitySchema};
use crate::catalog::types::{Entity, FieldKey, ReferenceState, TargetIdentity, Value};
use crate::commit::mutation::{
    AssociatedDataMutation, AttributeChange, AttributeMutation, CompoundChange, Mutation,
    ReferenceMutation, SchemaMutation,
};
use crate::commit::validation::{invalid, schema_mutation_name, validate_catalog_schema};
use crate::error::RemodbError;
use im::OrdMap;
use std::collections::BTreeSet;

/// Folds entity mutations into a copy of `base` in submission order. The
/// caller assigns the resulting version.
pub fn apply_entity_mutations(
    target: &TargetIdentity,
    base: &Entity,
    mutations: &[Mutation],
) -> Result<Entity, RemodbError> {
    let mut entity = base.clone();
    for mutation in mutations {
        match mutation {
            Mutation::Attribute(m) => apply_attribute(&mut entity.attributes, m),
            Mutation::AssociatedData(m) => match m {
                AssociatedDataMutation::Upsert {
                    name,
                    locale,
                    value,
                } => {
                    entity
                        .associated_data
                        .insert(FieldKey::new(name.clone(), locale.clone()), value.clone());
                }
                AssociatedDataMutation::Remove { .. } => {
                    entity.associated_data.remove(&m.field_key());
                }
            },
            Mutation::Reference(m) => {
                let key = m.reference_key();
                match m {
                    ReferenceMutation::Insert { .. } => {
                        if !entity.references.contains_key(&key) {
                            entity.references.insert(key, ReferenceState::default());
                        }
                    }
                    ReferenceMutation::Remove { .. } => {
                        entity.references.remove(&key);
                    }
                    ReferenceMutation::Attribute { mutation, .. } => {
                        let Some(state) = entity.references.get_mut(&key) else {
                            return Err(invalid(
                                target,
                                format!(
                                    "reference '{}' to {} is not present on the entity",
                                    key.name, key.primary_key
                                ),
                            ));
                        };
                        apply_attribute(&mut state.attributes, mutation);
                    }
                }
            }
            Mutation::Schema(_) => {
                return Err(invalid(
                    target,
                    "schema mutations must target the catalog schema",
                ));
            }
        }
    }
    Ok(entity)
}

fn apply_attribute(values: &mut OrdMap<FieldKey, Value>, mutation: &AttributeMutation) {
    match mutation {
        AttributeMutation::Upsert {
            name,
            locale,
            value,
        } => {
            values.insert(FieldKey::new(name.clone(), locale.clone()), value.clone());
        }
        AttributeMutation::Remove { .. } => {
            values.remove(&mutation.field_key());
        }
    }
}

/// Folds schema mutations into a copy of `base`, bumps the catalog schema
/// version once and every modified entity schema once, then checks the
/// result is structurally sound.
pub fn apply_schema_mutations(
    target: &TargetIdentity,
    base: &CatalogSchema,
    mutations: &[Mutation],
) -> Result<CatalogSchema, RemodbError> {
    let mut schema = base.clone();
    let mut created = BTreeSet::new();
    let mut modified = BTreeSet::new();

    for mutation in mutations {
        let Mutation::Schema(mutation) = mutation else {
            return Err(invalid(
                target,
                "entity mutations cannot target the catalog schema",
            ));
        };
        match mutation {
            SchemaMutation::ModifyDescription { description } => {
                schema.description = description.clone();
            }
            SchemaMutation::CreateAttribute(attribute) => {
                create_attribute(target, &mut schema.attributes, attribute)?;
            }
            SchemaMutation::RemoveAttribute { name } => {
                schema.attributes.remove(name);
            }
            SchemaMutation::ModifyAttribute { name, change } => {
                modify_attribute(target, &mut schema.attributes, name, change)?;
            }
            SchemaMutation::CreateEntitySchema { entity_type } => {
                if entity_type.is_empty() {
                    return Err(invalid(target, "entity type must not be empty"));
                }
                if !schema.entity_schemas.contains_key(entity_type) {
                    schema
                        .entity_schemas
                        .insert(entity_type.clone(), EntitySchema::new(entity_type.clone()));
                    created.insert(entity_type.clone());
                }
            }
            SchemaMutation::RemoveEntitySchema { entity_type } => {
                schema.entity_schemas.remove(entity_type);
                created.remove(entity_type);
                modified.remove(entity_type);
            }
            SchemaMutation::ModifyEntitySchema {
                entity_type,
                mutations,
            } => {
                let Some(entity_schema) = schema.entity_schemas.get_mut(entity_type) else {
                    return Err(invalid(
                        target,
                        format!("entity schema '{entity_type}' does not exist"),
                    ));
                };
                for nested in mutations {
                    apply_entity_schema_mutation(target, entity_schema, nested)?;
                }
                modified.insert(entity_type.clone());
            }
            other => {
                return Err(invalid(
                    target,
                    format!(
                        "{} is only valid inside an entity schema modification",
                        schema_mutation_name(other)
                    ),
                ));
            }
        }
    }

    for entity_type in modified.difference(&created) {
        if let Some(entity_schema) = schema.entity_schemas.get_mut(entity_type) {
            entity_schema.version += 1;
        }
    }
    schema.version = base.version + 1;
    validate_catalog_schema(target, &schema)?;
    Ok(schema)
}

fn apply_entity_schema_mutation(
    target: &TargetIdentity,
    entity_schema: &mut EntitySchema,
    mutation: &SchemaMutation,
) -> Result<(), RemodbError> {
    let entity_type = entity_schema.name.clone();
    match mutation {
        SchemaMutation::ModifyDescription { description } => {
            entity_schema.description = description.clone();
        }
        SchemaMutation::CreateAttribute(attribute) => {
            create_attribute(target, &mut entity_schema.attributes, attribute)?;
        }
        SchemaMutation::RemoveAttribute { name } => {
            entity_schema.attributes.remove(name);
        }
        SchemaMutation::ModifyAttribute { name, change } => {
            modify_attribute(target, &mut entity_schema.attributes, name, change)?;
        }
        SchemaMutation::CreateSortableAttributeCompound(compound) => {
            match entity_schema.sortable_attribute_compounds.get(&compound.name) {
                Some(existing) if existing == compound => {}
                Some(_) => {
                    return Err(invalid(
                        target,
                        format!(
                            "sortable compound '{}' already exists on '{entity_type}' with a different definition",
                            compound.name
                        ),
                    ));
                }
                None => {
                    entity_schema
                        .sortable_attribute_compounds
                        .insert(compound.name.clone(), compound.clone());
                }
            }
        }
        SchemaMutation::RemoveSortableAttributeCompound { name } => {
            entity_schema.sortable_attribute_compounds.remove(name);
        }
        SchemaMutation::ModifySortableAttributeCompound { name, change } => {
            let Some(compound) = entity_schema.sortable_attribute_compounds.get_mut(name) else {
                return Err(invalid(
                    target,
                    format!("sortable compound '{name}' does not exist on '{entity_type}'"),
                ));
            };
            match change {
                CompoundChange::Description(description) => {
                    compound.description = description.clone();
                }
                CompoundChange::Elements(elements) => compound.elements = elements.clone(),
            }
        }
        SchemaMutation::CreateAssociatedData(data) => {
            match entity_schema.associated_data.get(&data.name) {
                Some(existing) if existing == data => {}
                Some(_) => {
                    return Err(invalid(
                        target,
                        format!(
                            "associated data '{}' already exists on '{entity_type}' with a different definition",
                            data.name
                        ),
                    ));
                }
                None => {
                    entity_schema
                        .associated_data
                        .insert(data.name.clone(), data.clone());
                }
            }
        }
        SchemaMutation::RemoveAssociatedData { name } => {
            entity_schema.associated_data.remove(name);
        }
        SchemaMutation::CreateReference(reference) => {
            match entity_schema.references.get(&reference.name) {
                Some(existing) if existing == reference => {}
                Some(_) => {
                    return Err(invalid(
                        target,
                        format!(
                            "reference '{}' already exists on '{entity_type}' with a different definition",
                            reference.name
                        ),
                    ));
                }
                None => {
                    entity_schema
                        .references
                        .insert(reference.name.clone(), reference.clone());
                }
            }
        }
        SchemaMutation::RemoveReference { name } => {
            entity_schema.references.remove(name);
        }
        SchemaMutation::SetReferenceFilterable {
            name,
            filterable,
            inherited,
        } => {
            let Some(reference) = entity_schema.references.get_mut(name) else {
                return Err(invalid(
                    target,
                    format!("reference '{name}' does not exist on '{entity_type}'"),
                ));
            };
            reference.filterable = *filterable;
            reference.filterable_inherited = *inherited;
        }
        SchemaMutation::CreateEntitySchema { .. }
        | SchemaMutation::RemoveEntitySchema { .. }
        | SchemaMutation::ModifyEntitySchema { .. } => {
            return Err(invalid(
                target,
                format!(
                    "{} cannot be nested inside '{entity_type}'",
                    schema_mutation_name(mutation)
                ),
            ));
        }
    }
    Ok(())
}

fn create_attribute(
    target: &TargetIdentity,
    attributes: &mut OrdMap<String, AttributeSchema>,
    attribute: &AttributeSchema,
) -> Result<(), RemodbError> {
    if attribute.name.is_empty() {
        return Err(invalid(target, "attribute name must not be empty"));
    }
    match attributes.get(&attribute.name) {
        Some(existing) if existing == attribute => Ok(()),
        Some(_) => Err(invalid(
            target,
            format!(
                "attribute '{}' already exists with a different definition",
                attribute.name
            ),
        )),
        None => {
            attributes.insert(attribute.name.clone(), attribute.clone());
            Ok(())
        }
    }
}

fn modify_attribute(
    target: &TargetIdentity,
    attributes: &mut OrdMap<String, AttributeSchema>,
    name: &str,
    change: &AttributeChange,
) -> Result<(), RemodbError> {
    let Some(attribute) = attributes.get_mut(name) else {
        return Err(invalid(target, format!("attribute '{name}' does not exist")));
    };
    match change {
        AttributeChange::Description(description) => attribute.description = description.clone(),
        AttributeChange::ValueType(value_type) => attribute.value_type = *value_type,
        AttributeChange::Localized(localized) => attribute.localized = *localized,
        AttributeChange::Filterable(filterable) => attribute.filterable = *filterable,
        AttributeChange::Sortable(sortable) => attribute.sortable = *sortable,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply_entity_mutations, apply_schema_mutations};
    use crate::catalog::schema::{
        AttributeElement, AttributeSchema, CatalogSchema, ReferenceSchema,
        SortableAttributeCompoundSchema,
    };
    use crate::catalog::types::{Entity, TargetIdentity, Value, ValueType};
    use crate::commit::mutation::{Mutation, ReferenceMutation, SchemaMutation};
    use crate::error::RemodbError;

    fn modify_product(mutations: Vec<SchemaMutation>) -> Mutation {
        Mutation::Schema(SchemaMutation::ModifyEntitySchema {
            entity_type: "product".into(),
            mutations,
        })
    }

    fn product_schema() -> CatalogSchema {
        let target = TargetIdentity::schema("products");
        apply_schema_mutations(
            &target,
            &CatalogSchema::new("products"),
            &[
                Mutation::Schema(SchemaMutation::CreateEntitySchema {
                    entity_type: "product".into(),
                }),
                modify_product(vec![
                    SchemaMutation::CreateAttribute(AttributeSchema::new("name", ValueType::Text)),
                    SchemaMutation::CreateAttribute(AttributeSchema::new("code", ValueType::Text)),
                    SchemaMutation::CreateSortableAttributeCompound(
                        SortableAttributeCompoundSchema::new(
                            "nameAndCode",
                            vec![AttributeElement::asc("name"), AttributeElement::asc("code")],
                        ),
                    ),
                    SchemaMutation::CreateReference(ReferenceSchema::new("brand", "brand")),
                ]),
            ],
        )
        .expect("schema")
    }

    #[test]
    fn schema_batch_bumps_version_once() {
        let schema = product_schema();
        assert_eq!(schema.version, 1);
        let product = schema.entity_schema("product").expect("product");
        assert_eq!(product.version, 1);
        assert_eq!(product.sortable_attribute_compounds.len(), 1);

        let target = TargetIdentity::schema("products");
        let next = apply_schema_mutations(
            &target,
            &schema,
            &[
                Mutation::Schema(SchemaMutation::ModifyDescription {
                    description: Some("catalog".into()),
                }),
                modify_product(vec![SchemaMutation::ModifyDescription {
                    description: Some("things".into()),
                }]),
            ],
        )
        .expect("modify");
        assert_eq!(next.version, 2);
        assert_eq!(next.entity_schema("product").map(|s| s.version), Some(2));
    }

    #[test]
    fn removing_attribute_used_by_compound_is_rejected() {
        let schema = product_schema();
        let target = TargetIdentity::schema("products");
        let err = apply_schema_mutations(
            &target,
            &schema,
            &[modify_product(vec![SchemaMutation::RemoveAttribute {
                name: "code".into(),
            }])],
        )
        .expect_err("dangling compound");
        assert!(matches!(err, RemodbError::InvalidMutation { .. }));
        assert!(err.to_string().contains("nameAndCode"));

        apply_schema_mutations(
            &target,
            &schema,
            &[modify_product(vec![
                SchemaMutation::RemoveSortableAttributeCompound {
                    name: "nameAndCode".into(),
                },
                SchemaMutation::RemoveAttribute {
                    name: "code".into(),
                },
            ])],
        )
        .expect("compound removed first");
    }

    #[test]
    fn inherited_filterable_flag_is_accepted() {
        let schema = product_schema();
        let target = TargetIdentity::schema("products");
        let next = apply_schema_mutations(
            &target,
            &schema,
            &[modify_product(vec![SchemaMutation::SetReferenceFilterable {
                name: "brand".into(),
                filterable: true,
                inherited: true,
            }])],
        )
        .expect("filterable");
        let brand = next
            .entity_schema("product")
            .and_then(|s| s.references.get("brand"))
            .expect("brand");
        assert!(brand.filterable && brand.filterable_inherited);
    }

    #[test]
    fn replayed_creates_and_removes_are_noops() {
        let schema = product_schema();
        let target = TargetIdentity::schema("products");
        let next = apply_schema_mutations(
            &target,
            &schema,
            &[modify_product(vec![
                SchemaMutation::CreateAttribute(AttributeSchema::new("name", ValueType::Text)),
                SchemaMutation::RemoveAssociatedData {
                    name: "missing".into(),
                },
            ])],
        )
        .expect("replay");
        assert_eq!(
            next.entity_schema("product").map(|s| s.attributes.len()),
            Some(2)
        );

        let err = apply_schema_mutations(
            &target,
            &schema,
            &[modify_product(vec![SchemaMutation::CreateAttribute(
                AttributeSchema::new("name", ValueType::Integer),
            )])],
        )
        .expect_err("conflicting create");
        assert!(err.to_string().contains("different definition"));
    }

    #[test]
    fn reference_attribute_needs_present_reference() {
        let target = TargetIdentity::entity("products", "product", 1);
        let base = Entity::empty("product", 1);
        let err = apply_entity_mutations(
            &target,
            &base,
            &[Mutation::Reference(ReferenceMutation::Attribute {
                name: "brand".into(),
                primary_key: 2,
                mutation: crate::commit::mutation::AttributeMutation::Remove {
                    name: "priority".into(),
                    locale: None,
                },
            })],
        )
        .expect_err("missing reference");
        assert!(matches!(err, RemodbError::InvalidMutation { .. }));

        let entity = apply_entity_mutations(
            &target,
            &base,
            &[
                Mutation::set_attribute("name", Value::text("Widget")),
                Mutation::insert_reference("brand", 2),
            ],
        )
        .expect("apply");
        assert_eq!(entity.attribute("name", None), Some(&Value::text("Widget")));
        assert!(entity.reference("brand", 2).is_some());
    }
}
