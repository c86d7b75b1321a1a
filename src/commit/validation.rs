use crate::catalog::schema::{AttributeSchema, CatalogSchema, EntitySchema};
use crate::catalog::types::{Locale, TargetIdentity, Value, ValueType};
use crate::commit::mutation::{
    AssociatedDataMutation, AttributeMutation, Mutation, ReferenceMutation, SchemaMutation,
};
use crate::error::RemodbError;

/// Checks that a batch addresses the right kind of target and that its shape
/// is acceptable before anything is applied.
pub fn validate_batch_shape(
    target: &TargetIdentity,
    mutations: &[Mutation],
) -> Result<(), RemodbError> {
    if mutations.is_empty() {
        return Err(invalid(target, "mutation batch is empty"));
    }
    match target {
        TargetIdentity::CatalogSchema { .. } => {
            for mutation in mutations {
                let Mutation::Schema(schema_mutation) = mutation else {
                    return Err(invalid(
                        target,
                        "entity mutations cannot target the catalog schema",
                    ));
                };
                validate_catalog_scope(target, schema_mutation)?;
            }
        }
        TargetIdentity::Entity { primary_key, .. } => {
            if *primary_key == 0 {
                return Err(invalid(target, "primary key must be positive"));
            }
            if mutations.iter().any(Mutation::is_schema) {
                return Err(invalid(target, "schema mutations must target the catalog schema"));
            }
        }
    }
    Ok(())
}

fn validate_catalog_scope(
    target: &TargetIdentity,
    mutation: &SchemaMutation,
) -> Result<(), RemodbError> {
    match mutation {
        SchemaMutation::ModifyDescription { .. }
        | SchemaMutation::CreateAttribute(_)
        | SchemaMutation::RemoveAttribute { .. }
        | SchemaMutation::ModifyAttribute { .. }
        | SchemaMutation::CreateEntitySchema { .. }
        | SchemaMutation::RemoveEntitySchema { .. } => Ok(()),
        SchemaMutation::ModifyEntitySchema { entity_type, mutations } => {
            if entity_type.is_empty() {
                return Err(invalid(target, "entity type must not be empty"));
            }
            for nested in mutations {
                if matches!(
                    nested,
                    SchemaMutation::ModifyEntitySchema { .. }
                        | SchemaMutation::CreateEntitySchema { .. }
                        | SchemaMutation::RemoveEntitySchema { .. }
                ) {
                    return Err(invalid(
                        target,
                        format!("nested entity schema lifecycle mutation inside '{entity_type}'"),
                    ));
                }
            }
            Ok(())
        }
        other => Err(invalid(
            target,
            format!(
                "{} is only valid inside an entity schema modification",
                schema_mutation_name(other)
            ),
        )),
    }
}

/// Validates entity mutations against the declared schema: names must exist,
/// value types must match and locales must agree with the localized flag.
pub fn validate_entity_mutation(
    schema: &CatalogSchema,
    target: &TargetIdentity,
    mutation: &Mutation,
) -> Result<(), RemodbError> {
    let Some(entity_type) = target.entity_type() else {
        return Err(invalid(target, "entity mutation without entity target"));
    };
    let Some(entity_schema) = schema.entity_schema(entity_type) else {
        return Err(invalid(
            target,
            format!("entity schema '{entity_type}' does not exist"),
        ));
    };
    match mutation {
        Mutation::Attribute(m) => {
            let attribute = schema
                .resolve_attribute(entity_type, m.name())
                .ok_or_else(|| invalid(target, format!("attribute '{}' is not declared", m.name())))?;
            validate_attribute_mutation(target, attribute, m)
        }
        Mutation::AssociatedData(m) => validate_associated_data(target, entity_schema, m),
        Mutation::Reference(m) => validate_reference(target, entity_schema, m),
        Mutation::Schema(_) => Err(invalid(
            target,
            "schema mutations must target the catalog schema",
        )),
    }
}

fn validate_attribute_mutation(
    target: &TargetIdentity,
    attribute: &AttributeSchema,
    mutation: &AttributeMutation,
) -> Result<(), RemodbError> {
    check_locale(target, &attribute.name, attribute.localized, mutation.locale())?;
    if let AttributeMutation::Upsert { value, .. } = mutation {
        check_value_type(target, &attribute.name, attribute.value_type, value)?;
    }
    Ok(())
}

fn validate_associated_data(
    target: &TargetIdentity,
    entity_schema: &EntitySchema,
    mutation: &AssociatedDataMutation,
) -> Result<(), RemodbError> {
    let (name, locale, value) = match mutation {
        AssociatedDataMutation::Upsert {
            name,
            locale,
            value,
        } => (name, locale, Some(value)),
        AssociatedDataMutation::Remove { name, locale } => (name, locale, None),
    };
    let declared = entity_schema
        .associated_data
        .get(name)
        .ok_or_else(|| invalid(target, format!("associated data '{name}' is not declared")))?;
    check_locale(target, name, declared.localized, locale.as_ref())?;
    if let Some(value) = value {
        check_value_type(target, name, declared.value_type, value)?;
    }
    Ok(())
}

fn validate_reference(
    target: &TargetIdentity,
    entity_schema: &EntitySchema,
    mutation: &ReferenceMutation,
) -> Result<(), RemodbError> {
    let key = mutation.reference_key();
    let reference = entity_schema
        .references
        .get(&key.name)
        .ok_or_else(|| invalid(target, format!("reference '{}' is not declared", key.name)))?;
    if key.primary_key == 0 {
        return Err(invalid(
            target,
            format!("reference '{}' needs a positive primary key", key.name),
        ));
    }
    if let ReferenceMutation::Attribute { mutation, .. } = mutation {
        let attribute = reference.attributes.get(mutation.name()).ok_or_else(|| {
            invalid(
                target,
                format!(
                    "attribute '{}' is not declared on reference '{}'",
                    mutation.name(),
                    key.name
                ),
            )
        })?;
        validate_attribute_mutation(target, attribute, mutation)?;
    }
    Ok(())
}

fn check_locale(
    target: &TargetIdentity,
    field: &str,
    localized: bool,
    locale: Option<&Locale>,
) -> Result<(), RemodbError> {
    match (localized, locale) {
        (true, None) => Err(RemodbError::LocaleViolation {
            target: target.clone(),
            field: field.to_string(),
            reason: "is localized and requires a locale".into(),
        }),
        (false, Some(locale)) => Err(RemodbError::LocaleViolation {
            target: target.clone(),
            field: field.to_string(),
            reason: format!("is not localized but locale '{locale}' was given"),
        }),
        _ => Ok(()),
    }
}

fn check_value_type(
    target: &TargetIdentity,
    field: &str,
    expected: ValueType,
    value: &Value,
) -> Result<(), RemodbError> {
    if value.value_type() != expected {
        return Err(invalid(
            target,
            format!(
                "field '{field}' expects {expected}, got {}",
                value.value_type()
            ),
        ));
    }
    Ok(())
}

/// Structural checks on a schema after a batch has been folded into it.
pub fn validate_catalog_schema(
    target: &TargetIdentity,
    schema: &CatalogSchema,
) -> Result<(), RemodbError> {
    for (entity_type, entity_schema) in schema.entity_schemas.iter() {
        for compound in entity_schema.sortable_attribute_compounds.values() {
            if compound.elements.len() < 2 {
                return Err(invalid(
                    target,
                    format!(
                        "sortable compound '{}' on '{entity_type}' needs at least two attributes",
                        compound.name
                    ),
                ));
            }
            for element in &compound.elements {
                if schema
                    .resolve_attribute(entity_type, &element.attribute_name)
                    .is_none()
                {
                    return Err(invalid(
                        target,
                        format!(
                            "sortable compound '{}' on '{entity_type}' references missing attribute '{}'",
                            compound.name, element.attribute_name
                        ),
                    ));
                }
            }
        }
        for reference in entity_schema.references.values() {
            if reference.referenced_entity_type.is_empty() {
                return Err(invalid(
                    target,
                    format!("reference '{}' has no referenced entity type", reference.name),
                ));
            }
        }
    }
    Ok(())
}

pub(crate) fn schema_mutation_name(mutation: &SchemaMutation) -> &'static str {
    match mutation {
        SchemaMutation::ModifyDescription { .. } => "ModifyDescription",
        SchemaMutation::CreateAttribute(_) => "CreateAttribute",
        SchemaMutation::RemoveAttribute { .. } => "RemoveAttribute",
        SchemaMutation::ModifyAttribute { .. } => "ModifyAttribute",
        SchemaMutation::CreateSortableAttributeCompound(_) => "CreateSortableAttributeCompound",
        SchemaMutation::RemoveSortableAttributeCompound { .. } => "RemoveSortableAttributeCompound",
        SchemaMutation::ModifySortableAttributeCompound { .. } => "ModifySortableAttributeCompound",
        SchemaMutation::CreateAssociatedData(_) => "CreateAssociatedData",
        SchemaMutation::RemoveAssociatedData { .. } => "RemoveAssociatedData",
        SchemaMutation::CreateReference(_) => "CreateReference",
        SchemaMutation::RemoveReference { .. } => "RemoveReference",
        SchemaMutation::SetReferenceFilterable { .. } => "SetReferenceFilterable",
        SchemaMutation::CreateEntitySchema { .. } => "CreateEntitySchema",
        SchemaMutation::RemoveEntitySchema { .. } => "RemoveEntitySchema",
        SchemaMutation::ModifyEntitySchema { .. } => "ModifyEntitySchema",
    }
}

pub(crate) fn invalid(target: &TargetIdentity, reason: impl Into<String>) -> RemodbError {
    RemodbError::InvalidMutation {
        target: target.clone(),
        reason: reason.into(),
    }
}
