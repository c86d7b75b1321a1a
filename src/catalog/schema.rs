use crate::catalog::types::ValueType;
use im::OrdMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub value_type: ValueType,
    #[serde(default)]
    pub localized: bool,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub sortable: bool,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            description: None,
            value_type,
            localized: false,
            filterable: false,
            sortable: false,
        }
    }

    pub fn localized(mut self) -> Self {
        self.localized = true;
        self
    }

    pub fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociatedDataSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub value_type: ValueType,
    #[serde(default)]
    pub localized: bool,
}

impl AssociatedDataSchema {
    pub fn new(name: impl Into<String>, value_type: ValueType, localized: bool) -> Self {
        Self {
            name: name.into(),
            description: None,
            value_type,
            localized,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceSchema {
    pub name: String,
    pub referenced_entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filterable: bool,
    /// When set, `filterable` mirrors the reflected reference and the stored
    /// value is only a local override.
    #[serde(default)]
    pub filterable_inherited: bool,
    #[serde(default)]
    pub attributes: OrdMap<String, AttributeSchema>,
}

impl ReferenceSchema {
    pub fn new(name: impl Into<String>, referenced_entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_entity_type: referenced_entity_type.into(),
            description: None,
            filterable: false,
            filterable_inherited: false,
            attributes: OrdMap::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeElement {
    pub attribute_name: String,
    pub direction: OrderDirection,
}

impl AttributeElement {
    pub fn asc(attribute_name: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(attribute_name: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            direction: OrderDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortableAttributeCompoundSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub elements: Vec<AttributeElement>,
}

impl SortableAttributeCompoundSchema {
    pub fn new(name: impl Into<String>, elements: Vec<AttributeElement>) -> Self {
        Self {
            name: name.into(),
            description: None,
            elements,
        }
    }

    pub fn references_attribute(&self, attribute_name: &str) -> bool {
        self.elements
            .iter()
            .any(|e| e.attribute_name == attribute_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitySchema {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: OrdMap<String, AttributeSchema>,
    #[serde(default)]
    pub associated_data: OrdMap<String, AssociatedDataSchema>,
    #[serde(default)]
    pub references: OrdMap<String, ReferenceSchema>,
    #[serde(default)]
    pub sortable_attribute_compounds: OrdMap<String, SortableAttributeCompoundSchema>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            description: None,
            attributes: OrdMap::new(),
            associated_data: OrdMap::new(),
            references: OrdMap::new(),
            sortable_attribute_compounds: OrdMap::new(),
        }
    }

    /// Compounds that would dangle if `attribute_name` disappeared.
    pub fn compounds_referencing(&self, attribute_name: &str) -> Vec<String> {
        self.sortable_attribute_compounds
            .values()
            .filter(|c| c.references_attribute(attribute_name))
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogSchema {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub description: Option<String>,
    /// Catalog-wide attributes shared by all entity types.
    #[serde(default)]
    pub attributes: OrdMap<String, AttributeSchema>,
    #[serde(default)]
    pub entity_schemas: OrdMap<String, EntitySchema>,
}

impl CatalogSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            description: None,
            attributes: OrdMap::new(),
            entity_schemas: OrdMap::new(),
        }
    }

    pub fn entity_schema(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.entity_schemas.get(entity_type)
    }

    /// Entity-level attribute lookup that falls back to the catalog-wide ones.
    pub fn resolve_attribute(&self, entity_type: &str, name: &str) -> Option<&AttributeSchema> {
        self.entity_schemas
            .get(entity_type)
            .and_then(|s| s.attributes.get(name))
            .or_else(|| self.attributes.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AttributeElement, AttributeSchema, CatalogSchema, EntitySchema,
        SortableAttributeCompoundSchema,
    };
    use crate::catalog::types::ValueType;

    #[test]
    fn resolve_attribute_prefers_entity_level_definition() {
        let mut catalog = CatalogSchema::new("products");
        catalog.attributes.insert(
            "code".into(),
            AttributeSchema::new("code", ValueType::Text),
        );
        let mut product = EntitySchema::new("product");
        product.attributes.insert(
            "code".into(),
            AttributeSchema::new("code", ValueType::Integer),
        );
        catalog.entity_schemas.insert("product".into(), product);

        let resolved = catalog
            .resolve_attribute("product", "code")
            .expect("attribute");
        assert_eq!(resolved.value_type, ValueType::Integer);
        let fallback = catalog
            .resolve_attribute("category", "code")
            .expect("catalog attribute");
        assert_eq!(fallback.value_type, ValueType::Text);
    }

    #[test]
    fn compounds_referencing_lists_dependent_compounds() {
        let mut product = EntitySchema::new("product");
        product.sortable_attribute_compounds.insert(
            "nameAndCode".into(),
            SortableAttributeCompoundSchema::new(
                "nameAndCode",
                vec![AttributeElement::asc("name"), AttributeElement::desc("code")],
            ),
        );
        assert_eq!(product.compounds_referencing("code"), vec!["nameAndCode"]);
        assert!(product.compounds_referencing("ean").is_empty());
    }
}
