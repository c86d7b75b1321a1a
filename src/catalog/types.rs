use crate::catalog::schema::CatalogSchema;
use compact_str::CompactString;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ValueType {
    Text,
    Integer,
    Boolean,
    Timestamp,
    Json,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Timestamp => "timestamp",
            ValueType::Json => "json",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Value {
    Text(CompactString),
    Integer(i64),
    Boolean(bool),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Json(serde_json::Value),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Text(_) => ValueType::Text,
            Value::Integer(_) => ValueType::Integer,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Json(_) => ValueType::Json,
        }
    }

    pub fn text(value: impl Into<CompactString>) -> Self {
        Value::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// BCP 47 style language tag such as `en` or `cs-CZ`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Locale(String);

impl Locale {
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts = tag.split('-');
        let language = parts.next()?;
        if !(2..=3).contains(&language.len()) || !language.chars().all(|c| c.is_ascii_alphabetic())
        {
            return None;
        }
        for part in parts {
            if part.is_empty() || part.len() > 8 || !part.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return None;
            }
        }
        Some(Locale(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute or associated data slot: a field name plus an optional locale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey {
    pub name: String,
    pub locale: Option<Locale>,
}

impl FieldKey {
    pub fn new(name: impl Into<String>, locale: Option<Locale>) -> Self {
        Self {
            name: name.into(),
            locale,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}:{}", self.name, locale),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceKey {
    pub name: String,
    pub primary_key: u32,
}

/// Serializes struct-keyed maps as `[key, value]` pairs so they survive
/// formats that only allow string map keys.
mod pairs {
    use im::OrdMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, K, V>(map: &OrdMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize + Ord + Clone,
        V: Serialize + Clone,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<OrdMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord + Clone,
        V: Deserialize<'de> + Clone,
    {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReferenceState {
    #[serde(with = "pairs")]
    pub attributes: OrdMap<FieldKey, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub entity_type: String,
    pub primary_key: u32,
    /// Optimistic-lock counter. Zero means the entity does not exist yet.
    pub version: u64,
    #[serde(with = "pairs")]
    pub attributes: OrdMap<FieldKey, Value>,
    #[serde(with = "pairs")]
    pub associated_data: OrdMap<FieldKey, Value>,
    #[serde(with = "pairs")]
    pub references: OrdMap<ReferenceKey, ReferenceState>,
}

impl Entity {
    pub fn empty(entity_type: impl Into<String>, primary_key: u32) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key,
            version: 0,
            attributes: OrdMap::new(),
            associated_data: OrdMap::new(),
            references: OrdMap::new(),
        }
    }

    pub fn attribute(&self, name: &str, locale: Option<&Locale>) -> Option<&Value> {
        self.attributes.get(&FieldKey::new(name, locale.cloned()))
    }

    pub fn associated_data(&self, name: &str, locale: Option<&Locale>) -> Option<&Value> {
        self.associated_data
            .get(&FieldKey::new(name, locale.cloned()))
    }

    pub fn reference(&self, name: &str, primary_key: u32) -> Option<&ReferenceState> {
        self.references.get(&ReferenceKey {
            name: name.to_string(),
            primary_key,
        })
    }

    pub fn to_reference(&self) -> EntityReference {
        EntityReference::new(self.entity_type.clone(), self.primary_key, self.version)
    }
}

/// Lightweight pointer to an entity version.
///
/// `reference_version` is the only counter with locking semantics. The
/// `version` field predates it and is kept for wire compatibility: it mirrors
/// `reference_version` when built locally and is never consulted for conflict
/// detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityReference {
    pub entity_type: String,
    pub primary_key: u32,
    pub reference_version: u64,
    #[deprecated(note = "use reference_version; kept for wire compatibility only")]
    pub version: u64,
}

impl EntityReference {
    #[allow(deprecated)]
    pub fn new(entity_type: impl Into<String>, primary_key: u32, reference_version: u64) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key,
            reference_version,
            version: reference_version,
        }
    }
}

/// Identity of an optimistic-locking target: a catalog schema, or one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetIdentity {
    CatalogSchema {
        catalog: String,
    },
    Entity {
        catalog: String,
        entity_type: String,
        primary_key: u32,
    },
}

impl TargetIdentity {
    pub fn schema(catalog: impl Into<String>) -> Self {
        TargetIdentity::CatalogSchema {
            catalog: catalog.into(),
        }
    }

    pub fn entity(catalog: impl Into<String>, entity_type: impl Into<String>, primary_key: u32) -> Self {
        TargetIdentity::Entity {
            catalog: catalog.into(),
            entity_type: entity_type.into(),
            primary_key,
        }
    }

    pub fn catalog(&self) -> &str {
        match self {
            TargetIdentity::CatalogSchema { catalog } => catalog,
            TargetIdentity::Entity { catalog, .. } => catalog,
        }
    }

    pub fn entity_type(&self) -> Option<&str> {
        match self {
            TargetIdentity::CatalogSchema { .. } => None,
            TargetIdentity::Entity { entity_type, .. } => Some(entity_type),
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetIdentity::CatalogSchema { catalog } => write!(f, "{catalog}:schema"),
            TargetIdentity::Entity {
                catalog,
                entity_type,
                primary_key,
            } => write!(f, "{catalog}:{entity_type}#{primary_key}"),
        }
    }
}

/// Immutable snapshot of a schema or entity at a given version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VersionedEntity {
    CatalogSchema(Arc<CatalogSchema>),
    Entity { catalog: String, entity: Arc<Entity> },
}

impl VersionedEntity {
    pub fn version(&self) -> u64 {
        match self {
            VersionedEntity::CatalogSchema(schema) => schema.version,
            VersionedEntity::Entity { entity, .. } => entity.version,
        }
    }

    pub fn identity(&self) -> TargetIdentity {
        match self {
            VersionedEntity::CatalogSchema(schema) => TargetIdentity::schema(schema.name.clone()),
            VersionedEntity::Entity { catalog, entity } => {
                TargetIdentity::entity(catalog.clone(), entity.entity_type.clone(), entity.primary_key)
            }
        }
    }

    /// Snapshot for a target that has never been written.
    pub fn absent(target: &TargetIdentity) -> Self {
        match target {
            TargetIdentity::CatalogSchema { catalog } => {
                VersionedEntity::CatalogSchema(Arc::new(CatalogSchema::new(catalog.clone())))
            }
            TargetIdentity::Entity {
                catalog,
                entity_type,
                primary_key,
            } => VersionedEntity::Entity {
                catalog: catalog.clone(),
                entity: Arc::new(Entity::empty(entity_type.clone(), *primary_key)),
            },
        }
    }

    pub fn as_schema(&self) -> Option<&Arc<CatalogSchema>> {
        match self {
            VersionedEntity::CatalogSchema(schema) => Some(schema),
            VersionedEntity::Entity { .. } => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Arc<Entity>> {
        match self {
            VersionedEntity::CatalogSchema(_) => None,
            VersionedEntity::Entity { entity, .. } => Some(entity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Entity, Locale, TargetIdentity, Value, ValueType, VersionedEntity};

    #[test]
    fn locale_tags_are_validated() {
        assert!(Locale::parse("en").is_some());
        assert!(Locale::parse("cs-CZ").is_some());
        assert!(Locale::parse("").is_none());
        assert!(Locale::parse("english").is_none());
        assert!(Locale::parse("en-").is_none());
    }

    #[test]
    #[allow(deprecated)]
    fn entity_reference_keeps_legacy_version_in_sync() {
        let mut entity = Entity::empty("product", 10);
        entity.version = 4;
        let reference = entity.to_reference();
        assert_eq!(reference.reference_version, 4);
        assert_eq!(reference.version, 4);
    }

    #[test]
    fn absent_snapshots_start_at_version_zero() {
        let target = TargetIdentity::entity("products", "product", 1);
        let absent = VersionedEntity::absent(&target);
        assert_eq!(absent.version(), 0);
        assert_eq!(absent.identity(), target);
        assert_eq!(target.to_string(), "products:product#1");
        assert_eq!(Value::text("x").value_type(), ValueType::Text);
    }
}
