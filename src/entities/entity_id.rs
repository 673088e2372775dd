use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Address of a durable entity.
///
/// The name is stored lowercased. The instance id form is `@name@key`; the key may itself
/// contain `@`.
///
/// # Ordering
///
/// Entity ids are totally ordered by name, then key, both compared ordinally (byte-wise).
/// Every lock request sorts its lock set with this order before the first message is sent,
/// so any two critical sections over overlapping entities acquire the shared ones in the same
/// relative order. Changing this order breaks deadlock freedom for in-flight lock chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    name: String,
    key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not an entity instance id")]
pub struct EntityIdParseError(pub String);

impl EntityId {
    pub fn new(name: impl AsRef<str>, key: impl Into<String>) -> Self {
        Self {
            name: name.as_ref().to_lowercase(),
            key: key.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Instance id used to address this entity in the backend.
    pub fn instance_id(&self) -> String {
        self.to_string()
    }
}

/// True for instance ids that address entities rather than orchestrations.
pub fn is_entity_instance(instance_id: &str) -> bool {
    instance_id.starts_with('@')
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .as_bytes()
            .cmp(other.name.as_bytes())
            .then_with(|| self.key.as_bytes().cmp(other.key.as_bytes()))
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}@{}", self.name, self.key)
    }
}

impl FromStr for EntityId {
    type Err = EntityIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix('@').ok_or_else(|| EntityIdParseError(s.to_string()))?;
        let (name, key) = rest.split_once('@').ok_or_else(|| EntityIdParseError(s.to_string()))?;
        if name.is_empty() {
            return Err(EntityIdParseError(s.to_string()));
        }
        Ok(EntityId::new(name, key))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
