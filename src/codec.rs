//! Opaque payload codec boundary.
//!
//! Orchestration inputs, outputs, and entity state travel as strings. The engine never looks
//! inside them; typed helpers go through a [`DataConverter`].

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("serialization failed: {0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError(e.to_string())
    }
}

pub trait DataConverter: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<String, CodecError>;
    fn deserialize<T: DeserializeOwned>(&self, data: &str) -> Result<T, CodecError>;
}

/// JSON converter used for every payload in this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDataConverter;

impl DataConverter for JsonDataConverter {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &str) -> Result<T, CodecError> {
        Ok(serde_json::from_str(data)?)
    }
}
