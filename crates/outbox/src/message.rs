use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message headers, carried next to the payload.
pub type Metadata = HashMap<String, String>;

/// A message as exchanged with the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of this message instance.
    pub uuid: String,

    /// Opaque payload, usually a JSON document.
    pub payload: Vec<u8>,

    /// String headers (correlation IDs and routing hints).
    pub metadata: Metadata,
}

impl Message {
    /// Creates a message with a fresh UUID and no headers.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Creates a message whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Adds a header, replacing any previous value.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds every header of `metadata`.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Decodes the payload from JSON.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
