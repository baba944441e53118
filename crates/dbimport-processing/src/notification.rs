//! Storage-change notifications delivered as CloudEvents.
//!
//! Structured mode carries the envelope and the object metadata in one JSON
//! body:
//!
//! ```json
//! {"type": "google.cloud.storage.object.v1.finalized",
//!  "source": "//storage.googleapis.com/projects/_/buckets/artifacts",
//!  "data": {"bucket": "artifacts", "name": "2024-01-01/run.json"}}
//! ```
//!
//! Binary mode puts the envelope into `ce-*` headers and only the object
//! metadata into the body.

use serde::{Deserialize, Serialize};

use crate::error::NotificationError;

pub const OBJECT_FINALIZED: &str = "google.cloud.storage.object.v1.finalized";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNotification {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: ObjectData,
}

impl StorageNotification {
    pub fn finalized(bucket: &str, name: &str) -> Self {
        Self {
            event_type: OBJECT_FINALIZED.to_string(),
            source: None,
            id: None,
            data: ObjectData {
                bucket: Some(bucket.to_string()),
                name: name.to_string(),
            },
        }
    }

    pub fn from_structured(body: &[u8]) -> Result<Self, NotificationError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn from_binary(
        event_type: &str,
        source: Option<&str>,
        id: Option<&str>,
        body: &[u8],
    ) -> Result<Self, NotificationError> {
        Ok(Self {
            event_type: event_type.to_string(),
            source: source.map(str::to_string),
            id: id.map(str::to_string),
            data: serde_json::from_slice(body)?,
        })
    }

    /// Checks the event is an object-finalized event for `bucket` and
    /// returns the object name.
    pub fn validate(&self, bucket: &str) -> Result<&str, NotificationError> {
        if self.event_type != OBJECT_FINALIZED {
            return Err(NotificationError::UnexpectedType(self.event_type.clone()));
        }
        if self.data.name.is_empty() {
            return Err(NotificationError::MissingName);
        }
        if let Some(actual) = &self.data.bucket {
            if actual != bucket {
                return Err(NotificationError::BucketMismatch {
                    expected: bucket.to_string(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(&self.data.name)
    }
}
