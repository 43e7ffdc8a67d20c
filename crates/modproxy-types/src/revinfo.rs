//! Revision descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// The canonical revision descriptor, serialized as the Info artifact.
///
/// Field names are capitalized on the wire (`{"Version": .., "Time": ..}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevInfo {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl RevInfo {
    pub fn new(version: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            time,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProxyError> {
        serde_json::to_vec(self)
            .map_err(|e| ProxyError::backend(format!("failed to encode revision info: {e}")))
    }

    /// Decode an Info artifact. Unknown fields are tolerated.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProxyError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProxyError::backend(format!("corrupt revision info: {e}")))
    }
}

/// A default-branch head as reported by a lister: full revision id plus
/// commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub time: DateTime<Utc>,
}
