//! Release identity injected into child processes as `OPWIRE_EDITION`.

use serde::Deserialize;
use serde::Serialize;

pub const OPWIRE_EDITION: &str = "OPWIRE_EDITION";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edition {
    pub revision: String,
    pub version: String,
}

impl Edition {
    pub fn new(revision: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            version: version.into(),
        }
    }

    pub fn to_env_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
