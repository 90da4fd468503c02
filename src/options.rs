//! Runtime configuration

use serde::{Deserialize, Serialize};

use crate::error::BespokeError;

/// Options read once at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Wrap one in every `logging_sample_rate` new arrays with the sampling
    /// layout. Zero disables sampling.
    pub logging_sample_rate: u32,
    /// Keep the process-wide count of live shared-cache blocks.
    pub track_shared_cache_stats: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            logging_sample_rate: 0,
            track_shared_cache_stats: true,
        }
    }
}

impl RuntimeOptions {
    /// Parses options from a JSON document. Missing fields take their
    /// defaults; unknown fields are rejected.
    pub fn from_json(json: &str) -> Result<Self, BespokeError> {
        Ok(serde_json::from_str(json)?)
    }
}
