//! Filesystem backend configuration.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for [`crate::FsBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct FsBackendConfig {
    /// Children per directory fragment.
    #[builder(default = "64")]
    pub fragment_size: usize,

    /// Files at or above this size are hashed off-thread and verify
    /// asynchronously.
    #[builder(default = "1024 * 1024")]
    pub async_hash_threshold: u64,

    /// Record the last scrub tag seen by each verified path.
    #[builder(default = "true")]
    pub stamp_tags: bool,
}

impl Default for FsBackendConfig {
    fn default() -> Self {
        Self {
            fragment_size: 64,
            async_hash_threshold: 1024 * 1024,
            stamp_tags: true,
        }
    }
}

impl FsBackendConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.fragment_size {
            return Err("fragment_size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl FsBackendConfig {
    /// Create a new config builder.
    pub fn builder() -> FsBackendConfigBuilder {
        FsBackendConfigBuilder::default()
    }

    /// Check a config that did not come through the builder.
    pub fn validate(&self) -> Result<(), String> {
        if self.fragment_size == 0 {
            return Err("fragment_size must be at least 1".to_string());
        }
        Ok(())
    }
}
