//! Scrub scheduler configuration.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Configuration for a scrub stack.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ScrubConfig {
    /// Maximum async fetch/verify operations outstanding at once
    /// (None = unlimited; each entry still has at most one).
    #[builder(default)]
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Maximum damage records kept per outcome. Counters are never capped.
    #[builder(default = "1000")]
    #[serde(default = "default_max_damage_records")]
    pub max_damage_records: usize,

    /// Buffer size of the progress broadcast channel.
    #[builder(default = "100")]
    #[serde(default = "default_progress_channel_size")]
    pub progress_channel_size: usize,
}

fn default_max_damage_records() -> usize {
    1000
}

fn default_progress_channel_size() -> usize {
    100
}

impl ScrubConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(Some(0)) = self.max_in_flight {
            return Err("max_in_flight must be at least 1".to_string());
        }
        if let Some(0) = self.progress_channel_size {
            return Err("progress_channel_size must be at least 1".to_string());
        }
        Ok(())
    }
}

impl ScrubConfig {
    /// Create a new scrub config builder.
    pub fn builder() -> ScrubConfigBuilder {
        ScrubConfigBuilder::default()
    }

    /// Check a config that did not come through the builder (e.g. deserialized).
    pub fn validate(&self) -> Result<(), String> {
        if self.max_in_flight == Some(0) {
            return Err("max_in_flight must be at least 1".to_string());
        }
        if self.progress_channel_size == 0 {
            return Err("progress_channel_size must be at least 1".to_string());
        }
        Ok(())
    }

    /// Whether another async operation may start with `in_flight` outstanding.
    pub fn has_capacity(&self, in_flight: usize) -> bool {
        self.max_in_flight.is_none_or(|max| in_flight < max)
    }
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            max_damage_records: default_max_damage_records(),
            progress_channel_size: default_progress_channel_size(),
        }
    }
}
