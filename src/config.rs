//! # Configuration
//!
//! Engine tuning loaded with precedence: environment > config file >
//! defaults. Thresholds default to the calibrated scoring policy; override
//! them only when re-tuning the similarity signals.
//!
//! # Example config file (imgmaster.toml)
//! ```toml
//! cluster_kind = "image"
//!
//! [tuning]
//! max_in_flight = 16
//! merge_threshold = 80
//! similar_threshold = 40
//! ```

use crate::identity::HAMMING_PREFILTER;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Scoring and concurrency knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Concurrency ceiling of the shared task runner
    pub max_in_flight: usize,
    /// Total pairwise score at or above which two clusters merge
    pub merge_threshold: u32,
    /// Total pairwise score at or above which two clusters are marked
    /// similar (below the merge threshold)
    pub similar_threshold: u32,
    /// Coarse hamming distance past which perceptual candidates are pruned
    pub hamming_prefilter: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            merge_threshold: 80,
            similar_threshold: 40,
            hamming_prefilter: HAMMING_PREFILTER,
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Domain category assigned to new clusters
    pub cluster_kind: String,
    pub tuning: Tuning,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_kind: "image".to_string(),
            tuning: Tuning::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration with precedence: Env > File > Defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("IMGMASTER_").split("__"))
            .extract()
    }
}
