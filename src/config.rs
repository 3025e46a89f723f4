use crate::enums::PassKind;
use crate::inference::{InferencePass, RetryPolicy};
use crate::normalizer::HuWindow;
use crate::range_selector::RangeConfig;
use crate::standardizer::StandardizerConfig;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub standardizer: StandardizerConfig,
    pub hu_window: HuWindow,
    pub coarse: InferencePass,
    pub fine: InferencePass,
    pub range: RangeConfig,
    pub retry: RetryPolicy,
    /// Units processed concurrently; 0 uses every core.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            standardizer: StandardizerConfig::default(),
            hu_window: HuWindow::default(),
            coarse: InferencePass::coarse(),
            fine: InferencePass::fine(),
            range: RangeConfig::default(),
            retry: RetryPolicy::default(),
            workers: 0,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (pass, expected) in [(&self.coarse, PassKind::Coarse), (&self.fine, PassKind::Fine)] {
            if pass.kind != expected {
                return Err(ConfigError::Invalid(format!(
                    "{expected} pass is configured as kind {}",
                    pass.kind
                )));
            }
            pass.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.coarse.overlap != 0.0 {
            warn!(overlap = self.coarse.overlap, "coarse pass configured with overlap");
        }
        if self.fine.overlap < 0.5 {
            warn!(overlap = self.fine.overlap, "fine pass overlap below half a patch");
        }
        if self
            .standardizer
            .target_spacing
            .iter()
            .any(|s| !s.is_finite() || *s <= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "target spacing {:?} must be positive",
                self.standardizer.target_spacing
            )));
        }
        if !(0.0..90.0).contains(&self.standardizer.max_obliquity_deg) {
            return Err(ConfigError::Invalid(format!(
                "max obliquity {} outside [0, 90)",
                self.standardizer.max_obliquity_deg
            )));
        }
        if self.range.min_vertebra_voxels == 0 {
            return Err(ConfigError::Invalid("range.min_vertebra_voxels must be at least 1".into()));
        }
        if !(self.range.expected_vertebra_mm > 0.0) || !(self.range.merge_factor > 1.0) {
            return Err(ConfigError::Invalid(
                "range.expected_vertebra_mm must be positive and range.merge_factor above 1".into(),
            ));
        }
        self.retry.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Stable serialization mixed into cache fingerprints.
    pub fn fingerprint_input(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
