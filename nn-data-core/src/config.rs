//! Network-level constants consumed by the dataset kernels

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Targets and scales for the scaled-marginal cross-entropy family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginalConfig {
    /// Activation above which a present target stops costing
    pub one_target: f32,
    /// Activation below which an absent target stops costing
    pub zero_target: f32,
    /// Scale on the present-target term
    pub one_scale: f32,
    /// Scale on the absent-target term
    pub zero_scale: f32,
}

impl Default for MarginalConfig {
    fn default() -> Self {
        Self {
            one_target: 0.9,
            zero_target: 0.1,
            one_scale: 1.0,
            zero_scale: 1.0,
        }
    }
}

/// Input denoising settings
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoisingConfig {
    /// Probability of dropping a stored entry, in [0, 1)
    pub probability: f32,
    /// RNG seed, drawn from the OS when absent
    pub seed: Option<u64>,
}

impl DenoisingConfig {
    /// Scale applied to kept entries
    pub fn keep_scale(&self) -> f32 {
        1.0 / (1.0 - self.probability)
    }
}

/// Clamp protecting logarithms in the cross-entropy family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClampConfig {
    /// Floor inside every logarithm
    pub min_error: f32,
}

impl Default for ClampConfig {
    fn default() -> Self {
        Self { min_error: 1.0e-12 }
    }
}

/// Configuration attached to a dataset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Scaled-marginal cross-entropy constants
    pub marginal: MarginalConfig,
    /// Denoising settings
    pub denoising: DenoisingConfig,
    /// Numeric clamps
    pub clamp: ClampConfig,
}

impl DatasetConfig {
    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DatasetConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let p = self.denoising.probability;
        if !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidArgument(format!(
                "denoising probability must be in [0, 1), got {p}"
            )));
        }
        if self.clamp.min_error <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "min_error must be positive, got {}",
                self.clamp.min_error
            )));
        }
        Ok(())
    }
}
