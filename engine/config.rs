//! # Pipeline Configuration
//!
//! Every hyperparameter of a training run, loadable from and writable to TOML. Missing
//! keys fall back to their defaults, so a configuration file only needs the values it
//! changes.

use crate::crossval::{CrossValidationConfig, CrossValidationError};
use crate::mix::MixingConfig;
use crate::optimize::OptimizationError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error(transparent)]
    CrossValidation(#[from] CrossValidationError),
    #[error(transparent)]
    Optimization(#[from] OptimizationError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seeds reference sampling, the pool split and mixing.
    pub seed: u64,
    /// Column sum after count normalization; the number of features when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization_total: Option<f64>,
    /// Share of each category's samples averaged into the reference matrix.
    pub reference_fraction: f64,
    /// Share of the remaining samples reserved for test mixtures.
    pub test_fraction: f64,
    pub training: MixingConfig,
    pub test: MixingConfig,
    pub cross_validation: CrossValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            normalization_total: None,
            reference_fraction: 0.1,
            test_fraction: 0.5,
            training: MixingConfig {
                n_samples: 200,
                n_per_mixture: 20,
            },
            test: MixingConfig {
                n_samples: 100,
                n_per_mixture: 20,
            },
            cross_validation: CrossValidationConfig::default(),
        }
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates a configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(total) = self.normalization_total {
            if !(total.is_finite() && total > 0.0) {
                return Err(invalid("normalization_total", format!("must be positive, got {total}")));
            }
        }
        if !(self.reference_fraction > 0.0 && self.reference_fraction <= 1.0) {
            return Err(invalid(
                "reference_fraction",
                format!("must lie in (0, 1], got {}", self.reference_fraction),
            ));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(invalid(
                "test_fraction",
                format!("must lie in (0, 1), got {}", self.test_fraction),
            ));
        }
        for (key, mixing) in [("training", &self.training), ("test", &self.test)] {
            if mixing.n_samples == 0 || mixing.n_per_mixture == 0 {
                return Err(invalid(key, "n_samples and n_per_mixture must be positive"));
            }
        }

        let cv = &self.cross_validation;
        if cv.folds < 2 {
            return Err(invalid("cross_validation.folds", format!("need at least 2, got {}", cv.folds)));
        }
        if cv.folds > self.training.n_samples {
            return Err(invalid(
                "cross_validation.folds",
                format!(
                    "{} folds exceed the {} training mixtures",
                    cv.folds, self.training.n_samples
                ),
            ));
        }
        if !(cv.loss.ridge.is_finite() && cv.loss.ridge >= 0.0) {
            return Err(invalid("cross_validation.loss.ridge", "must be finite and non-negative"));
        }
        if !(cv.fista.tolerance.is_finite() && cv.fista.tolerance >= 0.0) {
            return Err(invalid("cross_validation.fista.tolerance", "must be finite and non-negative"));
        }
        if !(cv.fista.restart_tolerance.is_finite() && cv.fista.restart_tolerance >= 0.0) {
            return Err(invalid(
                "cross_validation.fista.restart_tolerance",
                "must be finite and non-negative",
            ));
        }
        cv.lambdas.validate()?;
        cv.fista.step.validate()?;
        Ok(())
    }
}
