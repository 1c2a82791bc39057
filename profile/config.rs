use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Minimum amount of background to consider, relative to and independent of the
/// true allele that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionThresholds {
    /// Percentage of the true allele's reads, per direction.
    pub min_pct: f64,
    /// Absolute number of reads, per direction.
    pub min_abs: u64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            min_pct: 0.5,
            min_abs: 5,
        }
    }
}

/// Iteration caps and convergence tolerance for the alternating least-squares solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    /// Relative decrease of the squared residual below which a loop stops.
    pub tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_outer_iterations: 200,
            max_inner_iterations: 200,
            tolerance: 1e-4,
        }
    }
}

/// The complete set of tunables for a profile estimation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub detection: DetectionThresholds,
    /// Minimum number of samples required for each true allele.
    pub min_samples: usize,
    /// Minimum number of samples in which a background product must be detected,
    /// as a percentage of the samples carrying a given true allele.
    pub min_sample_pct: f64,
    pub solver: SolverConfig,
    pub variance: bool,
    pub homozygotes_only: bool,
    pub marker: Option<String>,
    /// Simulate lower sequencing depth by thinning each sample to this many reads.
    pub limit_reads: Option<u64>,
    /// Fraction of the input samples to drop at random.
    pub drop_samples: f64,
    pub seed: Option<u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            detection: DetectionThresholds::default(),
            min_samples: 2,
            min_sample_pct: 80.0,
            solver: SolverConfig::default(),
            variance: false,
            homozygotes_only: false,
            marker: None,
            limit_reads: None,
            drop_samples: 0.0,
            seed: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

impl EstimatorConfig {
    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, message: &str| ConfigError::InvalidValue {
            field,
            message: message.to_string(),
        };

        if !(self.detection.min_pct >= 0.0) {
            return Err(invalid("detection.min_pct", "must be a non-negative percentage"));
        }
        if !(0.0..=100.0).contains(&self.min_sample_pct) {
            return Err(invalid("min_sample_pct", "must lie between 0 and 100"));
        }
        if !(self.solver.tolerance > 0.0) {
            return Err(invalid("solver.tolerance", "must be positive"));
        }
        if self.solver.max_outer_iterations == 0 {
            return Err(invalid("solver.max_outer_iterations", "must be at least 1"));
        }
        if self.solver.max_inner_iterations == 0 {
            return Err(invalid("solver.max_inner_iterations", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.drop_samples) {
            return Err(invalid("drop_samples", "must be a fraction in [0, 1)"));
        }
        if self.limit_reads == Some(0) {
            return Err(invalid("limit_reads", "must be at least 1"));
        }
        Ok(())
    }
}
