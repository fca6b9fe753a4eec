use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::scoring::ScoringPolicy;

const DEFAULT_DB_PATH: &str = "romaneio.db";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_CORRECT_POINTS: i64 = 10;
const DEFAULT_INCORRECT_POINTS: i64 = -5;
const DEFAULT_SIGNATURE_MAX_BYTES: usize = 512 * 1024;
const ENV_PREFIX: &str = "ROMANEIO";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Points written to the ledger when a review is validated.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    #[serde(default = "default_correct_points")]
    pub correct_points: i64,
    #[serde(default = "default_incorrect_points")]
    pub incorrect_points: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            correct_points: DEFAULT_CORRECT_POINTS,
            incorrect_points: DEFAULT_INCORRECT_POINTS,
        }
    }
}

impl From<&ScoringConfig> for ScoringPolicy {
    fn from(value: &ScoringConfig) -> Self {
        ScoringPolicy {
            correct_points: value.correct_points,
            incorrect_points: value.incorrect_points,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureConfig {
    /// Largest decoded signature image accepted
    #[serde(default = "default_signature_max_bytes")]
    pub max_bytes: usize,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_SIGNATURE_MAX_BYTES,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log in JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkflowConfig {
    /// Load an optional TOML file, then apply `ROMANEIO__SECTION__KEY` environment overrides.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<WorkflowConfig>()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scoring.correct_points <= 0 {
            anyhow::bail!("scoring.correct_points must be positive");
        }
        if self.scoring.incorrect_points > 0 {
            anyhow::bail!("scoring.incorrect_points cannot be positive");
        }
        if self.signatures.max_bytes == 0 {
            anyhow::bail!("signatures.max_bytes must be greater than zero");
        }
        Ok(())
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_correct_points() -> i64 {
    DEFAULT_CORRECT_POINTS
}

fn default_incorrect_points() -> i64 {
    DEFAULT_INCORRECT_POINTS
}

fn default_signature_max_bytes() -> usize {
    DEFAULT_SIGNATURE_MAX_BYTES
}
