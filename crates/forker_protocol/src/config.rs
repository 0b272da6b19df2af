//! Engine configuration (§6, §10.3).
//!
//! Mirrors the serde-defaults-plus-TOML pattern used elsewhere in this
//! workspace for loadable configuration structs.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ForkerError;

/// Gates destructive test hooks (corruption injection, artificial
/// verification delay). Must be `Demo` for those hooks to run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Environment {
    Demo,
    Production,
}

impl Environment {
    pub fn allows_destructive_test_hooks(self) -> bool {
        matches!(self, Environment::Demo)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Demo => write!(f, "Demo"),
            Environment::Production => write!(f, "Production"),
        }
    }
}

impl FromStr for Environment {
    type Err = ForkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Demo" => Ok(Environment::Demo),
            "Production" => Ok(Environment::Production),
            other => Err(ForkerError::Configuration {
                key: "environment".into(),
                reason: format!("unknown environment '{other}', expected Demo or Production"),
            }),
        }
    }
}

fn default_environment() -> Environment {
    Environment::Production
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    pub source: String,
    #[serde(rename = "targetA")]
    pub target_a: String,
    #[serde(rename = "targetB")]
    pub target_b: String,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine: String,
    #[serde(default = "default_processing_dir")]
    pub processing: String,
}

fn default_quarantine_dir() -> String {
    "Quarantine".to_string()
}

fn default_processing_dir() -> String {
    "Processing".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_file_filters")]
    pub file_filters: Vec<String>,
    #[serde(default)]
    pub exclude_extensions: Vec<String>,
    #[serde(default = "default_minimum_file_age_secs")]
    pub minimum_file_age_secs: u64,
    #[serde(default = "default_stability_check_interval_secs")]
    pub stability_check_interval_secs: u64,
    #[serde(default = "default_max_stability_checks")]
    pub max_stability_checks: u32,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
}

fn default_file_filters() -> Vec<String> {
    vec!["*.svs".into(), "*.tiff".into(), "*.ndpi".into()]
}

fn default_minimum_file_age_secs() -> u64 {
    5
}

fn default_stability_check_interval_secs() -> u64 {
    2
}

fn default_max_stability_checks() -> u32 {
    3
}

fn default_rescan_interval_secs() -> u64 {
    30
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            file_filters: default_file_filters(),
            exclude_extensions: Vec::new(),
            minimum_file_age_secs: default_minimum_file_age_secs(),
            stability_check_interval_secs: default_stability_check_interval_secs(),
            max_stability_checks: default_max_stability_checks(),
            rescan_interval_secs: default_rescan_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    120
}

fn default_worker_pool_size() -> usize {
    4
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
}

fn default_connection_string() -> String {
    "forker.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: default_connection_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingConfig {
    /// Corruption-test hook only (§4.5 step 7); refused outside `Demo`.
    #[serde(default)]
    pub verification_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

/// Top-level engine configuration, loaded once at startup (§9: "global
/// mutable state is confined to the configuration").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkerConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ForkerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForkerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ForkerError::io(e, path.display().to_string()))?;
        toml::from_str(&raw).map_err(|e| ForkerError::Configuration {
            key: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForkerError> {
        let path = path.as_ref();
        let raw = toml::to_string_pretty(self).map_err(|e| ForkerError::Configuration {
            key: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, raw).map_err(|e| ForkerError::io(e, path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ForkerConfig {
        ForkerConfig {
            environment: Environment::Demo,
            directories: DirectoriesConfig {
                source: "/data/Input".into(),
                target_a: "/data/DestinationA".into(),
                target_b: "/data/DestinationB".into(),
                quarantine: default_quarantine_dir(),
                processing: default_processing_dir(),
            },
            monitoring: MonitoringConfig::default(),
            target: TargetConfig::default(),
            database: DatabaseConfig::default(),
            testing: TestingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = sample();
        let raw = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ForkerConfig = toml::from_str(&raw).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn minimal_toml_picks_up_defaults() {
        let raw = r#"
            [directories]
            source = "/data/Input"
            targetA = "/data/DestinationA"
            targetB = "/data/DestinationB"
        "#;
        let cfg: ForkerConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(cfg.target.max_attempts, 5);
        assert_eq!(cfg.monitoring.max_stability_checks, 3);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forker.toml");
        let cfg = sample();
        cfg.save(&path).unwrap();
        let loaded = ForkerConfig::load(&path).unwrap();
        assert_eq!(cfg, loaded);
    }
}
