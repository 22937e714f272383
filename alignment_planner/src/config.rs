// config.rs

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};
use thiserror::Error;

use crate::celestial::RetryPolicy;
use crate::{AlignmentPlannerError, Landmark, SearchMode};

const APP_NAME: &str = "alignment_planner";
const CONFIG_FILE_NAME: &str = "config.json";
/// Largest UTC offset in use anywhere (hours).
const MAX_UTC_OFFSET_HOURS: i32 = 14;

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    });
    dir.push(APP_NAME);
    dir.push(CONFIG_FILE_NAME);
    dir
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for AlignmentPlannerError {
    fn from(err: ConfigError) -> Self {
        AlignmentPlannerError::ConfigError(err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub landmark: Landmark,
    /// Offset of the local calendar used for dates
    pub utc_offset_hours: i32,
    pub cache_ttl_hours: i64,
    pub search_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Modes refreshed by the maintenance jobs
    pub recompute_modes: Vec<SearchMode>,
    /// A job lease older than this may be taken over
    pub job_lease_minutes: i64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            landmark: Landmark::default(),
            utc_offset_hours: 9,
            cache_ttl_hours: 24 * 30,
            search_timeout_secs: 120,
            retry: RetryConfig::default(),
            recompute_modes: vec![SearchMode::Balanced],
            job_lease_minutes: 60,
        }
    }
}

impl PlannerConfig {
    /// Load from the default location, or return defaults if missing
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lm = &self.landmark;
        if !(lm.latitude.is_finite() && (-90.0..=90.0).contains(&lm.latitude)) {
            return Err(ConfigError::Invalid(format!(
                "landmark latitude {} out of range",
                lm.latitude
            )));
        }
        if !(lm.longitude.is_finite() && (-180.0..=180.0).contains(&lm.longitude)) {
            return Err(ConfigError::Invalid(format!(
                "landmark longitude {} out of range",
                lm.longitude
            )));
        }
        if !(lm.apex_height.is_finite() && lm.apex_height > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "landmark apex height {} must be positive",
                lm.apex_height
            )));
        }
        if self.utc_offset_hours.abs() > MAX_UTC_OFFSET_HOURS {
            return Err(ConfigError::Invalid(format!(
                "utc offset {}h out of range",
                self.utc_offset_hours
            )));
        }
        if self.cache_ttl_hours <= 0 || self.job_lease_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "cache ttl and job lease must be positive".to_string(),
            ));
        }
        if self.recompute_modes.contains(&SearchMode::Auto) {
            return Err(ConfigError::Invalid(
                "recompute modes must be concrete, not auto".to_string(),
            ));
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> Result<chrono::FixedOffset, ConfigError> {
        chrono::FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            ConfigError::Invalid(format!("utc offset {}h out of range", self.utc_offset_hours))
        })
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours)
    }

    pub fn search_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.search_timeout_secs)
    }

    pub fn job_lease(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.job_lease_minutes)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_backoff: std::time::Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(self.retry.max_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = PlannerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.landmark.apex_height, 3776.0);
        assert_eq!(cfg.utc_offset().unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(cfg.cache_ttl().num_days(), 30);
        assert_eq!(cfg.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut cfg = PlannerConfig::default();
        cfg.utc_offset_hours = 0;
        cfg.recompute_modes = vec![SearchMode::Fast, SearchMode::Balanced];
        cfg.save_to(&path).unwrap();

        let loaded = PlannerConfig::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "search_timeout_secs": 5 }"#).unwrap();

        let loaded = PlannerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.search_timeout_secs, 5);
        assert_eq!(loaded.landmark, Landmark::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = PlannerConfig::default();
        cfg.landmark.latitude = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = PlannerConfig::default();
        cfg.landmark.apex_height = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = PlannerConfig::default();
        cfg.utc_offset_hours = 15;
        assert!(cfg.validate().is_err());

        let mut cfg = PlannerConfig::default();
        cfg.recompute_modes = vec![SearchMode::Auto];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{ landmark: ").unwrap();
        let err = PlannerConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
        let crate_err: AlignmentPlannerError = err.into();
        assert!(matches!(crate_err, AlignmentPlannerError::ConfigError(_)));
    }
}
