//! Pipeline configuration.
//!
//! A single immutable `PipelineConfig` is built at startup and passed by
//! reference into every stage. Nothing reads configuration from ambient
//! state after that point.
//!
//! ## Loading order
//!
//! 1. Explicit path (the `--config` flag); a failure here is fatal.
//! 2. `TURBINE_CONFIG` environment variable (path to a TOML file).
//! 3. `turbine_service.toml` in the current working directory.
//! 4. Built-in defaults.
//!
//! The database connection string is resolved separately by
//! `database_url()`: `DATABASE_URL` (after loading `.env`) wins over the
//! file's `database_url`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::Period;
use crate::sources::SourceDeclaration;

pub const CONFIG_ENV_VAR: &str = "TURBINE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "turbine_service.toml";

/// Default CSV timestamp layout, e.g. `2024-03-01 00:00:00`.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Anomaly bounds are mean ± this many sample standard deviations.
pub const DEFAULT_OUTLIER_SIGMA: f64 = 2.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no database URL: set DATABASE_URL or database_url in the config file")]
    MissingDatabaseUrl,
}

// ---------------------------------------------------------------------------
// Window lengths
// ---------------------------------------------------------------------------

/// Lengths, in days, of the bounded statistics windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub last_4_weeks_days: i64,
    pub last_2_weeks_days: i64,
    pub last_week_days: i64,
    pub last_day_days: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            last_4_weeks_days: 28,
            last_2_weeks_days: 14,
            last_week_days: 7,
            last_day_days: 1,
        }
    }
}

impl WindowConfig {
    /// Length of the window for `period`; `None` for full history.
    pub fn length(&self, period: Period) -> Option<Duration> {
        let days = match period {
            Period::Full => return None,
            Period::Last4Weeks => self.last_4_weeks_days,
            Period::Last2Weeks => self.last_2_weeks_days,
            Period::LastWeek => self.last_week_days,
            Period::LastDay => self.last_day_days,
        };
        Some(Duration::days(days))
    }
}

// ---------------------------------------------------------------------------
// Pipeline configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory scanned for CSV exports.
    pub source_dir: PathBuf,
    /// Only files starting with this prefix and ending in `.csv` are sources.
    pub source_prefix: String,
    /// chrono format string for the `timestamp` column. RFC 3339 is always
    /// accepted as well.
    pub timestamp_format: String,
    /// Fully consumed sources are moved here when set.
    pub archive_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub outlier_sigma: f64,
    /// Sources whose latest timestamp trails the newest source by more than
    /// this are reported.
    pub max_source_lag_hours: i64,
    pub windows: WindowConfig,
    /// Explicit source-to-turbine declarations. Sources found on disk but not
    /// declared here are ingested without a turbine constraint.
    pub sources: Vec<SourceDeclaration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("data/raw_data"),
            source_prefix: "data_group_".to_string(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            archive_dir: None,
            database_url: None,
            log_level: "info".to_string(),
            log_file: None,
            outlier_sigma: DEFAULT_OUTLIER_SIGMA,
            max_source_lag_hours: 24,
            windows: WindowConfig::default(),
            sources: Vec::new(),
        }
    }
}

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    Explicit(PathBuf),
    EnvVar(PathBuf),
    LocalFile(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigOrigin::Explicit(p) => write!(f, "{}", p.display()),
            ConfigOrigin::EnvVar(p) => write!(f, "{} (from {})", p.display(), CONFIG_ENV_VAR),
            ConfigOrigin::LocalFile(p) => write!(f, "./{}", p.display()),
            ConfigOrigin::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Result of `PipelineConfig::load`.
///
/// Loading runs before the logger exists, so the origin and any skipped
/// candidates are kept here and logged by `log_origin` once it does.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub origin: ConfigOrigin,
    /// Candidate files that were present but could not be used.
    pub skipped: Vec<String>,
}

impl LoadedConfig {
    pub fn log_origin(&self) {
        for reason in &self.skipped {
            warn!("{}, falling back", reason);
        }
        info!(origin = %self.origin, "loaded pipeline config");
    }
}

impl PipelineConfig {
    /// Load configuration following the module-level search order.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        if let Some(path) = explicit {
            return Ok(LoadedConfig {
                config: Self::load_from_file(path)?,
                origin: ConfigOrigin::Explicit(path.to_path_buf()),
                skipped: Vec::new(),
            });
        }

        let mut skipped = Vec::new();

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        return Ok(LoadedConfig {
                            config,
                            origin: ConfigOrigin::EnvVar(p),
                            skipped,
                        });
                    }
                    Err(e) => skipped.push(format!("{} config unusable: {}", CONFIG_ENV_VAR, e)),
                }
            } else {
                skipped.push(format!("{} points to missing file {}", CONFIG_ENV_VAR, path));
            }
        }

        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    return Ok(LoadedConfig {
                        config,
                        origin: ConfigOrigin::LocalFile(local),
                        skipped,
                    });
                }
                Err(e) => skipped.push(format!("./{} unusable: {}", DEFAULT_CONFIG_FILE, e)),
            }
        }

        Ok(LoadedConfig {
            config: Self::default(),
            origin: ConfigOrigin::Defaults,
            skipped,
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.outlier_sigma > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "outlier_sigma must be positive, got {}",
                self.outlier_sigma
            )));
        }
        if self.max_source_lag_hours < 0 {
            return Err(ConfigError::Invalid(
                "max_source_lag_hours must not be negative".to_string(),
            ));
        }

        let w = &self.windows;
        for (name, days) in [
            ("last_4_weeks_days", w.last_4_weeks_days),
            ("last_2_weeks_days", w.last_2_weeks_days),
            ("last_week_days", w.last_week_days),
            ("last_day_days", w.last_day_days),
        ] {
            if days <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "windows.{} must be positive, got {}",
                    name, days
                )));
            }
        }

        let mut ids = HashSet::new();
        let mut owners = HashMap::new();
        for source in &self.sources {
            if !ids.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source '{}' is declared twice",
                    source.id
                )));
            }
            // A turbine reports through exactly one source.
            for turbine in &source.turbines {
                if let Some(other) = owners.insert(*turbine, source.id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "turbine {} is declared in both '{}' and '{}'",
                        turbine, other, source.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve the PostgreSQL connection string.
    pub fn database_url(&self) -> Result<String, ConfigError> {
        dotenv::dotenv().ok();
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.database_url.clone())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn max_source_lag(&self) -> Duration {
        Duration::hours(self.max_source_lag_hours)
    }

    pub fn find_source(&self, source_id: &str) -> Option<&SourceDeclaration> {
        crate::sources::find_source(&self.sources, source_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
