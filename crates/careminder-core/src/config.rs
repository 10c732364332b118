use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CareminderError, Result};

pub const DEFAULT_MAX_OCCURRENCES: usize = 8;
pub const DEFAULT_HORIZON_DAYS: u32 = 60;
pub const DEFAULT_DASHBOARD_LIMIT: usize = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Top-level config (careminder.toml + CAREMINDER_* env overrides).
///
/// Nested keys are addressed with a double underscore in the environment,
/// e.g. `CAREMINDER_SCHEDULER__HORIZON_DAYS=90`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CareminderConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Horizon parameters for materialising one-shot triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on triggers submitted per reminder.
    #[serde(default = "default_max_occurrences")]
    pub max_occurrences: usize,
    /// Calendar days scanned forward when materialising triggers.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Entries shown by the "upcoming" summary.
    #[serde(default = "default_dashboard_limit")]
    pub dashboard_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
            horizon_days: DEFAULT_HORIZON_DAYS,
            dashboard_limit: DEFAULT_DASHBOARD_LIMIT,
        }
    }
}

impl SchedulerConfig {
    /// Reject horizons that cannot yield `max_occurrences` triggers for a
    /// single-weekday reminder whose slot today has already passed.
    ///
    /// Such a reminder matches once every 7 days starting tomorrow at the
    /// earliest, so the scan must cover `7 * max_occurrences + 1` days.
    pub fn validate(&self) -> Result<()> {
        if self.max_occurrences == 0 {
            return Err(CareminderError::Config(
                "scheduler.max_occurrences must be at least 1".to_string(),
            ));
        }
        let required = (self.max_occurrences as u64)
            .checked_mul(7)
            .and_then(|days| days.checked_add(1))
            .ok_or_else(|| {
                CareminderError::Config(format!(
                    "scheduler.max_occurrences = {} is too large",
                    self.max_occurrences
                ))
            })?;
        if u64::from(self.horizon_days) < required {
            return Err(CareminderError::Config(format!(
                "scheduler.horizon_days = {} is too short for {} occurrences \
                 (need at least {required})",
                self.horizon_days, self.max_occurrences
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// How often the local notifier polls for due triggers.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Capacity of the fired-notification channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Days delivered and missed triggers are kept before pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

fn default_max_occurrences() -> usize {
    DEFAULT_MAX_OCCURRENCES
}
fn default_horizon_days() -> u32 {
    DEFAULT_HORIZON_DAYS
}
fn default_dashboard_limit() -> usize {
    DEFAULT_DASHBOARD_LIMIT
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.careminder/careminder.db", home)
}

impl CareminderConfig {
    /// Load config from a TOML file with CAREMINDER_* env var overrides.
    ///
    /// Uses the explicit path when given, else ~/.careminder/careminder.toml.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        if std::path::Path::new(&path).exists() {
            debug!(%path, "loading config file");
        } else {
            info!(%path, "config file not found; using defaults and environment");
        }

        let config: CareminderConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CAREMINDER_").split("__"))
            .extract()
            .map_err(|e| CareminderError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.careminder/careminder.toml", home)
}
