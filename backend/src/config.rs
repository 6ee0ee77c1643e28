//! Lab configuration from the environment or a TOML file.
//!
//! Raw settings are strings and integers as they appear in `lab.toml` or the
//! process environment; [`LabSettings::validate`] turns them into the typed
//! values the services take. Every invalid value is a configuration error at
//! load time.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::db::factory::RepositoryType;
use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult};
use crate::db::sql::Ident;
use crate::db::PostgresConfig;
use crate::planner::Grain;
use crate::services::monitor::{parse_interval, StrategyKind};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "lab.toml";

/// Typed lab configuration.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub repository: RepositoryType,
    /// Present when the repository is Postgres.
    pub postgres: Option<PostgresConfig>,
    pub schema: Ident,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub grain: Grain,
    pub dummy_indexes: u32,
    pub lock_timeout_ms: u64,
    pub monitor_every: Duration,
    pub kill_blockers: bool,
    pub strategy: StrategyKind,
}

/// Parse a boolean flag the way the lab scripts do: `1`, `true`, `yes`, `y`
/// (any case) are true, everything else is false.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

fn invalid(key: &str, raw: &str, why: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::configuration_with_context(
        format!("invalid value '{}' for {}: {}", raw, key, why),
        ErrorContext::new("load_config").with_entity_id(key),
    )
}

fn parse_date(key: &str, raw: &str) -> RepositoryResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| invalid(key, raw, e))
}

/// Lab settings section (`[lab]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabSettings {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_start_date")]
    pub start_date: String,
    #[serde(default = "default_end_date")]
    pub end_date: String,
    #[serde(default = "default_grain")]
    pub grain: String,
    #[serde(default)]
    pub dummy_indexes: u32,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

/// Monitor settings section (`[monitor]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFileSettings {
    #[serde(default = "default_monitor_every")]
    pub every: String,
    #[serde(default)]
    pub kill_blockers: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

/// Repository type settings (`[repository]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(rename = "type")]
    pub repo_type: String,
}

/// Postgres connection settings (`[postgres]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresSettings {
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Whole `lab.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabConfigFile {
    pub repository: RepositorySettings,
    #[serde(default)]
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub lab: LabSettings,
    #[serde(default)]
    pub monitor: MonitorFileSettings,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_start_date() -> String {
    "2025-01-01".to_string()
}

fn default_end_date() -> String {
    "2025-02-01".to_string()
}

fn default_grain() -> String {
    "day".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_monitor_every() -> String {
    "2s".to_string()
}

fn default_strategy() -> String {
    "terminate-all-blockers".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            grain: default_grain(),
            dummy_indexes: 0,
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for MonitorFileSettings {
    fn default() -> Self {
        Self {
            every: default_monitor_every(),
            kill_blockers: false,
            strategy: default_strategy(),
        }
    }
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LabSettings {
    /// Typed values, or the first invalid setting.
    fn validate(&self) -> RepositoryResult<(Ident, NaiveDate, NaiveDate, Grain)> {
        let schema = Ident::new(self.schema.trim())
            .map_err(|e| invalid("SCHEMA", &self.schema, e))?;
        let start = parse_date("START_DATE", &self.start_date)?;
        let end = parse_date("END_DATE", &self.end_date)?;
        if end <= start {
            return Err(invalid(
                "END_DATE",
                &self.end_date,
                format!("must be after START_DATE {}", start),
            ));
        }
        let grain = Grain::from_str(&self.grain)
            .map_err(|e| invalid("PARTITION_GRAIN", &self.grain, e))?;
        Ok((schema, start, end, grain))
    }
}

impl MonitorFileSettings {
    fn validate(&self) -> RepositoryResult<(Duration, StrategyKind)> {
        let every =
            parse_interval(&self.every).map_err(|e| invalid("MONITOR_EVERY", &self.every, e))?;
        let strategy = StrategyKind::from_str(&self.strategy)
            .map_err(|e| invalid("TERMINATION_STRATEGY", &self.strategy, e))?;
        Ok((every, strategy))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T>(key: &str) -> RepositoryResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e)),
        None => Ok(None),
    }
}

impl LabConfig {
    /// Load from environment variables.
    ///
    /// # Environment Variables
    /// - `SCHEMA` (default `public`)
    /// - `START_DATE`, `END_DATE` (defaults `2025-01-01`, `2025-02-01`)
    /// - `PARTITION_GRAIN`: `day` or `week` (default `day`)
    /// - `DUMMY_INDEXES` (default 0)
    /// - `LOCK_TIMEOUT_MS` (default 5000)
    /// - `MONITOR_EVERY` (default `2s`)
    /// - `KILL_BLOCKERS`: `1/true/yes/y` (default false)
    /// - `TERMINATION_STRATEGY` (default `terminate-all-blockers`)
    /// - `REPOSITORY_TYPE`, `DATABASE_URL`/`PG_DATABASE_URL` and the `PG_*`
    ///   pool variables, see [`PostgresConfig`]
    pub fn from_env() -> RepositoryResult<Self> {
        let defaults = LabSettings::default();
        let lab = LabSettings {
            schema: env_string("SCHEMA").unwrap_or(defaults.schema),
            start_date: env_string("START_DATE").unwrap_or(defaults.start_date),
            end_date: env_string("END_DATE").unwrap_or(defaults.end_date),
            grain: env_string("PARTITION_GRAIN").unwrap_or(defaults.grain),
            dummy_indexes: env_parsed("DUMMY_INDEXES")?.unwrap_or(defaults.dummy_indexes),
            lock_timeout_ms: env_parsed("LOCK_TIMEOUT_MS")?.unwrap_or(defaults.lock_timeout_ms),
        };
        let monitor_defaults = MonitorFileSettings::default();
        let monitor = MonitorFileSettings {
            every: env_string("MONITOR_EVERY").unwrap_or(monitor_defaults.every),
            kill_blockers: env_string("KILL_BLOCKERS")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            strategy: env_string("TERMINATION_STRATEGY").unwrap_or(monitor_defaults.strategy),
        };

        let repository = RepositoryType::from_env();
        let postgres = match repository {
            RepositoryType::Postgres => Some(postgres_from_env()?),
            RepositoryType::Local => None,
        };
        Self::assemble(repository, postgres, &lab, &monitor)
    }

    /// Load from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> RepositoryResult<Self> {
        LabConfigFile::from_file(path)?.into_config()
    }

    /// Load from `path` when given, otherwise from `lab.toml` in the standard
    /// locations, otherwise from the environment.
    pub fn load(path: Option<&Path>) -> RepositoryResult<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }
        match LabConfigFile::find_default() {
            Some(p) => {
                log::info!("loading configuration from {}", p.display());
                Self::from_file(p)
            }
            None => Self::from_env(),
        }
    }

    fn assemble(
        repository: RepositoryType,
        postgres: Option<PostgresConfig>,
        lab: &LabSettings,
        monitor: &MonitorFileSettings,
    ) -> RepositoryResult<Self> {
        let (schema, start_date, end_date, grain) = lab.validate()?;
        let (monitor_every, strategy) = monitor.validate()?;
        let postgres = postgres.map(|pg| with_lock_timeout(pg, lab.lock_timeout_ms));
        Ok(Self {
            repository,
            postgres,
            schema,
            start_date,
            end_date,
            grain,
            dummy_indexes: lab.dummy_indexes,
            lock_timeout_ms: lab.lock_timeout_ms,
            monitor_every,
            kill_blockers: monitor.kill_blockers,
            strategy,
        })
    }
}

#[cfg(feature = "postgres-repo")]
fn postgres_from_env() -> RepositoryResult<PostgresConfig> {
    PostgresConfig::from_env().map_err(RepositoryError::configuration)
}

#[cfg(not(feature = "postgres-repo"))]
fn postgres_from_env() -> RepositoryResult<PostgresConfig> {
    Err(RepositoryError::configuration(
        crate::db::factory::POSTGRES_FEATURE_MISSING,
    ))
}

#[cfg(feature = "postgres-repo")]
fn with_lock_timeout(mut pg: PostgresConfig, lock_timeout_ms: u64) -> PostgresConfig {
    pg.lock_timeout_ms = lock_timeout_ms;
    pg
}

#[cfg(not(feature = "postgres-repo"))]
fn with_lock_timeout(pg: PostgresConfig, _lock_timeout_ms: u64) -> PostgresConfig {
    pg
}

impl LabConfigFile {
    /// Read and parse a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> RepositoryResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RepositoryError::configuration(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content).map_err(|e| {
            RepositoryError::configuration(format!("Failed to parse config file: {}", e))
        })
    }

    /// First `lab.toml` found in the current directory, `backend/` or the
    /// parent directory.
    pub fn find_default() -> Option<PathBuf> {
        [
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from("backend").join(CONFIG_FILE_NAME),
            PathBuf::from("..").join(CONFIG_FILE_NAME),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    pub fn repository_type(&self) -> RepositoryResult<RepositoryType> {
        RepositoryType::from_str(&self.repository.repo_type).map_err(RepositoryError::configuration)
    }

    /// Validate into a [`LabConfig`].
    pub fn into_config(self) -> RepositoryResult<LabConfig> {
        let repository = self.repository_type()?;
        let postgres = match repository {
            RepositoryType::Postgres => Some(self.to_postgres_config()?),
            RepositoryType::Local => None,
        };
        LabConfig::assemble(repository, postgres, &self.lab, &self.monitor)
    }

    #[cfg(feature = "postgres-repo")]
    fn to_postgres_config(&self) -> RepositoryResult<PostgresConfig> {
        if self.postgres.database_url.is_empty() {
            return Err(RepositoryError::configuration(
                "Postgres repository requires 'postgres.database_url' setting",
            ));
        }
        Ok(PostgresConfig {
            database_url: self.postgres.database_url.clone(),
            max_pool_size: self.postgres.max_connections,
            min_pool_size: self.postgres.min_connections,
            connection_timeout_sec: self.postgres.connect_timeout,
            idle_timeout_sec: self.postgres.idle_timeout,
            max_retries: self.postgres.max_retries,
            retry_delay_ms: self.postgres.retry_delay_ms,
            lock_timeout_ms: self.lab.lock_timeout_ms,
        })
    }

    #[cfg(not(feature = "postgres-repo"))]
    fn to_postgres_config(&self) -> RepositoryResult<PostgresConfig> {
        Err(RepositoryError::configuration(
            crate::db::factory::POSTGRES_FEATURE_MISSING,
        ))
    }
}
