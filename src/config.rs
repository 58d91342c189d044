use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::store::{BackendKind, RetentionPolicy, StorageBackend, StoreError};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub interval_secs: f64,
    pub default_sort: String,
    pub logging_enabled: bool,
    pub terminate_timeout_secs: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            interval_secs: 1.0,
            default_sort: "memory_percent".to_string(),
            logging_enabled: false,
            terminate_timeout_secs: 3.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub db_path: PathBuf,
    pub dir: PathBuf,
    pub retention_days: u32,
    pub max_rows: usize,
    pub retention_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: "structured".to_string(),
            db_path: PathBuf::from("process_logs.db"),
            dir: PathBuf::from("logs"),
            retention_days: 7,
            max_rows: 10_000,
            retention_interval_secs: 24 * 60 * 60,
        }
    }
}

impl GeneralConfig {
    pub fn interval(&self) -> Duration {
        secs_or(self.interval_secs, 1.0)
    }

    pub fn terminate_timeout(&self) -> Duration {
        secs_or(self.terminate_timeout_secs, 3.0)
    }
}

impl StorageConfig {
    /// Resolve the configured backend name; done once, at startup.
    pub fn backend(&self) -> Result<StorageBackend, StoreError> {
        Ok(match self.backend.parse::<BackendKind>()? {
            BackendKind::Structured => StorageBackend::Structured {
                db_path: self.db_path.clone(),
            },
            BackendKind::FlatFile => StorageBackend::FlatFile {
                dir: self.dir.clone(),
            },
        })
    }

    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.retention_days,
            max_rows: self.max_rows,
        }
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs.max(1))
    }
}

fn secs_or(secs: f64, fallback: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        warn!(secs, fallback, "non-positive duration in config, using default");
        Duration::from_secs_f64(fallback)
    }
}

impl Config {
    /// Apply the environment variables the monitor has always honoured.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "MONITOR_INTERVAL_SECONDS") {
            self.general.interval_secs = v;
        }
        if let Some(v) = lookup("DEFAULT_SORT") {
            self.general.default_sort = v;
        }
        if let Some(v) = lookup("ENABLE_LOGGING") {
            self.general.logging_enabled = v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("STORAGE_TYPE") {
            self.storage.backend = v;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CSV_DIR") {
            self.storage.dir = PathBuf::from(v);
        }
        if let Some(v) = parse_env(&lookup, "RETENTION_DAYS") {
            self.storage.retention_days = v;
        }
        if let Some(v) = parse_env(&lookup, "MAX_LOG_ROWS") {
            self.storage.max_rows = v;
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("memwatch").join("config.toml"))
}

pub fn load_config() -> Config {
    match config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Config::default(),
    }
}

pub fn load_config_from_path(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
            warn!(path = %path.display(), %err, "invalid config file, using defaults");
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}
