use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SHORT_TERM_K: usize = 10;
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error at {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_remote_timeout_secs() -> u64 {
    DEFAULT_REMOTE_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub data_dir: PathBuf,
    pub short_term_k: usize,
    pub episodic_cache_ttl_secs: u64,
    pub knowledge_cache_ttl_secs: u64,
    pub backup_interval_secs: u64,
    pub backup_retry_secs: u64,
    pub eviction_interval_secs: u64,
    pub session_timeout_secs: u64,
    pub archive_after_days: i64,
    pub archive_interval_secs: u64,
    pub remote: Option<RemoteConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: state_dir().join("tony"),
            short_term_k: DEFAULT_SHORT_TERM_K,
            episodic_cache_ttl_secs: 5 * 60,
            knowledge_cache_ttl_secs: 10 * 60,
            backup_interval_secs: 30 * 60,
            backup_retry_secs: 5 * 60,
            eviction_interval_secs: 15 * 60,
            session_timeout_secs: 60 * 60,
            archive_after_days: 30,
            archive_interval_secs: 24 * 60 * 60,
            remote: None,
        }
    }
}

impl MemoryConfig {
    /// Reads the TOML file at `path` when it exists, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&config_path())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup_any = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(dir) = lookup_any(&["TONY_DATA_DIR"]) {
            self.data_dir = PathBuf::from(dir);
        }

        let url = lookup_any(&["TONY_REMOTE_URL", "SUPABASE_URL"]);
        let key = lookup_any(&["TONY_REMOTE_KEY", "SUPABASE_KEY"]);
        if let (Some(base_url), Some(api_key)) = (url.clone(), key.clone()) {
            let timeout_secs = self
                .remote
                .as_ref()
                .map(|remote| remote.timeout_secs)
                .unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS);
            self.remote = Some(RemoteConfig {
                base_url,
                api_key,
                timeout_secs,
            });
        } else if let Some(remote) = self.remote.as_mut() {
            if let Some(base_url) = url {
                remote.base_url = base_url;
            }
            if let Some(api_key) = key {
                remote.api_key = api_key;
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            if let Some(timeout) =
                lookup_any(&["TONY_REMOTE_TIMEOUT_SECS"]).and_then(|value| value.parse().ok())
            {
                remote.timeout_secs = timeout;
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    pub fn episodic_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.episodic_cache_ttl_secs)
    }

    pub fn knowledge_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.knowledge_cache_ttl_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs.max(1))
    }

    pub fn backup_retry(&self) -> Duration {
        Duration::from_secs(self.backup_retry_secs.max(1))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs.max(1))
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("TONY_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("tony/memory.toml")
}

fn state_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_STATE_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".local/state")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
