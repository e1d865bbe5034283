//! Runtime configuration: TOML file + CLI overrides.

use crate::binder::{BinderConfig, SessionBinder};
use crate::lifecycle::{AccessPolicy, GcPolicy, LifecycleConfig, LifecycleManager, SqliteStore};
use crate::supervisor::{Supervisor, SupervisorConfig, DEFAULT_MAX_OUTPUT_CHUNKS};
use chrono::Duration;
use ptykeep_core::{Clock, KeepError, KeepResult, SystemClock};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.ptykeep/config.toml";

/// Store path that selects a private in-memory database.
pub const IN_MEMORY_STORE: &str = ":memory:";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub gc: GcSection,
    #[serde(default)]
    pub access: AccessSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub spawn: SpawnSection,
    /// Tool name → command line.
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// `[gc]` section. All values in seconds; zero or negative disables a pass.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub interval: i64,
    pub running_idle_timeout: i64,
    pub detached_ttl: i64,
    pub max_lifetime: i64,
    pub terminated_retention: i64,
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            interval: 60,
            running_idle_timeout: 2 * 3600,
            detached_ttl: 24 * 3600,
            max_lifetime: 7 * 24 * 3600,
            terminated_retention: 48 * 3600,
        }
    }
}

/// `[access]` section. TTLs in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessSection {
    pub otp_default_ttl: i64,
    pub otp_min_ttl: i64,
    pub otp_max_ttl: i64,
    pub token_default_ttl: i64,
    pub token_min_ttl: i64,
    pub token_max_ttl: i64,
    pub password_length: usize,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            otp_default_ttl: 180,
            otp_min_ttl: 30,
            otp_max_ttl: 3600,
            token_default_ttl: 300,
            token_min_ttl: 30,
            token_max_ttl: 3600,
            password_length: 16,
        }
    }
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub max_output_chunks: usize,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_output_chunks: DEFAULT_MAX_OUTPUT_CHUNKS,
            cols: 80,
            rows: 24,
        }
    }
}

/// `[spawn]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnSection {
    pub workdir: Option<String>,
}

fn default_store_path() -> String {
    "~/.ptykeep/sessions.db".to_string()
}

impl ConfigFile {
    pub fn parse(content: &str) -> KeepResult<Self> {
        toml::from_str(content).map_err(|e| KeepError::invalid(format!("config parse error: {e}")))
    }
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub store_path: Option<String>,
    pub workdir: Option<String>,
    pub gc_interval: Option<i64>,
}

/// Resolved configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct KeepConfig {
    pub store_path: PathBuf,
    pub lifecycle: LifecycleConfig,
    pub supervisor: SupervisorConfig,
    pub binder: BinderConfig,
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &Overrides::default())
    }
}

impl KeepConfig {
    /// Load `config_path` (or the default location), then apply overrides.
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> KeepResult<Self> {
        let path = match config_path {
            Some(path) => expand_tilde(path),
            None => expand_tilde_str(DEFAULT_CONFIG_PATH),
        };
        let file = if path.exists() {
            info!(path = %path.display(), "loading config file");
            ConfigFile::parse(&std::fs::read_to_string(&path)?)?
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        Ok(Self::resolve(file, overrides))
    }

    pub fn resolve(file: ConfigFile, overrides: &Overrides) -> Self {
        let store_path = overrides
            .store_path
            .clone()
            .unwrap_or(file.store.path);
        let workdir = overrides.workdir.clone().or(file.spawn.workdir);
        let gc = &file.gc;
        let access = &file.access;

        Self {
            store_path: if store_path == IN_MEMORY_STORE {
                PathBuf::from(IN_MEMORY_STORE)
            } else {
                expand_tilde_str(&store_path)
            },
            lifecycle: LifecycleConfig {
                gc: GcPolicy {
                    interval: Duration::seconds(overrides.gc_interval.unwrap_or(gc.interval)),
                    running_idle_timeout: Duration::seconds(gc.running_idle_timeout),
                    detached_ttl: Duration::seconds(gc.detached_ttl),
                    max_lifetime: Duration::seconds(gc.max_lifetime),
                    terminated_retention: Duration::seconds(gc.terminated_retention),
                },
                access: AccessPolicy {
                    otp_default_ttl: Duration::seconds(access.otp_default_ttl),
                    otp_min_ttl: Duration::seconds(access.otp_min_ttl),
                    otp_max_ttl: Duration::seconds(access.otp_max_ttl),
                    token_default_ttl: Duration::seconds(access.token_default_ttl),
                    token_min_ttl: Duration::seconds(access.token_min_ttl),
                    token_max_ttl: Duration::seconds(access.token_max_ttl),
                    password_len: access.password_length,
                },
            },
            supervisor: SupervisorConfig {
                max_output_chunks: file.supervisor.max_output_chunks.max(1),
                cols: file.supervisor.cols.max(1),
                rows: file.supervisor.rows.max(1),
            },
            binder: BinderConfig {
                default_workdir: workdir.as_deref().map(expand_tilde_str),
                tools: file.tools,
            },
        }
    }

    /// Open the store and wire up the manager, supervisor and binder.
    pub fn build(&self) -> KeepResult<SessionBinder> {
        self.build_with_clock(Arc::new(SystemClock))
    }

    pub fn build_with_clock(&self, clock: Arc<dyn Clock>) -> KeepResult<SessionBinder> {
        let store = if self.store_path.as_os_str() == IN_MEMORY_STORE {
            SqliteStore::open_in_memory()?
        } else {
            SqliteStore::open(&self.store_path)?
        };
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(store),
            clock.clone(),
            self.lifecycle.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(self.supervisor.clone(), clock));
        Ok(SessionBinder::new(lifecycle, supervisor, self.binder.clone()))
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
