use crate::error::{CascadeError, Result};
use crate::resolver::Resolver;
use crate::supervisor::{RedisProfiles, SupervisorSettings};
use crate::topology::filter::FilterConfig;
use crate::topology::{NodeIdentity, Role, TreeSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Name this node advertises. Defaults to the system hostname.
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_rebalance_probability")]
    pub rebalance_probability: f64,
    #[serde(default = "default_resync_grace")]
    pub resync_grace_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Newline separated host list, read at start-up.
    #[serde(default)]
    pub bootstrap_file: Option<PathBuf>,
    #[serde(default)]
    pub source_filter: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_kill_after_attempts")]
    pub kill_after_attempts: u32,
    #[serde(default = "default_launch_backoff")]
    pub launch_backoff_secs: u64,
    /// Where generated store configs go. The system temp dir when unset.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Directive profiles: `common` plus one per role.
    #[serde(default)]
    pub configs: RedisProfiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the rolling JSON log. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub json: bool,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            fqdn: None,
            port: default_port(),
            tick_interval_ms: default_tick_interval(),
            staleness_threshold_secs: default_staleness_threshold(),
            rebalance_probability: default_rebalance_probability(),
            resync_grace_secs: default_resync_grace(),
            connect_timeout_ms: default_connect_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            supervisor: SupervisorConfig::default(),
            redis: RedisConfig::default(),
            bootstrap_nodes: Vec::new(),
            bootstrap_file: None,
            source_filter: FilterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            kill_after_attempts: default_kill_after_attempts(),
            launch_backoff_secs: default_launch_backoff(),
            config_dir: None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            configs: RedisProfiles::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            json: default_true(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_role() -> Role {
    Role::Leaf
}

fn default_port() -> u16 {
    2578
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_staleness_threshold() -> u64 {
    20
}

fn default_rebalance_probability() -> f64 {
    1.0 / 600.0
}

fn default_resync_grace() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    12
}

fn default_kill_after_attempts() -> u32 {
    3
}

fn default_launch_backoff() -> u64 {
    5
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/redis-server")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_log_files() -> usize {
    7
}

impl CascadeConfig {
    /// The first config file present in the usual places.
    pub fn find() -> Option<PathBuf> {
        let config_paths = [
            Some(PathBuf::from("cascade.yml")),
            dirs::config_dir().map(|p| p.join("cascade/config.yml")),
            Some(PathBuf::from("/etc/cascade/config.yml")),
        ];
        config_paths.into_iter().flatten().find(|path| path.is_file())
    }

    /// Loads the file [`find`](Self::find) returns, or the defaults when
    /// there is none.
    pub fn load() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load_from_file(&path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CascadeError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(CascadeError::config("port must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.rebalance_probability) {
            return Err(CascadeError::config(format!(
                "rebalance_probability must be within [0, 1], got {}",
                self.rebalance_probability
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(CascadeError::config("tick_interval_ms must be non-zero"));
        }
        if self.supervisor.max_attempts == 0 {
            return Err(CascadeError::config("supervisor.max_attempts must be non-zero"));
        }
        if let Some(fqdn) = &self.fqdn {
            if fqdn.trim().is_empty() {
                return Err(CascadeError::config("fqdn must not be blank"));
            }
        }
        Ok(())
    }

    /// Checks that the store binary can be launched.
    pub fn check_binary(&self) -> Result<()> {
        if self.redis.binary.is_file() {
            Ok(())
        } else {
            Err(CascadeError::config(format!(
                "store binary {} does not exist",
                self.redis.binary.display()
            )))
        }
    }

    /// Inline bootstrap nodes followed by those in `bootstrap_file`.
    pub fn bootstrap_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = self.bootstrap_nodes.clone();
        if let Some(path) = &self.bootstrap_file {
            let content = fs::read_to_string(path).map_err(|e| {
                let path = path.display();
                CascadeError::config(format!("Failed to read bootstrap file {}: {}", path, e))
            })?;
            hosts.extend(content.lines().map(str::to_string));
        }
        hosts.retain(|h| !h.trim().is_empty());
        Ok(hosts)
    }

    pub fn fqdn(&self) -> Result<String> {
        if let Some(fqdn) = &self.fqdn {
            return Ok(fqdn.trim().to_string());
        }
        let name = nix::unistd::gethostname()?;
        name.into_string()
            .map_err(|_| CascadeError::config("system hostname is not valid UTF-8"))
    }

    pub async fn identity(&self, resolver: &dyn Resolver) -> Result<NodeIdentity> {
        let fqdn = self.fqdn()?;
        let ip = resolver.resolve(&fqdn).await?;
        Ok(NodeIdentity { fqdn, ip })
    }

    pub fn tree_settings(&self) -> TreeSettings {
        TreeSettings {
            staleness_threshold: Duration::from_secs(self.staleness_threshold_secs),
            rebalance_probability: self.rebalance_probability,
            resync_grace: Duration::from_secs(self.resync_grace_secs),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            max_attempts: self.supervisor.max_attempts,
            kill_after_attempts: self.supervisor.kill_after_attempts,
            launch_backoff: Duration::from_secs(self.supervisor.launch_backoff_secs),
            binary: self.redis.binary.clone(),
            profiles: self.redis.configs.clone(),
            config_dir: self.supervisor.config_dir.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
