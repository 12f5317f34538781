//! Instance Supervisor
//!
//! Keeps the local store process alive and attached to the right upstream:
//! - dials the local instance, retrying with a growing pause
//! - launches a fresh instance when none is running
//! - force-kills an instance that stays unresponsive
//!
//! It is also the only place that rewrites the local upstream link, see
//! [`reparent`].

pub mod config_file;
pub mod process;

pub use config_file::{RedisProfiles, RedisValue};
pub use process::{ProcessControl, SystemProcessControl};

use crate::error::Result;
use crate::store::StoreHandle;
use crate::topology::{Role, Tree};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{error, info, warn};

/// Host name the supervisor dials for the local instance.
pub const LOCAL_HOST: &str = "localhost";

/// Longest pause between two attempts.
const MAX_BACKOFF_SECS: u32 = 10;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_attempts: u32,
    /// Attempt number from which a running but unreachable instance is killed.
    pub kill_after_attempts: u32,
    /// Pause after a launch, or after a launch that could not happen.
    pub launch_backoff: Duration,
    pub binary: PathBuf,
    pub profiles: RedisProfiles,
    /// Directory for generated configs. The system temp dir when `None`.
    pub config_dir: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            kill_after_attempts: 3,
            launch_backoff: Duration::from_secs(5),
            binary: PathBuf::from("/usr/local/bin/redis-server"),
            profiles: RedisProfiles::new(),
            config_dir: None,
        }
    }
}

/// Result of a single supervision attempt.
pub enum Attempt {
    Ready(StoreHandle),
    /// Try again with the next attempt number.
    Retry,
    /// Nothing more can be done this tick.
    GiveUp,
}

pub struct InstanceSupervisor {
    tree: Arc<Tree>,
    process: Arc<dyn ProcessControl>,
    settings: SupervisorSettings,
    /// Every config handed to a launch, oldest first. An instance may still
    /// be reading one, so they live as long as the supervisor.
    configs: Mutex<Vec<TempPath>>,
}

impl InstanceSupervisor {
    pub fn new(
        tree: Arc<Tree>,
        process: Arc<dyn ProcessControl>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            tree,
            process,
            settings,
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Returns a live connection to the local instance, or `None` when the
    /// instance could not be brought up this tick.
    pub async fn ensure_local_instance_healthy(&self, role: Role) -> Option<StoreHandle> {
        for tryct in 0..self.settings.max_attempts {
            if tryct > 0 {
                let pause = tryct.min(MAX_BACKOFF_SECS);
                warn!(attempt = tryct, pause_secs = pause, "Local instance not healthy, retrying");
                self.tree.clock.sleep(Duration::from_secs(u64::from(pause))).await;
            }
            match self.attempt(tryct, role).await {
                Attempt::Ready(conn) => return Some(conn),
                Attempt::Retry => continue,
                Attempt::GiveUp => return None,
            }
        }
        let attempts = self.settings.max_attempts;
        error!(attempts, "Giving up on local instance for this tick");
        None
    }

    /// One pass of the recovery ladder.
    pub async fn attempt(&self, tryct: u32, role: Role) -> Attempt {
        let port = self.tree.port;
        if let Some(conn) = self.tree.cache.get_connection(LOCAL_HOST, port, false).await {
            return Attempt::Ready(conn);
        }

        let signature = process::signature(port);
        let pids = match self.process.find(&signature).await {
            Ok(pids) => pids,
            Err(e) => {
                error!(error = %e, "Failed to scan process table");
                return Attempt::Retry;
            }
        };

        if pids.is_empty() {
            return self.launch(role).await;
        }

        if tryct >= self.settings.kill_after_attempts {
            for pid in pids {
                warn!(pid, "Local instance running but unreachable, killing");
                if let Err(e) = self.process.kill(pid).await {
                    error!(pid, error = %e, "Failed to kill local instance");
                }
            }
        }
        Attempt::Retry
    }

    async fn launch(&self, role: Role) -> Attempt {
        let master = if role == Role::Root {
            None
        } else {
            match self.tree.select_source(None, role == Role::Branch).await {
                Some(source) => Some(source.ip),
                None => {
                    error!(%role, "No source to launch from");
                    self.tree.clock.sleep(self.settings.launch_backoff).await;
                    return Attempt::GiveUp;
                }
            }
        };

        let profiles = &self.settings.profiles;
        let directives = config_file::render(role, profiles, self.tree.port, master);
        let dir = self.settings.config_dir.as_deref();
        let path = match config_file::write(role, &directives, dir) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "Failed to write store config");
                self.tree.clock.sleep(self.settings.launch_backoff).await;
                return Attempt::GiveUp;
            }
        };

        info!(%role, upstream = ?master, config = %path.display(), "Starting local instance");
        if let Err(e) = self.process.launch(&self.settings.binary, &path).await {
            error!(error = %e, "Failed to start local instance");
        }
        self.configs.lock().push(path);
        self.tree.clock.sleep(self.settings.launch_backoff).await;
        Attempt::Retry
    }

    /// Path of the config written for the latest launch.
    pub fn current_config(&self) -> Option<PathBuf> {
        self.configs.lock().last().map(|p| p.to_path_buf())
    }

    /// Paths of all configs written so far, oldest first.
    pub fn configs(&self) -> Vec<PathBuf> {
        self.configs.lock().iter().map(|p| p.to_path_buf()).collect()
    }
}

/// Points the local instance at `host` and waits out the resync grace.
pub async fn reparent(tree: &Tree, local: &StoreHandle, host: &str, ip: IpAddr) -> Result<()> {
    info!(upstream = %host, %ip, "Reparenting");
    local.replicate_from(&ip.to_string(), tree.port).await?;
    tree.clock.sleep(tree.settings.resync_grace).await;
    Ok(())
}
