//! Local process table access.

use crate::error::{CascadeError, Result};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use tracing::{debug, warn};

/// What the supervisor needs from the operating system.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// PIDs whose command line contains `signature`.
    async fn find(&self, signature: &str) -> Result<Vec<u32>>;

    /// Sends SIGKILL.
    async fn kill(&self, pid: u32) -> Result<()>;

    /// Starts `binary config`. The store daemonizes itself, so this returns
    /// once the foreground process exits.
    async fn launch(&self, binary: &Path, config: &Path) -> Result<()>;
}

/// Process control backed by sysinfo, nix and tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessControl;

#[async_trait]
impl ProcessControl for SystemProcessControl {
    async fn find(&self, signature: &str) -> Result<Vec<u32>> {
        let signature = signature.to_string();
        tokio::task::spawn_blocking(move || {
            let sys_info = sysinfo::System::new_all();
            sys_info
                .processes()
                .values()
                .filter(|process| {
                    let cmdline = process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ");
                    cmdline.contains(&signature)
                })
                .map(|process| process.pid().as_u32())
                .collect()
        })
        .await
        .map_err(|e| CascadeError::process(format!("process scan failed: {}", e)))
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| CascadeError::process(format!("invalid pid {}", pid)))?;
        warn!(pid, "Sending SIGKILL");
        signal::kill(Pid::from_raw(raw), Signal::SIGKILL)?;
        Ok(())
    }

    async fn launch(&self, binary: &Path, config: &Path) -> Result<()> {
        debug!(binary = %binary.display(), config = %config.display(), "Launching store");
        let status = tokio::process::Command::new(binary).arg(config).status().await?;
        if !status.success() {
            return Err(CascadeError::process(format!(
                "{} exited with {}",
                binary.display(),
                status
            )));
        }
        Ok(())
    }
}

/// The command-line signature of a store listening on `port`.
pub fn signature(port: u16) -> String {
    format!("redis-server *:{}", port)
}
