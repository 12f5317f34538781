//! Command-line interface
//!
//! - `run` starts the control loop for this node
//! - `sources` shows which upstream this node would pick right now

use crate::config::CascadeConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::StoreHandle;
use crate::supervisor::LOCAL_HOST;
use crate::topology::{Role, RoleHandle, TopologyView, Tree};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file. Searched for in the usual places when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control loop until interrupted
    Run {
        /// Overrides the role from the config file
        #[arg(long, value_enum)]
        role: Option<Role>,
    },
    /// Print the candidate upstreams and the one source selection accepts
    Sources {
        #[arg(long)]
        prefer_root: bool,
    },
}

/// Output of the `sources` command.
#[derive(Debug, Serialize)]
pub struct SourcesReport {
    pub candidates: Vec<String>,
    pub selected: Option<crate::topology::Source>,
}

pub struct CliHandler {
    config: CascadeConfig,
    /// File the config came from. `None` means built-in defaults.
    source: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }

    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let source = match path {
            Some(path) => Some(path.clone()),
            None => CascadeConfig::find(),
        };
        let config = match &source {
            Some(path) => CascadeConfig::load_from_file(path)?,
            None => CascadeConfig::load()?,
        };
        Ok(Self { config, source })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }

    /// Starts the scheduler and runs it until `shutdown` fires.
    pub async fn run(&self, role: Option<Role>, shutdown: mpsc::Receiver<()>) -> Result<()> {
        self.config.check_binary()?;
        let role = RoleHandle::new(role.unwrap_or(self.config.role));
        let scheduler = Scheduler::from_config(&self.config, role).await?;
        scheduler.run(shutdown).await;
        Ok(())
    }

    pub async fn sources(&self, prefer_root: bool) -> Result<SourcesReport> {
        let role = RoleHandle::new(self.config.role);
        let scheduler = Scheduler::from_config(&self.config, role).await?;
        Ok(sources_report(scheduler.tree(), prefer_root).await)
    }
}

/// Orders the candidates once and probes exactly that list, so the report
/// shows the order the selection walked.
pub async fn sources_report(tree: &Tree, prefer_root: bool) -> SourcesReport {
    let view = local_view(tree).await;
    let candidates = tree
        .selector
        .candidates(view.as_ref(), prefer_root, &mut rand::rng());
    let selected = tree.selector.probe(tree, &candidates).await;
    SourcesReport { candidates, selected }
}

/// The view held by the local instance, if it is up.
async fn local_view(tree: &Tree) -> Option<TopologyView> {
    let local: StoreHandle = tree.cache.get_connection(LOCAL_HOST, tree.port, false).await?;
    match TopologyView::read(local.as_ref()).await {
        Ok(view) => {
            info!(root = ?view.root, branches = view.branches.len(), "Read local view");
            Some(view)
        }
        Err(e) => {
            warn!(error = %e, "Failed to read local view");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestTree;
    use crate::topology::{TreeSettings, BRANCHES_KEY, ROOT_KEY};
    use std::time::Duration;

    #[test]
    fn parses_run_with_role_override() {
        let cli = Cli::parse_from([
            "cascade",
            "--config",
            "/etc/cascade.yml",
            "run",
            "--role",
            "branch",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/cascade.yml")));
        assert!(matches!(cli.command, Commands::Run { role: Some(Role::Branch) }));
    }

    #[test]
    fn parses_sources() {
        let cli = Cli::parse_from(["cascade", "sources", "--prefer-root"]);
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Commands::Sources { prefer_root: true }));
    }

    #[test]
    fn explicit_config_path_is_remembered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"role: branch\n").unwrap();
        let path = file.path().to_path_buf();

        let handler = CliHandler::load(Some(&path)).unwrap();
        assert_eq!(handler.source(), Some(&path));
        assert_eq!(handler.config().role, Role::Branch);
        assert!(CliHandler::new(CascadeConfig::default()).source().is_none());
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(Cli::try_parse_from(["cascade", "run", "--role", "trunk"]).is_err());
    }

    #[tokio::test]
    async fn report_lists_the_order_that_was_tried() {
        let node = TestTree::with(
            "leaf1.example",
            "10.0.0.9",
            vec!["seed1".into(), "seed2".into()],
            TreeSettings::default(),
        );
        node.local_store().set_string(ROOT_KEY, "r1");
        node.local_store().add_member(BRANCHES_KEY, "b1");
        for (i, host) in ["seed1", "seed2", "b1", "r1"].iter().enumerate() {
            node.add_peer(host, &format!("10.0.0.{}", i + 1), Some(Duration::ZERO));
        }

        let report = sources_report(&node.tree, false).await;
        assert_eq!(report.candidates.len(), 4);
        assert_eq!(report.candidates.last().map(String::as_str), Some("r1"));
        let selected = report.selected.expect("a fresh source");
        assert_eq!(selected.host, report.candidates[0]);
        for host in &report.candidates[1..] {
            assert_eq!(node.network.dial_count(host), 0);
        }
    }
}
