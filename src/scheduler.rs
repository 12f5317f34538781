//! The per-node control loop.

use crate::cache::ConnectionCache;
use crate::clock::{Clock, SystemClock};
use crate::config::CascadeConfig;
use crate::error::Result;
use crate::resolver::{DnsResolver, Resolver};
use crate::store::TcpConnector;
use crate::supervisor::{InstanceSupervisor, ProcessControl, SystemProcessControl};
use crate::topology::{branch, leaf, root, Role, RoleHandle, SourceSelector, Tree};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The role routine ran to completion.
    Checked(Role),
    /// The local instance could not be brought up; nothing else ran.
    NoInstance,
}

pub struct Scheduler {
    tree: Arc<Tree>,
    supervisor: InstanceSupervisor,
    role: RoleHandle,
    interval: Duration,
    rng: SmallRng,
}

impl Scheduler {
    pub fn new(
        tree: Arc<Tree>,
        supervisor: InstanceSupervisor,
        role: RoleHandle,
        interval: Duration,
    ) -> Self {
        Self {
            tree,
            supervisor,
            role,
            interval,
            rng: SmallRng::from_rng(&mut rand::rng()),
        }
    }

    /// Replaces the rebalance draw source, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Wires the production collaborators described by `config`.
    pub async fn from_config(config: &CascadeConfig, role: RoleHandle) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let resolver: Arc<dyn Resolver> = Arc::new(DnsResolver);
        let identity = config.identity(resolver.as_ref()).await?;
        info!(fqdn = %identity.fqdn, ip = %identity.ip, role = %role.get(), "Node identity");

        let connector = Arc::new(TcpConnector::new(config.connect_timeout()));
        let cache = ConnectionCache::new(connector, clock.clone(), config.cache_ttl());
        let filter = config.source_filter.build(&identity.fqdn);
        let selector = SourceSelector::new(config.bootstrap_hosts()?, filter);
        let tree = Arc::new(Tree::new(
            identity,
            config.port,
            config.tree_settings(),
            cache,
            resolver,
            clock,
            selector,
        ));

        let process: Arc<dyn ProcessControl> = Arc::new(SystemProcessControl);
        let settings = config.supervisor_settings();
        let supervisor = InstanceSupervisor::new(tree.clone(), process, settings);
        Ok(Self::new(tree, supervisor, role, config.tick_interval()))
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn role(&self) -> &RoleHandle {
        &self.role
    }

    /// Runs one tick: supervise the local instance, read its replication
    /// state, then run the routine for the current role.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let role = self.role.get();
        let Some(local) = self.supervisor.ensure_local_instance_healthy(role).await else {
            warn!(%role, "No healthy local instance this tick");
            return Ok(TickOutcome::NoInstance);
        };
        let info = local.replication_info().await?;
        debug!(%role, children = info.connected_children, upstream = ?info.master_host, "Tick");

        match role {
            Role::Root => root::health_check(&self.tree, &local, &info).await?,
            Role::Branch => branch::health_check(&self.tree, &local, &info).await?,
            Role::Leaf => leaf::health_check(&self.tree, &local, &info, &mut self.rng).await?,
        }
        Ok(TickOutcome::Checked(role))
    }

    /// Ticks every interval until `shutdown` fires or its sender is dropped.
    /// A failed tick is logged and the loop carries on.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) {
        let sweeper = self.tree.cache.start_sweeper();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(role = %self.role.get(), interval = ?self.interval, "Starting control loop");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(role = %self.role.get(), error = %e, "Health check failed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Received shutdown signal");
                    break;
                }
            }
        }
        sweeper.abort();
        info!("Control loop stopped");
    }
}
