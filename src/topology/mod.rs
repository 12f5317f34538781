//! Topology Maintenance
//!
//! The tree has no in-memory graph. Every tick each node reads the topology
//! metadata stored in the tree itself, decides, and writes back:
//! - the root publishes its identity and the liveness clock
//! - branches register with the root
//! - leaves manage their own draining membership and rebalance now and then
//!
//! [`Tree`] is the per-process context the routines share.

pub mod branch;
pub mod filter;
pub mod leaf;
pub mod root;
pub mod source;

pub use filter::{NoopFilter, SourceFilter};
pub use source::{Source, SourceSelector};

use crate::cache::ConnectionCache;
use crate::clock::Clock;
use crate::error::Result;
use crate::resolver::Resolver;
use crate::store::{StoreClient, StoreHandle};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Key holding the current root's FQDN.
pub const ROOT_KEY: &str = "cascade:root";
/// Set of hosts acting as branches.
pub const BRANCHES_KEY: &str = "cascade:branches";
/// Set of hosts leaving branch duty that still have children.
pub const DRAINING_KEY: &str = "cascade:draining-branches";
/// Liveness timestamp, seconds since the epoch, written by the root.
pub const TIME_KEY: &str = "time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Branch,
    Leaf,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Branch => "branch",
            Role::Leaf => "leaf",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role this process currently plays. It can be swapped between ticks.
#[derive(Debug, Clone)]
pub struct RoleHandle(Arc<RwLock<Role>>);

impl RoleHandle {
    pub fn new(role: Role) -> Self {
        Self(Arc::new(RwLock::new(role)))
    }

    pub fn get(&self) -> Role {
        *self.0.read()
    }

    pub fn set(&self, role: Role) {
        *self.0.write() = role;
    }
}

/// How this node names itself to its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub fqdn: String,
    pub ip: IpAddr,
}

/// The two membership sets the root keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Membership {
    Branches,
    Draining,
}

impl Membership {
    pub fn key(&self) -> &'static str {
        match self {
            Membership::Branches => BRANCHES_KEY,
            Membership::Draining => DRAINING_KEY,
        }
    }

    pub fn other(&self) -> Membership {
        match self {
            Membership::Branches => Membership::Draining,
            Membership::Draining => Membership::Branches,
        }
    }
}

/// Adds `host` to `set` on the root. The host leaves the other set first, so
/// it is never a member of both.
pub async fn enroll(root: &dyn StoreClient, set: Membership, host: &str) -> Result<()> {
    root.srem(set.other().key(), host).await?;
    root.sadd(set.key(), host).await?;
    Ok(())
}

/// A node's possibly stale picture of the tree, read from its own instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyView {
    pub root: Option<String>,
    pub branches: BTreeSet<String>,
}

impl TopologyView {
    pub async fn read(local: &dyn StoreClient) -> Result<Self> {
        let root = local.get(ROOT_KEY).await?.filter(|r| !r.is_empty());
        let branches = local.smembers(BRANCHES_KEY).await?;
        Ok(Self { root, branches })
    }
}

/// Tunables shared by the routines.
#[derive(Debug, Clone)]
pub struct TreeSettings {
    /// Sources whose liveness timestamp is older than this are rejected.
    pub staleness_threshold: Duration,
    /// Per-tick chance that a leaf looks for a new upstream.
    pub rebalance_probability: f64,
    /// Pause after a reparent so the resync can start.
    pub resync_grace: Duration,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(20),
            rebalance_probability: 1.0 / 600.0,
            resync_grace: Duration::from_secs(3),
        }
    }
}

/// Everything a health-check routine needs, owned by the scheduler.
pub struct Tree {
    pub identity: NodeIdentity,
    pub port: u16,
    pub settings: TreeSettings,
    pub cache: ConnectionCache,
    pub resolver: Arc<dyn Resolver>,
    pub clock: Arc<dyn Clock>,
    pub selector: SourceSelector,
    child_counts: Mutex<BTreeMap<String, u32>>,
}

impl Tree {
    pub fn new(
        identity: NodeIdentity,
        port: u16,
        settings: TreeSettings,
        cache: ConnectionCache,
        resolver: Arc<dyn Resolver>,
        clock: Arc<dyn Clock>,
        selector: SourceSelector,
    ) -> Self {
        Self {
            identity,
            port,
            settings,
            cache,
            resolver,
            clock,
            selector,
            child_counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_self(&self, host: &str) -> bool {
        host == self.identity.fqdn
    }

    /// See [`SourceSelector::select`].
    pub async fn select_source(
        &self,
        view: Option<&TopologyView>,
        prefer_root: bool,
    ) -> Option<Source> {
        self.selector.select(self, view, prefer_root).await
    }

    /// Child counts last observed by the root for each branch.
    pub fn child_counts(&self) -> BTreeMap<String, u32> {
        self.child_counts.lock().clone()
    }

    pub(crate) fn record_child_count(&self, host: &str, count: u32) {
        self.child_counts.lock().insert(host.to_string(), count);
    }

    pub(crate) fn forget_child_count(&self, host: &str) {
        self.child_counts.lock().remove(host);
    }

    /// Connects to the root named by the local root pointer.
    ///
    /// When the pointer names this node, the local connection is the root.
    pub async fn find_root(&self, local: &StoreHandle) -> Option<RootLink> {
        let host = match local.get(ROOT_KEY).await {
            Ok(Some(host)) if !host.is_empty() => host,
            Ok(_) => {
                error!("No root recorded in local store");
                return None;
            }
            Err(e) => {
                error!(error = %e, "Failed to read root pointer");
                return None;
            }
        };
        let ip = match self.resolver.resolve(&host).await {
            Ok(ip) => ip,
            Err(_) => {
                error!(root = %host, "Failed to resolve root node");
                return None;
            }
        };
        if self.is_self(&host) {
            return Some(RootLink { host, ip, conn: local.clone() });
        }
        match self.cache.get_connection(&ip.to_string(), self.port, false).await {
            Some(conn) => Some(RootLink { host, ip, conn }),
            None => {
                warn!(root = %host, %ip, "Failed to connect to root instance");
                None
            }
        }
    }
}

/// A live connection to the tree's root.
#[derive(Clone)]
pub struct RootLink {
    pub host: String,
    pub ip: IpAddr,
    pub conn: StoreHandle,
}
