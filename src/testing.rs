//! In-memory stand-ins for the store, the network, the clock and the process
//! table. Used by the unit tests and the integration tests under `tests/`.

use crate::cache::ConnectionCache;
use crate::clock::Clock;
use crate::error::{CascadeError, Result};
use crate::resolver::Resolver;
use crate::store::{Connector, ReplicationInfo, ReplicationRole, StoreClient, StoreHandle};
use crate::supervisor::ProcessControl;
use crate::topology::{NodeIdentity, NoopFilter, SourceSelector, Tree, TreeSettings};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_PORT: u16 = 2578;

/// Epoch seconds the [`TestTree`] clock starts at.
pub const TEST_EPOCH: f64 = 1_700_000_000.0;

#[derive(Default)]
struct StoreState {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    info: ReplicationInfo,
    replicate_calls: Vec<(String, u16)>,
}

/// A store instance held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.state.lock().strings.insert(key.to_string(), value.to_string());
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.state.lock().strings.get(key).cloned()
    }

    pub fn add_member(&self, key: &str, member: &str) {
        self.state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    pub fn members(&self, key: &str) -> BTreeSet<String> {
        self.state.lock().sets.get(key).cloned().unwrap_or_default()
    }

    pub fn set_info(&self, info: ReplicationInfo) {
        self.state.lock().info = info;
    }

    pub fn info(&self) -> ReplicationInfo {
        self.state.lock().info.clone()
    }

    /// Every `replicate_from` call, in order.
    pub fn replicate_calls(&self) -> Vec<(String, u16)> {
        self.state.lock().replicate_calls.clone()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_string(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_string(key, value);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = state.sets.get_mut(key).map(|s| s.remove(member)).unwrap_or(false);
        if state.sets.get(key).map(BTreeSet::is_empty).unwrap_or(false) {
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self.members(key))
    }

    async fn replicate_from(&self, host: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock();
        state.replicate_calls.push((host.to_string(), port));
        state.info.role = ReplicationRole::Replica;
        state.info.master_host = Some(host.to_string());
        state.info.master_port = Some(port);
        state.info.master_link_up = false;
        Ok(())
    }

    async fn replication_info(&self) -> Result<ReplicationInfo> {
        Ok(self.info())
    }
}

struct HostEntry {
    ip: IpAddr,
    store: Arc<MemoryStore>,
    reachable: bool,
    dials: usize,
}

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<String, HostEntry>,
    aliases: HashMap<String, String>,
}

impl NetworkState {
    /// Maps a name, alias or address literal to the host's canonical name.
    fn canonical(&self, host: &str) -> Option<String> {
        if self.hosts.contains_key(host) {
            return Some(host.to_string());
        }
        if let Some(target) = self.aliases.get(host) {
            return Some(target.clone());
        }
        let ip: IpAddr = host.parse().ok()?;
        self.hosts
            .iter()
            .find(|(_, entry)| entry.ip == ip)
            .map(|(name, _)| name.clone())
    }
}

/// A set of named [`MemoryStore`]s that can be dialed and resolved.
///
/// Every dial is counted against the host it lands on, whichever name or
/// address was used to reach it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, name: &str, ip: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let entry = HostEntry {
            ip: ip.parse().unwrap_or(IpAddr::from([0, 0, 0, 0])),
            store: store.clone(),
            reachable: true,
            dials: 0,
        };
        self.state.lock().hosts.insert(name.to_string(), entry);
        store
    }

    /// Makes `alias` dial and resolve to `target`.
    pub fn add_alias(&self, alias: &str, target: &str) {
        self.state
            .lock()
            .aliases
            .insert(alias.to_string(), target.to_string());
    }

    pub fn store(&self, name: &str) -> Option<Arc<MemoryStore>> {
        let state = self.state.lock();
        let name = state.canonical(name)?;
        state.hosts.get(&name).map(|h| h.store.clone())
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock();
        if let Some(name) = state.canonical(name) {
            if let Some(entry) = state.hosts.get_mut(&name) {
                entry.reachable = reachable;
            }
        }
    }

    pub fn is_reachable(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .canonical(name)
            .and_then(|name| state.hosts.get(&name).map(|h| h.reachable))
            .unwrap_or(false)
    }

    pub fn dial_count(&self, name: &str) -> usize {
        let state = self.state.lock();
        state
            .canonical(name)
            .and_then(|name| state.hosts.get(&name).map(|h| h.dials))
            .unwrap_or(0)
    }

    pub fn total_dials(&self) -> usize {
        self.state.lock().hosts.values().map(|h| h.dials).sum()
    }

    /// A connection to `name` that does not count as a dial.
    pub fn handle(&self, name: &str) -> Option<StoreHandle> {
        let state = self.state.lock();
        let canonical = state.canonical(name)?;
        let store = state.hosts.get(&canonical)?.store.clone();
        Some(Arc::new(MemoryConnection {
            network: self.clone(),
            host: canonical,
            store,
        }))
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, host: &str, _port: u16) -> Result<StoreHandle> {
        let (canonical, store) = {
            let mut state = self.state.lock();
            let canonical = state
                .canonical(host)
                .ok_or_else(|| CascadeError::connection(format!("no route to {}", host)))?;
            let entry = state
                .hosts
                .get_mut(&canonical)
                .ok_or_else(|| CascadeError::connection(format!("no route to {}", host)))?;
            entry.dials += 1;
            if !entry.reachable {
                return Err(CascadeError::connection(format!("{} refused connection", host)));
            }
            (canonical, entry.store.clone())
        };
        Ok(Arc::new(MemoryConnection {
            network: self.clone(),
            host: canonical,
            store,
        }))
    }
}

#[async_trait]
impl Resolver for MemoryNetwork {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let state = self.state.lock();
        state
            .canonical(host)
            .and_then(|name| state.hosts.get(&name).map(|h| h.ip))
            .ok_or_else(|| CascadeError::Resolve(host.to_string()))
    }
}

/// A connection that fails every command while its host is unreachable.
struct MemoryConnection {
    network: MemoryNetwork,
    host: String,
    store: Arc<MemoryStore>,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        if self.network.is_reachable(&self.host) {
            Ok(())
        } else {
            Err(CascadeError::connection(format!("{} went away", self.host)))
        }
    }
}

#[async_trait]
impl StoreClient for MemoryConnection {
    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.store.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.store.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.store.set(key, value).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        self.store.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        self.store.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        self.check()?;
        self.store.smembers(key).await
    }

    async fn replicate_from(&self, host: &str, port: u16) -> Result<()> {
        self.check()?;
        self.store.replicate_from(host, port).await
    }

    async fn replication_info(&self) -> Result<ReplicationInfo> {
        self.check()?;
        self.store.replication_info().await
    }
}

/// A clock that only moves when told to. Sleeping advances it instantly.
pub struct ManualClock {
    now: Mutex<f64>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct ProcessState {
    running: Vec<u32>,
    next_pid: u32,
    kills: Vec<u32>,
    launches: Vec<(PathBuf, String)>,
    signatures: Vec<String>,
    fail_launch: bool,
}

/// A process table with no real processes in it.
///
/// With [`on_network`](Self::on_network), a launch starts a process and
/// makes the given host reachable; a kill makes it unreachable again.
#[derive(Default)]
pub struct FakeProcessControl {
    state: Mutex<ProcessState>,
    network: Option<(MemoryNetwork, String)>,
}

impl FakeProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_network(network: MemoryNetwork, host: &str) -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
            network: Some((network, host.to_string())),
        }
    }

    /// Adds a running process without launching it.
    pub fn add_running(&self, pid: u32) {
        self.state.lock().running.push(pid);
    }

    pub fn running(&self) -> Vec<u32> {
        self.state.lock().running.clone()
    }

    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().kills.clone()
    }

    /// Binary and config file contents of every launch.
    pub fn launches(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().launches.clone()
    }

    /// Signatures the process table was searched for.
    pub fn signatures(&self) -> Vec<String> {
        self.state.lock().signatures.clone()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().fail_launch = fail;
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn find(&self, signature: &str) -> Result<Vec<u32>> {
        let mut state = self.state.lock();
        state.signatures.push(signature.to_string());
        Ok(state.running.clone())
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.kills.push(pid);
            state.running.retain(|p| *p != pid);
        }
        if let Some((network, host)) = &self.network {
            network.set_reachable(host, false);
        }
        Ok(())
    }

    async fn launch(&self, binary: &Path, config: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(config)?;
        {
            let mut state = self.state.lock();
            state.launches.push((binary.to_path_buf(), contents));
            if state.fail_launch {
                return Err(CascadeError::process("launch refused"));
            }
            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            state.running.push(pid);
        }
        if let Some((network, host)) = &self.network {
            network.set_reachable(host, true);
        }
        Ok(())
    }
}

/// A [`Tree`] for one node on a [`MemoryNetwork`], with a [`ManualClock`].
///
/// The node itself is registered on the network, and `localhost` is an alias
/// for it.
pub struct TestTree {
    pub tree: Arc<Tree>,
    pub network: MemoryNetwork,
    pub clock: Arc<ManualClock>,
}

impl TestTree {
    pub fn new(fqdn: &str, ip: &str) -> Self {
        Self::with(fqdn, ip, Vec::new(), TreeSettings::default())
    }

    pub fn with(fqdn: &str, ip: &str, bootstrap: Vec<String>, settings: TreeSettings) -> Self {
        let network = MemoryNetwork::new();
        network.add_host(fqdn, ip);
        network.add_alias("localhost", fqdn);
        Self::on_network(network, fqdn, bootstrap, settings)
    }

    /// Builds a tree for `fqdn`, which must already be on `network`.
    pub fn on_network(
        network: MemoryNetwork,
        fqdn: &str,
        bootstrap: Vec<String>,
        settings: TreeSettings,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(TEST_EPOCH));
        let ttl = Duration::from_secs(60);
        let cache = ConnectionCache::new(Arc::new(network.clone()), clock.clone(), ttl);
        let ip = network
            .state
            .lock()
            .hosts
            .get(fqdn)
            .map(|h| h.ip)
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        let identity = NodeIdentity {
            fqdn: fqdn.to_string(),
            ip,
        };
        let selector = SourceSelector::new(bootstrap, Arc::new(NoopFilter));
        let tree = Tree::new(
            identity,
            TEST_PORT,
            settings,
            cache,
            Arc::new(network.clone()),
            clock.clone(),
            selector,
        );
        Self {
            tree: Arc::new(tree),
            network,
            clock,
        }
    }

    /// Connection to this node's own instance. Not counted as a dial.
    pub fn local_handle(&self) -> StoreHandle {
        self.network
            .handle(&self.tree.identity.fqdn)
            .unwrap_or_else(|| Arc::new(MemoryStore::new()))
    }

    pub fn local_store(&self) -> Arc<MemoryStore> {
        self.network
            .store(&self.tree.identity.fqdn)
            .unwrap_or_else(|| Arc::new(MemoryStore::new()))
    }

    /// Adds a peer whose `time` key is `age` behind this node's clock.
    pub fn add_peer(&self, name: &str, ip: &str, age: Option<Duration>) -> Arc<MemoryStore> {
        let store = self.network.add_host(name, ip);
        if let Some(age) = age {
            let stamp = self.clock.now() - age.as_secs_f64();
            store.set_string(crate::topology::TIME_KEY, &format!("{:.6}", stamp));
        }
        store
    }
}
