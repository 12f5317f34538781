//! Short-lived connection cache.
//!
//! Health checks dial the same handful of peers every tick. The cache keeps
//! those connections around for a bounded window so a tick does not pay a
//! fresh TCP handshake per peer, while the wholesale sweep keeps anything from
//! living longer than `ttl`.

use crate::clock::Clock;
use crate::store::{Connector, StoreHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

type CacheKey = (String, u16);

struct CacheState {
    entries: HashMap<CacheKey, StoreHandle>,
    last_clear: f64,
}

/// Clonable handle; all clones share the same entries.
#[derive(Clone)]
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let last_clear = clock.now();
        Self {
            connector,
            clock,
            ttl,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                last_clear,
            })),
        }
    }

    /// Returns a connection that answered PING just now, or `None`.
    ///
    /// With `cached` set, a cached entry that still answers is reused. Without
    /// it, any cached entry is dropped and a fresh connection is made; the
    /// fresh connection is cached either way.
    pub async fn get_connection(&self, host: &str, port: u16, cached: bool) -> Option<StoreHandle> {
        self.sweep_if_due();
        let key = (host.to_string(), port);

        let existing = {
            let mut state = self.state.lock();
            if cached {
                state.entries.get(&key).cloned()
            } else {
                state.entries.remove(&key);
                None
            }
        };

        if let Some(conn) = existing {
            if conn.ping().await.is_ok() {
                trace!(host, port, "reusing cached connection");
                return Some(conn);
            }
            debug!(host, port, "cached connection failed probe, evicting");
            self.evict(&key, &conn);
        }

        let conn = match self.connector.connect(host, port).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(host, port, error = %e, "connect failed");
                return None;
            }
        };
        if let Err(e) = conn.ping().await {
            debug!(host, port, error = %e, "fresh connection failed probe");
            return None;
        }

        self.state.lock().entries.insert(key, conn.clone());
        Some(conn)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.last_clear = self.clock.now();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns a task that clears the cache every `ttl`. The lazy check in
    /// [`get_connection`](Self::get_connection) enforces the same bound; the
    /// task only releases idle sockets sooner.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.ttl);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.sweep_if_due();
            }
        })
    }

    fn sweep_if_due(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if now - state.last_clear >= self.ttl.as_secs_f64() {
            if !state.entries.is_empty() {
                debug!(entries = state.entries.len(), "clearing connection cache");
            }
            state.entries.clear();
            state.last_clear = now;
        }
    }

    /// Removes `key` only if it still maps to `conn`; a concurrent caller may
    /// already have replaced it.
    fn evict(&self, key: &CacheKey, conn: &StoreHandle) {
        let mut state = self.state.lock();
        if state
            .entries
            .get(key)
            .map(|current| Arc::ptr_eq(current, conn))
            .unwrap_or(false)
        {
            state.entries.remove(key);
        }
    }
}
