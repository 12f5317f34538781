//! Best-source selection.
//!
//! Builds an ordered list of candidate upstreams from the bootstrap seeds and
//! the local (possibly stale) view, then probes them in order and takes the
//! first one whose data is fresh. Ranking stops at the first acceptable host.

use super::{SourceFilter, TopologyView, Tree, TIME_KEY};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

/// An upstream that passed the staleness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub host: String,
    pub ip: IpAddr,
}

pub struct SourceSelector {
    bootstrap: Vec<String>,
    filter: Arc<dyn SourceFilter>,
}

impl SourceSelector {
    pub fn new(bootstrap: Vec<String>, filter: Arc<dyn SourceFilter>) -> Self {
        let bootstrap = bootstrap
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        Self { bootstrap, filter }
    }

    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }

    /// The ordered list of hosts [`select`](Self::select) would probe.
    ///
    /// Roots never count as ordinary candidates: they go first with
    /// `prefer_root`, last otherwise. Ordinary candidates are deduplicated and
    /// shuffled so nodes spread across branches.
    pub fn candidates<R: Rng + ?Sized>(
        &self,
        view: Option<&TopologyView>,
        prefer_root: bool,
        rng: &mut R,
    ) -> Vec<String> {
        let mut roots: Vec<String> = Vec::new();
        let mut nodes: Vec<String> = self.bootstrap.clone();

        if let Some(view) = view {
            if let Some(root) = &view.root {
                roots.push(root.clone());
            }
            nodes.extend(view.branches.iter().cloned());
        }

        let mut seen = HashSet::new();
        nodes.retain(|n| !roots.contains(n) && seen.insert(n.clone()));
        nodes.shuffle(rng);

        let ordered = if prefer_root {
            roots.into_iter().chain(nodes).collect()
        } else {
            nodes.into_iter().chain(roots).collect()
        };
        self.filter.filter_sources(ordered)
    }

    /// Builds a fresh candidate list and probes it.
    pub async fn select(
        &self,
        tree: &Tree,
        view: Option<&TopologyView>,
        prefer_root: bool,
    ) -> Option<Source> {
        let candidates = self.candidates(view, prefer_root, &mut rand::rng());
        self.probe(tree, &candidates).await
    }

    /// Probes `candidates` in order and returns the first fresh one.
    ///
    /// A candidate is skipped when it is this node, does not resolve, cannot
    /// be reached, has no parseable liveness timestamp, or is more than the
    /// staleness threshold behind.
    pub async fn probe(&self, tree: &Tree, candidates: &[String]) -> Option<Source> {
        let threshold = tree.settings.staleness_threshold.as_secs_f64();

        for host in candidates {
            if tree.is_self(host) {
                continue;
            }
            let ip = match tree.resolver.resolve(host).await {
                Ok(ip) => ip,
                Err(_) => {
                    error!(%host, "Possible source is unresolvable");
                    continue;
                }
            };
            let conn = tree.cache.get_connection(&ip.to_string(), tree.port, false).await;
            let Some(conn) = conn else {
                info!(%host, "Possible source is down/unavailable");
                continue;
            };
            let stamp = match conn.get(TIME_KEY).await {
                Ok(Some(raw)) => raw.trim().parse::<f64>().ok().filter(|t| t.is_finite()),
                Ok(None) => None,
                Err(e) => {
                    info!(%host, error = %e, "Possible source failed to answer");
                    continue;
                }
            };
            let Some(stamp) = stamp else {
                info!(%host, "Possible source has no time/is blank");
                continue;
            };
            let staleness = tree.clock.now() - stamp;
            if staleness.is_nan() || staleness > threshold {
                info!(%host, staleness = format!("{:.2}", staleness), "Possible source is behind");
                continue;
            }
            info!(%host, staleness = format!("{:.2}", staleness), "Possible source ACCEPTED");
            return Some(Source {
                host: host.clone(),
                ip,
            });
        }

        error!("Found no healthy sources");
        None
    }
}
