//! Root health check.
//!
//! The root is the tree's clock: it stamps `time` every tick, and every other
//! node judges staleness against that stamp. It also keeps the branch and
//! draining-branch sets honest by probing every member.

use super::{Membership, Tree, ROOT_KEY, TIME_KEY};
use crate::error::Result;
use crate::store::{ReplicationInfo, ReplicationRole, StoreHandle};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// What probing one member of a membership set found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerProbe {
    Unreachable,
    Reachable(ReplicationInfo),
}

/// Everything the root read this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootObservation {
    pub root_pointer: Option<String>,
    pub info: ReplicationInfo,
    pub branches: BTreeMap<String, PeerProbe>,
    pub draining: BTreeMap<String, PeerProbe>,
    /// Whether this node found itself in the branch set.
    pub self_in_branches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    NoChildren,
    NotMaster(ReplicationRole),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneReason {
    Unreachable,
    Detached { upstream: Option<String> },
    Drained,
    AlsoBranch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub set: Membership,
    pub host: String,
    pub reason: PruneReason,
}

/// What the root will write this tick.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootPlan {
    pub claim_root_pointer: bool,
    pub remove_self_from_branches: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub removals: Vec<Removal>,
    pub child_counts: BTreeMap<String, u32>,
}

/// Decides the root's writes from what it observed. Pure.
pub fn plan(self_fqdn: &str, self_ip: &str, obs: &RootObservation) -> RootPlan {
    let mut plan = RootPlan {
        claim_root_pointer: obs.root_pointer.as_deref() != Some(self_fqdn),
        remove_self_from_branches: obs.self_in_branches,
        ..Default::default()
    };

    if obs.info.connected_children == 0 {
        plan.diagnostics.push(Diagnostic::NoChildren);
    }
    if obs.info.role != ReplicationRole::Master {
        plan.diagnostics.push(Diagnostic::NotMaster(obs.info.role));
    }

    for (host, probe) in &obs.branches {
        match probe {
            PeerProbe::Unreachable => plan.removals.push(Removal {
                set: Membership::Branches,
                host: host.clone(),
                reason: PruneReason::Unreachable,
            }),
            PeerProbe::Reachable(info) => {
                if !info.is_attached_to(self_ip) {
                    plan.removals.push(Removal {
                        set: Membership::Branches,
                        host: host.clone(),
                        reason: PruneReason::Detached {
                            upstream: info.master_host.clone(),
                        },
                    });
                }
                plan.child_counts.insert(host.clone(), info.connected_children);
            }
        }
    }

    for (host, probe) in &obs.draining {
        let reason = match probe {
            PeerProbe::Unreachable => Some(PruneReason::Unreachable),
            PeerProbe::Reachable(_) if obs.branches.contains_key(host) => {
                Some(PruneReason::AlsoBranch)
            }
            PeerProbe::Reachable(info) if info.connected_children == 0 => {
                Some(PruneReason::Drained)
            }
            PeerProbe::Reachable(_) => None,
        };
        if let PeerProbe::Reachable(info) = probe {
            plan.child_counts
                .entry(host.clone())
                .or_insert(info.connected_children);
        }
        if let Some(reason) = reason {
            plan.removals.push(Removal {
                set: Membership::Draining,
                host: host.clone(),
                reason,
            });
        }
    }

    plan
}

/// Reads the root pointer, both membership sets, and probes each member.
pub async fn observe(
    tree: &Tree,
    local: &StoreHandle,
    info: &ReplicationInfo,
) -> Result<RootObservation> {
    let root_pointer = local.get(ROOT_KEY).await?;
    let mut branch_hosts = local.smembers(Membership::Branches.key()).await?;
    let self_in_branches = branch_hosts.remove(&tree.identity.fqdn);
    let draining_hosts = local.smembers(Membership::Draining.key()).await?;

    Ok(RootObservation {
        root_pointer,
        info: info.clone(),
        branches: probe_all(tree, branch_hosts).await,
        draining: probe_all(tree, draining_hosts).await,
        self_in_branches,
    })
}

async fn probe_all(tree: &Tree, hosts: BTreeSet<String>) -> BTreeMap<String, PeerProbe> {
    let mut probes = BTreeMap::new();
    for host in hosts {
        let probe = match tree.cache.get_connection(&host, tree.port, true).await {
            None => PeerProbe::Unreachable,
            Some(conn) => match conn.replication_info().await {
                Ok(info) => PeerProbe::Reachable(info),
                Err(e) => {
                    warn!(%host, error = %e, "Failed to read replication info");
                    PeerProbe::Unreachable
                }
            },
        };
        probes.insert(host, probe);
    }
    probes
}

/// Writes the liveness stamp and carries out `plan` on the local instance.
pub async fn apply(tree: &Tree, local: &StoreHandle, plan: &RootPlan) -> Result<()> {
    if plan.claim_root_pointer {
        info!(root = %tree.identity.fqdn, "Claiming root pointer");
        local.set(ROOT_KEY, &tree.identity.fqdn).await?;
    }
    if plan.remove_self_from_branches {
        local.srem(Membership::Branches.key(), &tree.identity.fqdn).await?;
    }

    for diagnostic in &plan.diagnostics {
        match diagnostic {
            Diagnostic::NoChildren => error!("I am a root node, but have no branches connected!"),
            Diagnostic::NotMaster(role) => {
                error!(%role, "I am a root node, but my replication role is not master!")
            }
        }
    }

    for removal in &plan.removals {
        match &removal.reason {
            PruneReason::Unreachable => {
                warn!(host = %removal.host, "Branch has gone MIA, removing from list")
            }
            PruneReason::Detached { upstream } => info!(
                host = %removal.host,
                upstream = upstream.as_deref().unwrap_or("none"),
                "Supposed branch is not connected to us, pruning"
            ),
            PruneReason::Drained => {
                info!(host = %removal.host, "Drained branch finished, removing")
            }
            PruneReason::AlsoBranch => {
                info!(host = %removal.host, "Host is a registered branch, dropping draining entry")
            }
        }
        local.srem(removal.set.key(), &removal.host).await?;
        if removal.reason == PruneReason::Unreachable {
            tree.forget_child_count(&removal.host);
        }
    }

    for (host, count) in &plan.child_counts {
        tree.record_child_count(host, *count);
    }
    Ok(())
}

/// One root tick.
pub async fn health_check(tree: &Tree, local: &StoreHandle, info: &ReplicationInfo) -> Result<()> {
    local.set(TIME_KEY, &format!("{:.6}", tree.clock.now())).await?;
    let observation = observe(tree, local, info).await?;
    let plan = plan(&tree.identity.fqdn, &tree.identity.ip.to_string(), &observation);
    apply(tree, local, &plan).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached(to: &str, children: u32) -> PeerProbe {
        PeerProbe::Reachable(ReplicationInfo {
            role: ReplicationRole::Replica,
            connected_children: children,
            master_host: Some(to.to_string()),
            master_port: Some(2578),
            master_link_up: true,
        })
    }

    fn healthy_root_info() -> ReplicationInfo {
        ReplicationInfo {
            role: ReplicationRole::Master,
            connected_children: 2,
            ..Default::default()
        }
    }

    fn observation() -> RootObservation {
        RootObservation {
            root_pointer: Some("r1".into()),
            info: healthy_root_info(),
            branches: BTreeMap::new(),
            draining: BTreeMap::new(),
            self_in_branches: false,
        }
    }

    #[test]
    fn steady_state_plans_nothing() {
        let mut obs = observation();
        obs.branches.insert("b1".into(), attached("10.0.0.1", 4));
        let plan = plan("r1", "10.0.0.1", &obs);
        assert!(!plan.claim_root_pointer);
        assert!(plan.removals.is_empty());
        assert!(plan.diagnostics.is_empty());
        assert_eq!(plan.child_counts.get("b1"), Some(&4));
    }

    #[test]
    fn claims_missing_or_foreign_pointer() {
        let mut obs = observation();
        obs.root_pointer = None;
        assert!(plan("r1", "10.0.0.1", &obs).claim_root_pointer);
        obs.root_pointer = Some("old-root".into());
        assert!(plan("r1", "10.0.0.1", &obs).claim_root_pointer);
    }

    #[test]
    fn misconfiguration_is_diagnosed_not_fixed() {
        let mut obs = observation();
        obs.info = ReplicationInfo {
            role: ReplicationRole::Replica,
            connected_children: 0,
            ..Default::default()
        };
        let plan = plan("r1", "10.0.0.1", &obs);
        assert_eq!(
            plan.diagnostics,
            vec![Diagnostic::NoChildren, Diagnostic::NotMaster(ReplicationRole::Replica)]
        );
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn prunes_dead_and_detached_branches() {
        let mut obs = observation();
        obs.branches.insert("dead".into(), PeerProbe::Unreachable);
        obs.branches.insert("elsewhere".into(), attached("10.9.9.9", 1));
        obs.branches.insert("good".into(), attached("10.0.0.1", 1));
        let plan = plan("r1", "10.0.0.1", &obs);
        let pruned: Vec<_> = plan.removals.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(pruned, vec!["dead", "elsewhere"]);
        assert!(plan.removals.iter().all(|r| r.set == Membership::Branches));
    }

    #[test]
    fn drained_entries_go_busy_ones_stay() {
        let mut obs = observation();
        obs.draining.insert("done".into(), attached("10.0.0.7", 0));
        obs.draining.insert("busy".into(), attached("10.0.0.7", 3));
        obs.draining.insert("gone".into(), PeerProbe::Unreachable);
        let plan = plan("r1", "10.0.0.1", &obs);
        let pruned: Vec<_> = plan
            .removals
            .iter()
            .map(|r| (r.host.as_str(), r.reason.clone()))
            .collect();
        assert_eq!(
            pruned,
            vec![("done", PruneReason::Drained), ("gone", PruneReason::Unreachable)]
        );
        assert_eq!(plan.child_counts.get("busy"), Some(&3));
    }

    #[test]
    fn host_in_both_sets_keeps_branch_membership() {
        let mut obs = observation();
        obs.branches.insert("b1".into(), attached("10.0.0.1", 2));
        obs.draining.insert("b1".into(), attached("10.0.0.1", 2));
        let plan = plan("r1", "10.0.0.1", &obs);
        assert_eq!(
            plan.removals,
            vec![Removal {
                set: Membership::Draining,
                host: "b1".into(),
                reason: PruneReason::AlsoBranch,
            }]
        );
    }

    #[test]
    fn self_membership_is_removed() {
        let mut obs = observation();
        obs.self_in_branches = true;
        assert!(plan("r1", "10.0.0.1", &obs).remove_self_from_branches);
    }
}
