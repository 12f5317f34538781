//! Leaf health check.
//!
//! A leaf that picked up children serves as an informal branch. It tells the
//! root about that through the draining set, so the root keeps counting its
//! children without advertising it to new leaves.
//!
//! A leaf deliberately does not leave an upstream that dropped out of the
//! branch set. A global rollout can flip many self-selected branches at once,
//! and eager migration would move all their leaves in the same second. The
//! random rebalance below spreads those moves out instead.

use super::{enroll, Membership, TopologyView, Tree, BRANCHES_KEY};
use crate::error::Result;
use crate::store::{ReplicationInfo, StoreHandle};
use crate::supervisor;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Membership fixes a leaf needs this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafPlan {
    /// Self is listed as a branch from an earlier run.
    pub leave_branches: bool,
    /// Self has children and must be counted as draining.
    pub join_draining: bool,
}

impl LeafPlan {
    pub fn needs_root(&self) -> bool {
        self.leave_branches || self.join_draining
    }
}

pub fn plan(
    self_fqdn: &str,
    local_branches: &BTreeSet<String>,
    info: &ReplicationInfo,
) -> LeafPlan {
    LeafPlan {
        leave_branches: local_branches.contains(self_fqdn),
        join_draining: info.connected_children > 0,
    }
}

/// One leaf tick. `draw` decides whether this tick rebalances.
pub async fn health_check<R: Rng>(
    tree: &Tree,
    local: &StoreHandle,
    info: &ReplicationInfo,
    draw: &mut R,
) -> Result<()> {
    let local_branches = local.smembers(BRANCHES_KEY).await?;
    let plan = plan(&tree.identity.fqdn, &local_branches, info);

    if plan.needs_root() {
        fix_membership(tree, local, &plan).await?;
    }

    if draw.random_bool(tree.settings.rebalance_probability.clamp(0.0, 1.0)) {
        rebalance(tree, local, info).await?;
    }
    Ok(())
}

async fn fix_membership(tree: &Tree, local: &StoreHandle, plan: &LeafPlan) -> Result<()> {
    let Some(root) = tree.find_root(local).await else {
        error!("Leaf could not reach the root to update its membership");
        return Ok(());
    };
    let me = &tree.identity.fqdn;

    if plan.leave_branches {
        warn!("Leaf node removing myself from list of branches");
        root.conn.srem(Membership::Branches.key(), me).await?;
    }
    if plan.join_draining {
        enroll(root.conn.as_ref(), Membership::Draining, me).await?;
    }
    Ok(())
}

/// Picks a fresh upstream and moves to it, unless it is the current one.
pub async fn rebalance(tree: &Tree, local: &StoreHandle, info: &ReplicationInfo) -> Result<()> {
    let view = TopologyView::read(local.as_ref()).await?;
    let Some(source) = tree.select_source(Some(&view), false).await else {
        error!("Periodic rebalance found no available, healthy branches!");
        return Ok(());
    };
    if info.is_attached_to(&source.ip.to_string()) {
        return Ok(());
    }
    info!(branch = %source.host, ip = %source.ip, "Periodic rebalance, picked new branch");
    supervisor::reparent(tree, local, &source.host, source.ip).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_leaf_needs_nothing() {
        let plan = plan("leaf1", &BTreeSet::new(), &ReplicationInfo::default());
        assert_eq!(plan, LeafPlan::default());
        assert!(!plan.needs_root());
    }

    #[test]
    fn stale_branch_entry_and_children_are_both_fixed() {
        let branches: BTreeSet<String> = ["leaf1".to_string(), "b1".to_string()].into();
        let info = ReplicationInfo {
            connected_children: 2,
            ..Default::default()
        };
        let plan = plan("leaf1", &branches, &info);
        assert!(plan.leave_branches);
        assert!(plan.join_draining);
    }
}
