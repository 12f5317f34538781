//! Branch health check: stay registered with the root and replicate from it.

use super::{enroll, Membership, Tree};
use crate::error::Result;
use crate::store::{ReplicationInfo, StoreHandle};
use crate::supervisor;
use tracing::{error, info};

/// What a branch does after looking at the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchAction {
    /// Already replicating from the root.
    Steady,
    /// Replicating from someone else; move to the root.
    Reparent,
}

pub fn plan(info: &ReplicationInfo, root_ip: &str) -> BranchAction {
    if info.is_attached_to(root_ip) {
        BranchAction::Steady
    } else {
        BranchAction::Reparent
    }
}

/// One branch tick.
pub async fn health_check(tree: &Tree, local: &StoreHandle, info: &ReplicationInfo) -> Result<()> {
    let Some(root) = tree.find_root(local).await else {
        error!("Failed to connect to root instance");
        return Ok(());
    };
    enroll(root.conn.as_ref(), Membership::Branches, &tree.identity.fqdn).await?;

    let root_ip = root.ip.to_string();
    if plan(info, &root_ip) == BranchAction::Reparent {
        info!(
            root = %root.host,
            upstream = info.master_host.as_deref().unwrap_or("none"),
            "I am a branch and not connected to the root, reparenting"
        );
        supervisor::reparent(tree, local, &root.host, root.ip).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_branch_is_steady() {
        let info = ReplicationInfo {
            master_host: Some("10.0.0.1".into()),
            ..Default::default()
        };
        assert_eq!(plan(&info, "10.0.0.1"), BranchAction::Steady);
        assert_eq!(plan(&info, "10.0.0.2"), BranchAction::Reparent);
        assert_eq!(plan(&ReplicationInfo::default(), "10.0.0.1"), BranchAction::Reparent);
    }
}
