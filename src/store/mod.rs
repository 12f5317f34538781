//! Store access
//!
//! The tree is coordinated through the store instances themselves, so the
//! controller only needs a narrow slice of the store's command set:
//! - scalar get/set for the root pointer and liveness timestamp
//! - set add/remove/members for branch bookkeeping
//! - replication reconfiguration and introspection

mod info;
pub mod resp;

pub use info::{ReplicationInfo, ReplicationRole};
pub use resp::{RespClient, TcpConnector};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Shared handle to a live store connection.
pub type StoreHandle = Arc<dyn StoreClient>;

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns true when the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true when the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>>;

    /// Points this instance's replication at `host:port`.
    async fn replicate_from(&self, host: &str, port: u16) -> Result<()>;

    async fn replication_info(&self) -> Result<ReplicationInfo>;
}

/// Dials store instances.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<StoreHandle>;
}
