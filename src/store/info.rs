//! Parsing for the `INFO replication` section.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicationRole {
    Master,
    Replica,
    Unknown,
}

impl std::fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationRole::Master => write!(f, "master"),
            ReplicationRole::Replica => write!(f, "slave"),
            ReplicationRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a store instance reports about its place in the replication tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationInfo {
    pub role: ReplicationRole,
    /// Number of replicas currently attached to this instance.
    pub connected_children: u32,
    /// Upstream host as configured, usually an IP address.
    pub master_host: Option<String>,
    pub master_port: Option<u16>,
    pub master_link_up: bool,
}

impl Default for ReplicationInfo {
    fn default() -> Self {
        Self {
            role: ReplicationRole::Unknown,
            connected_children: 0,
            master_host: None,
            master_port: None,
            master_link_up: false,
        }
    }
}

impl ReplicationInfo {
    /// Parses the `key:value` lines of `INFO replication`. Unknown keys and
    /// section headers are ignored; missing keys keep their defaults.
    pub fn parse(text: &str) -> Self {
        let mut info = ReplicationInfo::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "role" => {
                    info.role = match value {
                        "master" => ReplicationRole::Master,
                        "slave" | "replica" => ReplicationRole::Replica,
                        _ => ReplicationRole::Unknown,
                    }
                }
                "connected_slaves" => {
                    info.connected_children = value.parse().unwrap_or(0);
                }
                "master_host" => {
                    if !value.is_empty() {
                        info.master_host = Some(value.to_string());
                    }
                }
                "master_port" => info.master_port = value.parse().ok(),
                "master_link_status" => info.master_link_up = value == "up",
                _ => {}
            }
        }
        info
    }

    /// True when this instance replicates from `ip`.
    pub fn is_attached_to(&self, ip: &str) -> bool {
        self.master_host.as_deref() == Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_replica_section() {
        let text = "# Replication\r\nrole:slave\r\n\
                    master_host:10.0.0.1\r\nmaster_port:2578\r\nmaster_link_status:up\r\n\
                    connected_slaves:2\r\nslave0:ip=10.0.0.5,port=2578\r\n";
        let info = ReplicationInfo::parse(text);
        assert_eq!(info.role, ReplicationRole::Replica);
        assert_eq!(info.master_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(info.master_port, Some(2578));
        assert!(info.master_link_up);
        assert_eq!(info.connected_children, 2);
        assert!(info.is_attached_to("10.0.0.1"));
        assert!(!info.is_attached_to("10.0.0.2"));
    }

    #[test]
    fn master_without_children() {
        let info = ReplicationInfo::parse("# Replication\nrole:master\nconnected_slaves:0\n");
        assert_eq!(info.role, ReplicationRole::Master);
        assert_eq!(info.connected_children, 0);
        assert_eq!(info.master_host, None);
        assert!(!info.master_link_up);
    }

    #[test]
    fn garbage_is_tolerated() {
        let info = ReplicationInfo::parse("nonsense\nconnected_slaves:lots\nrole:sentinel");
        assert_eq!(info, ReplicationInfo::default());
    }
}
