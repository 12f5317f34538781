//! Candidate-list filters.
//!
//! A filter sees the ordered list of hosts source selection is about to probe
//! and may reorder, drop, or add hosts. Filters are picked by name from the
//! configuration at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub trait SourceFilter: Send + Sync {
    fn filter_sources(&self, sources: Vec<String>) -> Vec<String>;
}

/// Returns the list unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFilter;

impl SourceFilter for NoopFilter {
    fn filter_sources(&self, sources: Vec<String>) -> Vec<String> {
        sources
    }
}

/// Moves hosts in this node's DNS domain ahead of the rest, keeping the
/// relative order within each group.
#[derive(Debug, Clone)]
pub struct SameDomainFirst {
    domain: String,
}

impl SameDomainFirst {
    /// `fqdn` is this node's name; everything after the first label is the
    /// domain. A bare hostname has no domain and the filter is a no-op.
    pub fn for_host(fqdn: &str) -> Self {
        let domain = fqdn.split_once('.').map(|(_, d)| d.to_string()).unwrap_or_default();
        Self { domain }
    }

    fn is_local(&self, host: &str) -> bool {
        !self.domain.is_empty()
            && host
                .split_once('.')
                .map(|(_, d)| d == self.domain)
                .unwrap_or(false)
    }
}

impl SourceFilter for SameDomainFirst {
    fn filter_sources(&self, sources: Vec<String>) -> Vec<String> {
        let (mut local, remote): (Vec<_>, Vec<_>) =
            sources.into_iter().partition(|h| self.is_local(h));
        local.extend(remote);
        local
    }
}

/// Drops listed hosts.
#[derive(Debug, Clone, Default)]
pub struct ExcludeHosts {
    hosts: HashSet<String>,
}

impl ExcludeHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

impl SourceFilter for ExcludeHosts {
    fn filter_sources(&self, sources: Vec<String>) -> Vec<String> {
        sources.into_iter().filter(|h| !self.hosts.contains(h)).collect()
    }
}

/// Filter selection as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FilterConfig {
    #[default]
    None,
    SameDomainFirst,
    Exclude {
        #[serde(default)]
        hosts: Vec<String>,
    },
}

impl FilterConfig {
    pub fn build(&self, self_fqdn: &str) -> Arc<dyn SourceFilter> {
        match self {
            FilterConfig::None => Arc::new(NoopFilter),
            FilterConfig::SameDomainFirst => Arc::new(SameDomainFirst::for_host(self_fqdn)),
            FilterConfig::Exclude { hosts } => Arc::new(ExcludeHosts::new(hosts.iter().cloned())),
        }
    }
}
