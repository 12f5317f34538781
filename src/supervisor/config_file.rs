//! Generated store configuration files.

use crate::error::Result;
use crate::topology::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use tempfile::TempPath;
use tracing::debug;

/// A configuration value as written in the cascade YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RedisValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RedisValue {
    /// Renders the value the way the store's config parser expects it.
    pub fn render(&self) -> String {
        match self {
            RedisValue::Bool(true) => "yes".to_string(),
            RedisValue::Bool(false) => "no".to_string(),
            RedisValue::Integer(i) => i.to_string(),
            RedisValue::Float(f) => f.to_string(),
            RedisValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for RedisValue {
    fn from(s: &str) -> Self {
        RedisValue::Text(s.to_string())
    }
}

/// Profile name to directives. `common` applies to every role; a profile
/// named after a role overrides it.
pub type RedisProfiles = BTreeMap<String, BTreeMap<String, RedisValue>>;

/// Builds the directives for `role`.
///
/// `port` and `daemonize` are always forced. Non-root roles also get a
/// `slaveof` directive pointing at `master`.
pub fn render(
    role: Role,
    profiles: &RedisProfiles,
    port: u16,
    master: Option<IpAddr>,
) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for profile in ["common", role.as_str()] {
        if let Some(directives) = profiles.get(profile) {
            for (key, value) in directives {
                merged.insert(key.clone(), value.render());
            }
        }
    }
    merged.insert("port".into(), port.to_string());
    merged.insert("daemonize".into(), RedisValue::Bool(true).render());
    merged.remove("slaveof");
    merged.remove("replicaof");

    let mut lines: Vec<(String, String)> = merged.into_iter().collect();
    if role != Role::Root {
        if let Some(master) = master {
            lines.push(("slaveof".into(), format!("{} {}", master, port)));
        }
    }
    lines
}

/// Writes `directives` to a fresh temporary file in `dir`, or the system
/// temp dir. The file is deleted when the returned path is dropped.
pub fn write(role: Role, directives: &[(String, String)], dir: Option<&Path>) -> Result<TempPath> {
    let prefix = format!("cascade-{}-", role);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    let body: Vec<String> = directives
        .iter()
        .map(|(k, v)| format!("{} {}", k, v))
        .collect();
    file.write_all(body.join("\n").as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    let path = file.into_temp_path();
    debug!(path = %path.display(), "Wrote store config");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> RedisProfiles {
        let yaml = r#"
common:
  appendonly: true
  maxmemory: 1gb
  tcp-backlog: 511
leaf:
  appendonly: false
  slaveof: 1.2.3.4 9999
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn lookup<'a>(lines: &'a [(String, String)], key: &str) -> Option<&'a str> {
        lines.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn root_has_no_upstream() {
        let master = Some("10.0.0.1".parse().unwrap());
        let lines = render(Role::Root, &profiles(), 2578, master);
        assert_eq!(lookup(&lines, "port"), Some("2578"));
        assert_eq!(lookup(&lines, "daemonize"), Some("yes"));
        assert_eq!(lookup(&lines, "appendonly"), Some("yes"));
        assert_eq!(lookup(&lines, "tcp-backlog"), Some("511"));
        assert_eq!(lookup(&lines, "slaveof"), None);
    }

    #[test]
    fn role_profile_overrides_common_and_upstream_is_forced() {
        let master = Some("10.0.0.2".parse().unwrap());
        let lines = render(Role::Leaf, &profiles(), 2578, master);
        assert_eq!(lookup(&lines, "appendonly"), Some("no"));
        assert_eq!(lookup(&lines, "maxmemory"), Some("1gb"));
        assert_eq!(lookup(&lines, "slaveof"), Some("10.0.0.2 2578"));
        assert_eq!(lines.iter().filter(|(k, _)| k == "slaveof").count(), 1);
    }

    #[test]
    fn written_file_is_removed_on_drop() {
        let master = Some("10.0.0.3".parse().unwrap());
        let lines = render(Role::Branch, &RedisProfiles::new(), 2578, master);
        let path = write(Role::Branch, &lines, None).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("port 2578\n"));
        assert!(body.contains("daemonize yes\n"));
        assert!(body.ends_with("slaveof 10.0.0.3 2578\n"));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cascade-branch-"));

        let on_disk = path.to_path_buf();
        drop(path);
        assert!(!on_disk.exists());
    }

    #[test]
    fn written_into_the_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lines = render(Role::Root, &RedisProfiles::new(), 2578, None);
        let path = write(Role::Root, &lines, Some(dir.path())).unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[test]
    fn missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let lines = render(Role::Root, &RedisProfiles::new(), 2578, None);
        assert!(write(Role::Root, &lines, Some(&missing)).is_err());
    }
}
