//! Cluster directory: node DSNs and per-cluster connection settings read
//! from a server's option list, plus the option validators.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ServerDef;
use crate::error::{Result, RouteError};

pub const ISOLATION_LEVEL: &str = "isolation_level";
pub const CONNECTION_LIFETIME: &str = "connection_lifetime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    AutoCommit,
    #[default]
    ReadCommitted,
    ReadCommittedReadOnly,
}

impl IsolationLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        let level = match raw.to_ascii_lowercase().as_str() {
            "auto commit" => Self::AutoCommit,
            "read committed" => Self::ReadCommitted,
            "read committed read only" => Self::ReadCommittedReadOnly,
            _ => return None,
        };
        Some(level)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoCommit => "auto commit",
            Self::ReadCommitted => "read committed",
            Self::ReadCommittedReadOnly => "read committed read only",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved cluster. Nodes are indexed `0..node_count()` without gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: u32,
    pub name: String,
    pub nodes: Vec<String>,
    pub isolation_level: IsolationLevel,
    /// Seconds; 0 keeps connections forever.
    pub connection_lifetime: u64,
}

impl Cluster {
    pub fn from_server(server: &ServerDef, max_nodes: usize) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let mut isolation_level = IsolationLevel::default();
        let mut connection_lifetime = 0;

        for (key, value) in &server.options {
            if let Some(n) = extract_node_num(key) {
                nodes.insert(n, value.clone());
            } else if key == ISOLATION_LEVEL {
                isolation_level = IsolationLevel::parse(value).ok_or_else(|| {
                    RouteError::Config(format!(
                        "cluster {}: invalid isolation level '{value}'",
                        server.name
                    ))
                })?;
            } else if key == CONNECTION_LIFETIME {
                connection_lifetime = value.parse().map_err(|_| {
                    RouteError::Config(format!(
                        "cluster {}: invalid connection lifetime '{value}'",
                        server.name
                    ))
                })?;
            }
        }

        if nodes.len() > max_nodes {
            return Err(RouteError::Config(format!(
                "cluster {} has {} nodes, at most {max_nodes} are supported",
                server.name,
                nodes.len()
            )));
        }
        if nodes.keys().enumerate().any(|(expected, n)| expected != *n) {
            return Err(RouteError::Config(format!(
                "nodes of cluster {} must be numbered consecutively from 0",
                server.name
            )));
        }

        Ok(Self {
            id: server.id,
            name: server.name.clone(),
            nodes: nodes.into_values().collect(),
            isolation_level,
            connection_lifetime,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Bounds-checks a node number computed at call time.
    pub fn check_node(&self, node: i64) -> Result<usize> {
        usize::try_from(node)
            .ok()
            .filter(|n| *n < self.nodes.len())
            .ok_or_else(|| {
                RouteError::NodeResolution(format!(
                    "node {node} is out of range for cluster {} ({} nodes)",
                    self.name,
                    self.nodes.len()
                ))
            })
    }

    pub fn node_dsn(&self, node: usize) -> Result<&str> {
        self.nodes.get(node).map(String::as_str).ok_or_else(|| {
            RouteError::NodeResolution(format!(
                "node {node} is out of range for cluster {} ({} nodes)",
                self.name,
                self.nodes.len()
            ))
        })
    }

    pub fn lifetime(&self) -> Option<Duration> {
        (self.connection_lifetime > 0).then(|| Duration::from_secs(self.connection_lifetime))
    }
}

/// Node number of an `n<k>` or `node_<k>` option key.
pub fn extract_node_num(key: &str) -> Option<usize> {
    let digits = key
        .strip_prefix("node_")
        .or_else(|| key.strip_prefix('n'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn invalid_option(msg: impl Into<String>) -> RouteError {
    RouteError::Config(msg.into())
}

fn conninfo_keys(dsn: &str) -> impl Iterator<Item = &str> {
    dsn.split_whitespace()
        .filter_map(|pair| pair.split_once('=').map(|(k, _)| k.trim()))
}

/// Checks a server option list before it is stored.
pub fn validate_server_options(options: &[(String, String)]) -> Result<()> {
    let mut node_count = 0usize;

    for (key, value) in options {
        if let Some(n) = extract_node_num(key) {
            if n != node_count {
                return Err(invalid_option(format!(
                    "node number must be {node_count}, got {n} in option '{key}'"
                )));
            }
            node_count += 1;

            let keys: Vec<&str> = conninfo_keys(value).collect();
            if !keys.contains(&"dbname") {
                return Err(invalid_option(format!(
                    "option '{key}' must contain 'dbname'"
                )));
            }
            if keys.iter().any(|k| *k == "user" || *k == "password") {
                return Err(invalid_option(format!(
                    "option '{key}' must not contain 'user' or 'password', use a user mapping"
                )));
            }
        } else if key == ISOLATION_LEVEL {
            if IsolationLevel::parse(value).is_none() {
                return Err(invalid_option(format!(
                    "invalid isolation level '{value}', expected one of (auto commit, read committed, read committed read only)"
                )));
            }
        } else if key == CONNECTION_LIFETIME {
            if value.parse::<u64>().is_err() {
                return Err(invalid_option(format!(
                    "connection lifetime '{value}' must be a non-negative number of seconds"
                )));
            }
        } else {
            return Err(invalid_option(format!("invalid option '{key}'")));
        }
    }
    Ok(())
}

/// Checks a user mapping option list before it is stored.
pub fn validate_user_mapping_options(options: &[(String, String)]) -> Result<()> {
    match options.iter().find(|(k, _)| k != "user" && k != "password") {
        Some((key, _)) => Err(invalid_option(format!(
            "invalid option '{key}', only 'user' and 'password' are allowed"
        ))),
        None => Ok(()),
    }
}
