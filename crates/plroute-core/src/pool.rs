//! Node connection pool, keyed by the fully resolved connection string.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cluster::{Cluster, IsolationLevel};
use crate::error::{Result, RouteError};
use crate::transport::{quote_conninfo_value, Connector, RemoteConnection};

/// Credentials from the current user's mapping for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    /// Reads `user`/`password` mapping options; the user falls back to
    /// `current_user`.
    pub fn from_mapping(options: &[(String, String)], current_user: &str) -> Self {
        let get = |key: &str| options.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        Self {
            user: get("user").unwrap_or_else(|| current_user.to_string()),
            password: get("password"),
        }
    }
}

/// Statistics for the connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub total_created: u64,
    pub total_reused: u64,
    pub total_expired: u64,
    pub total_purged: u64,
}

/// One open node connection and its remote transaction depth.
pub struct Connection {
    transport: Box<dyn RemoteConnection>,
    dsn: String,
    cluster: String,
    node: usize,
    isolation_level: IsolationLevel,
    depth: u32,
    connected_at: Instant,
}

impl Connection {
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Remote transaction depth: 0 outside a transaction, 1 inside, one
    /// more per open savepoint.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Connections inside a remote transaction never expire; they are
    /// replaced on the first acquire after the transaction ends.
    fn is_expired(&self, lifetime: Option<Duration>) -> bool {
        self.depth == 0 && lifetime.is_some_and(|l| self.age() > l)
    }

    pub(crate) fn transport(&mut self) -> &mut dyn RemoteConnection {
        self.transport.as_mut()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cluster", &self.cluster)
            .field("node", &self.node)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// At most one connection per resolved connection string.
pub struct ConnectionPool {
    connector: Box<dyn Connector>,
    connections: BTreeMap<String, Connection>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            connections: BTreeMap::new(),
            stats: PoolStats::default(),
        }
    }

    /// Node connection string plus the mapped user and password.
    pub fn effective_dsn(base: &str, credentials: &Credentials) -> String {
        let mut dsn = format!("{base} user={}", quote_conninfo_value(&credentials.user));
        if let Some(password) = &credentials.password {
            dsn.push_str(" password=");
            dsn.push_str(&quote_conninfo_value(password));
        }
        dsn
    }

    /// Returns the key of a live connection to `node`, opening one if
    /// needed. Idle connections older than the cluster's lifetime are
    /// replaced.
    pub fn acquire(&mut self, cluster: &Cluster, node: usize, credentials: &Credentials) -> Result<String> {
        let base = cluster.node_dsn(node)?;
        let dsn = Self::effective_dsn(base, credentials);

        if let Some(conn) = self.connections.get(&dsn) {
            if !conn.is_expired(cluster.lifetime()) {
                self.stats.total_reused += 1;
                return Ok(dsn);
            }
            debug!(cluster = %cluster.name, node, age_secs = conn.age().as_secs(), "connection lifetime exceeded, reconnecting");
            self.connections.remove(&dsn);
            self.stats.total_expired += 1;
        }

        let transport = self.connector.connect(&dsn).map_err(|e| {
            RouteError::Connection(format!(
                "failed connect to '{base} user={}' (cluster {}, node {node}): {}",
                credentials.user,
                cluster.name,
                match e {
                    RouteError::Connection(msg) => msg,
                    other => other.to_string(),
                }
            ))
        })?;
        debug!(cluster = %cluster.name, node, "opened node connection");
        self.stats.total_created += 1;
        self.connections.insert(
            dsn.clone(),
            Connection {
                transport,
                dsn: dsn.clone(),
                cluster: cluster.name.clone(),
                node,
                isolation_level: cluster.isolation_level,
                depth: 0,
                connected_at: Instant::now(),
            },
        );
        Ok(dsn)
    }

    pub fn get_mut(&mut self, dsn: &str) -> Result<&mut Connection> {
        self.connections
            .get_mut(dsn)
            .ok_or_else(|| RouteError::Internal("connection vanished from pool".to_string()))
    }

    /// Closes and forgets a connection.
    pub fn remove(&mut self, dsn: &str) -> Option<Connection> {
        let conn = self.connections.remove(dsn)?;
        warn!(cluster = %conn.cluster, node = conn.node, "dropping node connection");
        self.stats.total_purged += 1;
        Some(conn)
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.connections.len(),
            ..self.stats.clone()
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, dsn: &str, by: Duration) {
        if let Some(conn) = self.connections.get_mut(dsn) {
            if let Some(earlier) = conn.connected_at.checked_sub(by) {
                conn.connected_at = earlier;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn cluster(lifetime: u64) -> Cluster {
        Cluster {
            id: 1,
            name: "users".into(),
            nodes: vec!["dbname=u0".into(), "dbname=u1".into()],
            isolation_level: IsolationLevel::ReadCommitted,
            connection_lifetime: lifetime,
        }
    }

    fn creds(user: &str, password: Option<&str>) -> Credentials {
        Credentials {
            user: user.into(),
            password: password.map(Into::into),
        }
    }

    #[test]
    fn credentials_fall_back_to_current_user() {
        let c = Credentials::from_mapping(&[], "app");
        assert_eq!(c, creds("app", None));
        let c = Credentials::from_mapping(
            &[("user".into(), "router".into()), ("password".into(), "pw".into())],
            "app",
        );
        assert_eq!(c, creds("router", Some("pw")));
    }

    #[test]
    fn effective_dsn_appends_credentials() {
        assert_eq!(
            ConnectionPool::effective_dsn("dbname=u0", &creds("app", None)),
            "dbname=u0 user=app"
        );
        assert_eq!(
            ConnectionPool::effective_dsn("dbname=u0", &creds("app", Some("s3cret"))),
            "dbname=u0 user=app password=s3cret"
        );
    }

    #[test]
    fn reuses_connection_per_dsn() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        let mut pool = ConnectionPool::new(Box::new(connector.clone()));
        let a = pool.acquire(&cluster(0), 0, &creds("app", None)).unwrap();
        let b = pool.acquire(&cluster(0), 0, &creds("app", None)).unwrap();
        let c = pool.acquire(&cluster(0), 0, &creds("other", None)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(connector.connects().len(), 2);
        assert_eq!(pool.stats().total_reused, 1);
        assert_eq!(pool.get_mut(&a).unwrap().node(), 0);
    }

    #[test]
    fn expired_connection_is_rebuilt() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        let mut pool = ConnectionPool::new(Box::new(connector.clone()));
        let key = pool.acquire(&cluster(10), 1, &creds("app", None)).unwrap();
        pool.backdate(&key, Duration::from_secs(11));
        pool.acquire(&cluster(10), 1, &creds("app", None)).unwrap();
        assert_eq!(connector.connects().len(), 2);
        assert_eq!(pool.stats().total_expired, 1);
        assert!(pool.get_mut(&key).unwrap().age() < Duration::from_secs(10));
    }

    #[test]
    fn connection_in_transaction_outlives_its_lifetime() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        let mut pool = ConnectionPool::new(Box::new(connector.clone()));
        let key = pool.acquire(&cluster(10), 0, &creds("app", None)).unwrap();
        pool.get_mut(&key).unwrap().set_depth(1);
        pool.backdate(&key, Duration::from_secs(11));

        pool.acquire(&cluster(10), 0, &creds("app", None)).unwrap();
        assert_eq!(connector.connects().len(), 1);
        assert_eq!(pool.get_mut(&key).unwrap().depth(), 1);
        assert_eq!(pool.stats().total_expired, 0);

        pool.get_mut(&key).unwrap().set_depth(0);
        pool.acquire(&cluster(10), 0, &creds("app", None)).unwrap();
        assert_eq!(connector.connects().len(), 2);
        assert_eq!(pool.stats().total_expired, 1);
    }

    #[test]
    fn unlimited_lifetime_never_expires() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        let mut pool = ConnectionPool::new(Box::new(connector.clone()));
        let key = pool.acquire(&cluster(0), 0, &creds("app", None)).unwrap();
        pool.backdate(&key, Duration::from_secs(3600));
        pool.acquire(&cluster(0), 0, &creds("app", None)).unwrap();
        assert_eq!(connector.connects().len(), 1);
    }

    #[test]
    fn connect_failure_leaves_nothing_behind() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        connector.refuse("dbname=u1");
        let mut pool = ConnectionPool::new(Box::new(connector));
        let err = pool.acquire(&cluster(0), 1, &creds("app", Some("pw"))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed connect to 'dbname=u1 user=app' (cluster users, node 1): connection refused"
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_purges() {
        let connector = MemoryConnector::new(|_, _| vec![]);
        let mut pool = ConnectionPool::new(Box::new(connector));
        let key = pool.acquire(&cluster(0), 0, &creds("app", None)).unwrap();
        assert!(pool.remove(&key).is_some());
        assert!(pool.get_mut(&key).is_err());
        assert_eq!(pool.stats().total_purged, 1);
    }
}
