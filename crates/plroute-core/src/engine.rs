//! Per-call entry point.
//!
//! [`Engine`] owns the caches, the connection pool and the transaction
//! coordinator. It is single-threaded and uses `RefCell`s internally; no
//! borrow is held while the host's [`LocalExecutor`] runs or between row
//! pulls, so a hash query may call back into the same engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::StampedCache;
use crate::catalog::{Catalog, ColumnDef, FunctionId, LocalExecutor, ServerDef};
use crate::cluster::Cluster;
use crate::config::EngineConfig;
use crate::error::{Result, RouteError};
use crate::executor::{self, ExecContext};
use crate::function::CompiledFunction;
use crate::pool::{ConnectionPool, Credentials, PoolStats};
use crate::reactor::Reactor;
use crate::routing::{self, Targets};
use crate::transport::tcp::PgConnector;
use crate::transport::{Connector, RemoteQuery, RowSet};
use crate::txn::{SubXactEvent, TxnCoordinator, XactEvent};
use crate::types::{TypeId, TypeInfo, Value};

/// One invocation of a routing function.
#[derive(Debug, Clone)]
pub struct Call {
    pub function: FunctionId,
    pub args: Vec<Option<Value>>,
    /// Client transaction nesting level: 1 at top level, +1 per open
    /// subtransaction.
    pub nest_level: u32,
    /// Column definition list for functions returning untyped `record`.
    pub record_columns: Option<Vec<ColumnDef>>,
    pub interrupt: CancellationToken,
}

impl Call {
    pub fn new(function: FunctionId, args: Vec<Option<Value>>) -> Self {
        Self {
            function,
            args,
            nest_level: 1,
            record_columns: None,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn with_nest_level(mut self, level: u32) -> Self {
        self.nest_level = level;
        self
    }

    pub fn with_record_columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.record_columns = Some(columns);
        self
    }

    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }
}

#[derive(Debug)]
pub enum CallOutput<'e> {
    Value(Option<Value>),
    Rows(RowStream<'e>),
}

/// A resolved cluster and the server entry it was built from.
#[derive(Debug)]
struct ClusterEntry {
    cluster: Cluster,
    server: ServerDef,
}

pub struct Engine {
    config: EngineConfig,
    catalog: Rc<dyn Catalog>,
    local: Rc<dyn LocalExecutor>,
    functions: RefCell<StampedCache<FunctionId, Rc<CompiledFunction>>>,
    types: RefCell<StampedCache<TypeId, TypeInfo>>,
    clusters: RefCell<HashMap<String, Rc<ClusterEntry>>>,
    pool: RefCell<ConnectionPool>,
    txn: RefCell<TxnCoordinator>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("functions", &self.functions.borrow().len())
            .field("clusters", &self.clusters.borrow().len())
            .field("connections", &self.pool.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: Rc<dyn Catalog>,
        local: Rc<dyn LocalExecutor>,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            local,
            functions: RefCell::new(StampedCache::new("function")),
            types: RefCell::new(StampedCache::new("type")),
            clusters: RefCell::new(HashMap::new()),
            pool: RefCell::new(ConnectionPool::new(connector)),
            txn: RefCell::new(TxnCoordinator::new()),
        })
    }

    /// Engine talking to real nodes over TCP.
    pub fn with_tcp(config: EngineConfig, catalog: Rc<dyn Catalog>, local: Rc<dyn LocalExecutor>) -> Result<Self> {
        let reactor = Rc::new(Reactor::new()?);
        let connector = PgConnector::new(reactor, &config.application_name, config.connect_timeout());
        Self::new(config, catalog, local, Box::new(connector))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn call(&self, call: &Call) -> Result<CallOutput<'_>> {
        let function = self.compiled_function(call.function)?;
        let cluster = self.cluster(&function.cluster)?;
        let credentials = self.credentials(&cluster)?;
        let query = function.remote_query(&call.args, call.record_columns.as_deref())?;
        let targets = routing::select_targets(&function, &cluster.cluster, &call.args, self.local.as_ref())?;
        debug!(function = %function.name, policy = function.policy.name(), ?targets, "routing call");

        if function.returns_set {
            let stream = RowStream {
                engine: self,
                function,
                cluster,
                credentials,
                query,
                nest_level: call.nest_level,
                interrupt: call.interrupt.clone(),
                rows: Vec::new().into_iter(),
                node: None,
                remaining: targets.nodes().into_iter(),
            };
            return stream.start().map(CallOutput::Rows);
        }

        let cx = ExecContext {
            poll_interval: self.config.poll_interval(),
            interrupt: &call.interrupt,
        };
        // coalesce stops at the first non-null value; otherwise every target
        // runs and the first node's value is returned
        let coalesce = matches!(targets, Targets::Sequential { coalesce: true, .. });
        let mut value = None;
        for (i, node) in targets.nodes().into_iter().enumerate() {
            let rows = self.run_on_node(&cluster.cluster, &credentials, node, &query, call.nest_level, &cx)?;
            let node_value = first_value(&function, &rows)?;
            if coalesce {
                if node_value.is_some() {
                    value = node_value;
                    break;
                }
            } else if i == 0 {
                value = node_value;
            }
        }
        Ok(CallOutput::Value(value))
    }

    /// Compiles a function without touching the caches.
    pub fn validate(&self, id: FunctionId) -> Result<CompiledFunction> {
        let def = self.catalog.function(id)?;
        CompiledFunction::compile(&def, |t| self.catalog.type_info(t))
    }

    /// Cached compiled form of `id`, rebuilt when its stamps changed.
    pub fn compiled_function(&self, id: FunctionId) -> Result<Rc<CompiledFunction>> {
        let def = self.catalog.function(id)?;
        let catalog = self.catalog.as_ref();
        if let Some(function) = self
            .functions
            .borrow_mut()
            .lookup(&id, |f, _| f.is_fresh(&def, catalog))
        {
            return Ok(function);
        }

        self.functions.borrow_mut().begin_build(&id)?;
        let built = CompiledFunction::compile(&def, |t| self.type_info(t));
        self.functions.borrow_mut().end_build(&id);
        let function = Rc::new(built?);
        debug!(function = %function.name, policy = function.policy.name(), binary = function.binary, "compiled routing function");
        self.functions
            .borrow_mut()
            .insert(id, Rc::clone(&function), def.stamp)?;
        Ok(function)
    }

    fn type_info(&self, id: TypeId) -> Result<TypeInfo> {
        let catalog = self.catalog.as_ref();
        if let Some(info) = self
            .types
            .borrow_mut()
            .lookup(&id, |_, stamp| catalog.type_stamp(id).is_ok_and(|s| s == stamp))
        {
            return Ok(info);
        }
        let info = catalog.type_info(id)?;
        self.types.borrow_mut().insert(id, info.clone(), info.stamp)?;
        Ok(info)
    }

    fn cluster(&self, name: &str) -> Result<Rc<ClusterEntry>> {
        if let Some(entry) = self.clusters.borrow().get(name) {
            return Ok(Rc::clone(entry));
        }
        let server = self
            .catalog
            .server(name)?
            .ok_or_else(|| RouteError::Catalog(format!("cluster ({name}) not found")))?;
        let cluster = Cluster::from_server(&server, self.config.max_nodes)?;
        debug!(cluster = %cluster.name, nodes = cluster.node_count(), isolation = %cluster.isolation_level, "resolved cluster");

        let entry = Rc::new(ClusterEntry { cluster, server });
        self.clusters
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&entry));
        Ok(entry)
    }

    /// The session user's credentials for a cluster, read on every call.
    fn credentials(&self, entry: &ClusterEntry) -> Result<Credentials> {
        let mapping = self.catalog.user_mapping(&entry.server)?;
        Ok(Credentials::from_mapping(&mapping, &self.catalog.current_user()))
    }

    /// Forgets a cached cluster; the next call re-reads its options.
    pub fn invalidate_cluster(&self, name: &str) -> bool {
        self.clusters.borrow_mut().remove(name).is_some()
    }

    fn run_on_node(
        &self,
        cluster: &Cluster,
        credentials: &Credentials,
        node: usize,
        query: &RemoteQuery,
        nest_level: u32,
        cx: &ExecContext<'_>,
    ) -> Result<RowSet> {
        let mut pool = self.pool.borrow_mut();
        let key = pool.acquire(cluster, node, credentials)?;
        let conn = pool.get_mut(&key)?;
        // a half-applied begin leaves the remote depth unknown
        if let Err(e) = self.txn.borrow_mut().begin_remote(conn, nest_level, cx) {
            pool.remove(&key);
            return Err(e);
        }
        let result = pool
            .get_mut(&key)
            .and_then(|conn| executor::fetch_rows(conn.transport(), query, cx));
        if let Err(e) = &result {
            if e.purges_connection() {
                pool.remove(&key);
            }
        }
        result
    }

    pub fn on_xact(&self, event: XactEvent) -> Result<()> {
        let token = CancellationToken::new();
        let cx = ExecContext {
            poll_interval: self.config.poll_interval(),
            interrupt: &token,
        };
        self.txn
            .borrow_mut()
            .on_xact(&mut self.pool.borrow_mut(), event, &cx)
    }

    pub fn on_subxact(&self, event: SubXactEvent, level: u32) -> Result<()> {
        let token = CancellationToken::new();
        let cx = ExecContext {
            poll_interval: self.config.poll_interval(),
            interrupt: &token,
        };
        self.txn
            .borrow_mut()
            .on_subxact(&mut self.pool.borrow_mut(), event, level, &cx)
    }

    /// Whether the current client transaction touched any node.
    pub fn in_remote_transaction(&self) -> bool {
        self.txn.borrow().is_registered()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.borrow().stats()
    }

    /// Remote depth of every pooled connection, as `(cluster, node, depth)`.
    pub fn connection_depths(&self) -> Vec<(String, usize, u32)> {
        self.pool
            .borrow()
            .connections()
            .map(|c| (c.cluster().to_string(), c.node(), c.depth()))
            .collect()
    }
}

fn first_value(function: &CompiledFunction, rows: &RowSet) -> Result<Option<Value>> {
    match rows.rows.first() {
        Some(row) => function.decode(row.first().and_then(Option::as_ref)),
        None => Ok(None),
    }
}

/// Rows of a set-returning call, decoded one per pull. Multi-node calls
/// move to the next node once the current one is exhausted.
pub struct RowStream<'e> {
    engine: &'e Engine,
    function: Rc<CompiledFunction>,
    cluster: Rc<ClusterEntry>,
    credentials: Credentials,
    query: RemoteQuery,
    nest_level: u32,
    interrupt: CancellationToken,
    rows: std::vec::IntoIter<Vec<Option<bytes::Bytes>>>,
    node: Option<usize>,
    remaining: std::vec::IntoIter<usize>,
}

impl std::fmt::Debug for RowStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("function", &self.function.name)
            .field("node", &self.node)
            .field("buffered", &self.rows.len())
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

impl<'e> RowStream<'e> {
    fn start(mut self) -> Result<Self> {
        self.fetch_next_node()?;
        Ok(self)
    }

    /// Node whose rows are being returned.
    pub fn node(&self) -> Option<usize> {
        self.node
    }

    /// Loads the next node's rows; false when no node is left.
    fn fetch_next_node(&mut self) -> Result<bool> {
        let Some(node) = self.remaining.next() else {
            return Ok(false);
        };
        let cx = ExecContext {
            poll_interval: self.engine.config.poll_interval(),
            interrupt: &self.interrupt,
        };
        let set = self
            .engine
            .run_on_node(&self.cluster.cluster, &self.credentials, node, &self.query, self.nest_level, &cx)?;
        debug!(function = %self.function.name, node, rows = set.rows.len(), "node rows fetched");
        self.node = Some(node);
        self.rows = set.rows.into_iter();
        Ok(true)
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Option<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.rows.next() {
                return Some(self.function.decode(row.first().and_then(Option::as_ref)));
            }
            match self.fetch_next_node() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.remaining = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ArgDef, FunctionDef, MemoryCatalog, NoLocalQueries, ServerDef, Stamp, Volatility};
    use crate::transport::memory::MemoryConnector;
    use crate::transport::{RemoteResult, RowSet};

    fn setup(body: &str) -> (Rc<MemoryCatalog>, MemoryConnector, Engine) {
        let catalog = Rc::new(MemoryCatalog::new("app"));
        catalog.put_server(ServerDef {
            id: 1,
            name: "users".into(),
            options: vec![
                ("node_0".into(), "dbname=u0".into()),
                ("node_1".into(), "dbname=u1".into()),
            ],
        });
        catalog.put_function(FunctionDef {
            id: FunctionId(7),
            schema: "public".into(),
            name: "get_name".into(),
            body: body.into(),
            args: vec![ArgDef::new("uid", TypeId::INT4)],
            return_type: TypeId::TEXT,
            returns_set: false,
            volatility: Volatility::Volatile,
            stamp: Stamp::new(1, 0, 1),
        });
        let connector = MemoryConnector::new(|dsn, _| {
            let name = if dsn.contains("u0") { "zero" } else { "one" };
            vec![RemoteResult::Rows(RowSet::single_column("get_name", [Some(name)]))]
        });
        let engine = Engine::new(
            EngineConfig::default(),
            catalog.clone(),
            Rc::new(NoLocalQueries),
            Box::new(connector.clone()),
        )
        .unwrap();
        (catalog, connector, engine)
    }

    fn scalar(engine: &Engine, call: &Call) -> Result<Option<Value>> {
        match engine.call(call)? {
            CallOutput::Value(v) => Ok(v),
            CallOutput::Rows(_) => panic!("expected a scalar result"),
        }
    }

    #[test]
    fn routes_by_argument() {
        let (_, connector, engine) = setup("cluster users; run on uid;");
        let v = scalar(&engine, &Call::new(FunctionId(7), vec![Some(Value::Int4(1))])).unwrap();
        assert_eq!(v, Some(Value::Text("one".into())));
        assert_eq!(
            connector.statements_for("u1"),
            vec![
                "start transaction isolation level read committed;",
                "select public.get_name($1)"
            ]
        );
        assert!(engine.in_remote_transaction());
    }

    #[test]
    fn session_user_is_read_on_every_call() {
        let (catalog, connector, engine) = setup("cluster users; run on 0;");
        catalog.set_current_user("alice");
        scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap();
        catalog.set_current_user("bob");
        scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap();
        assert_eq!(connector.connects(), vec!["dbname=u0 user=alice", "dbname=u0 user=bob"]);
        assert_eq!(connector.statements_for("user=bob").last().map(String::as_str), Some("select public.get_name($1)"));

        catalog.put_user_mapping("users", vec![("user".into(), "router".into())]);
        scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap();
        assert_eq!(connector.connects().last().map(String::as_str), Some("dbname=u0 user=router"));
    }

    #[test]
    fn compiled_function_is_reused_until_stale() {
        let (catalog, _, engine) = setup("cluster users; run on 0;");
        let a = engine.compiled_function(FunctionId(7)).unwrap();
        let b = engine.compiled_function(FunctionId(7)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));

        let mut def = catalog.function(FunctionId(7)).unwrap();
        def.body = "cluster users; run on 1;".into();
        def.stamp = Stamp::new(2, 0, 1);
        catalog.put_function(def);
        let c = engine.compiled_function(FunctionId(7)).unwrap();
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(c.policy, crate::routing::RoutingPolicy::Node(1));
    }

    #[test]
    fn validate_does_not_cache() {
        let (_, _, engine) = setup("cluster users; run on 0;");
        engine.validate(FunctionId(7)).unwrap();
        assert_eq!(engine.functions.borrow().len(), 0);
    }

    #[test]
    fn unknown_cluster() {
        let (_, connector, engine) = setup("cluster nowhere; run on 0;");
        let err = scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap_err();
        assert_eq!(err.to_string(), "catalog error: cluster (nowhere) not found");
        assert!(connector.connects().is_empty());
    }

    #[test]
    fn cluster_cache_invalidation() {
        let (catalog, _, engine) = setup("cluster users; run on 1;");
        scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap();
        catalog.put_server(ServerDef {
            id: 1,
            name: "users".into(),
            options: vec![("node_0".into(), "dbname=u0".into())],
        });
        // cached cluster still has two nodes
        assert!(scalar(&engine, &Call::new(FunctionId(7), vec![None])).is_ok());
        assert!(engine.invalidate_cluster("users"));
        let err = scalar(&engine, &Call::new(FunctionId(7), vec![None])).unwrap_err();
        assert_eq!(err.to_string(), "node 1 is out of range for cluster users (1 nodes)");
    }
}
