//! Node selection.

use crate::catalog::{BoundParam, LocalExecutor};
use crate::cluster::Cluster;
use crate::compiler::Query;
use crate::error::{Result, RouteError};
use crate::function::CompiledFunction;
use crate::types::Value;

/// How a function picks its target node(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// The integer result of a query run locally.
    Hash(Query),
    /// A fixed node number.
    Node(i64),
    /// The value of an int2/int4/int8 argument.
    ArgNode(usize),
    Any,
    /// Every node in order; rows are concatenated.
    All,
    /// Every node in order until one returns a non-null value.
    AllCoalesce,
}

impl RoutingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hash(_) => "hash",
            Self::Node(_) => "node",
            Self::ArgNode(_) => "argument",
            Self::Any => "any",
            Self::All => "all",
            Self::AllCoalesce => "all coalesce",
        }
    }
}

/// Nodes a call runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targets {
    Single(usize),
    /// Nodes `0..count` in ascending order.
    Sequential { count: usize, coalesce: bool },
}

impl Targets {
    pub fn nodes(&self) -> Vec<usize> {
        match *self {
            Targets::Single(n) => vec![n],
            Targets::Sequential { count, .. } => (0..count).collect(),
        }
    }
}

/// Resolves the target nodes for one call. Every node number is
/// bounds-checked here, before any connection is made.
pub fn select_targets(
    function: &CompiledFunction,
    cluster: &Cluster,
    args: &[Option<Value>],
    local: &dyn LocalExecutor,
) -> Result<Targets> {
    function.check_arity(args)?;
    let targets = match &function.policy {
        RoutingPolicy::Node(n) => Targets::Single(cluster.check_node(*n)?),
        RoutingPolicy::ArgNode(idx) => {
            let node = match &args[*idx] {
                None => {
                    return Err(RouteError::NodeResolution(
                        "node number argument is null".to_string(),
                    ))
                }
                Some(value) => value.as_i64().ok_or_else(|| {
                    RouteError::Type(format!(
                        "node number argument must be an integer, got {}",
                        value.kind()
                    ))
                })?,
            };
            Targets::Single(cluster.check_node(node)?)
        }
        RoutingPolicy::Hash(query) => {
            let params: Vec<BoundParam<'_>> = query
                .arg_indexes
                .iter()
                .map(|&i| BoundParam {
                    type_id: function.arg_types[i].id,
                    value: args[i].as_ref(),
                })
                .collect();
            let node = match local.query_scalar(&query.sql, &params)? {
                None => {
                    return Err(RouteError::NodeResolution(
                        "hash query returned null".to_string(),
                    ))
                }
                Some(value) => value.as_i64().ok_or_else(|| {
                    RouteError::NodeResolution(format!(
                        "hash query must return an integer, got {}",
                        value.kind()
                    ))
                })?,
            };
            Targets::Single(cluster.check_node(node)?)
        }
        RoutingPolicy::Any => {
            if cluster.node_count() == 0 {
                return Err(RouteError::NodeResolution(format!(
                    "cluster {} has no nodes",
                    cluster.name
                )));
            }
            Targets::Single(fastrand::usize(..cluster.node_count()))
        }
        RoutingPolicy::All => Targets::Sequential {
            count: cluster.node_count(),
            coalesce: false,
        },
        RoutingPolicy::AllCoalesce => Targets::Sequential {
            count: cluster.node_count(),
            coalesce: true,
        },
    };
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ArgDef, Catalog, FunctionDef, FunctionId, MemoryCatalog, NoLocalQueries, Stamp, Volatility};
    use crate::cluster::IsolationLevel;
    use crate::types::TypeId;
    use std::cell::RefCell;

    struct FixedHash {
        result: Option<Value>,
        seen: RefCell<Vec<(String, usize)>>,
    }

    impl LocalExecutor for FixedHash {
        fn query_scalar(&self, sql: &str, params: &[BoundParam<'_>]) -> Result<Option<Value>> {
            self.seen.borrow_mut().push((sql.to_string(), params.len()));
            Ok(self.result.clone())
        }
    }

    fn cluster(nodes: usize) -> Cluster {
        Cluster {
            id: 1,
            name: "users".into(),
            nodes: (0..nodes).map(|i| format!("dbname=u{i}")).collect(),
            isolation_level: IsolationLevel::ReadCommitted,
            connection_lifetime: 0,
        }
    }

    fn function(body: &str, arg_type: TypeId) -> CompiledFunction {
        let catalog = MemoryCatalog::new("app");
        let def = FunctionDef {
            id: FunctionId(1),
            schema: "public".into(),
            name: "f".into(),
            body: body.into(),
            args: vec![ArgDef::new("key", arg_type)],
            return_type: TypeId::TEXT,
            returns_set: body.contains("all;"),
            volatility: Volatility::Volatile,
            stamp: Stamp::default(),
        };
        CompiledFunction::compile(&def, |id| catalog.type_info(id)).unwrap()
    }

    #[test]
    fn fixed_node_in_and_out_of_range() {
        let f = function("cluster users; run on 2;", TypeId::INT4);
        let args = [Some(Value::Int4(0))];
        assert_eq!(select_targets(&f, &cluster(3), &args, &NoLocalQueries).unwrap(), Targets::Single(2));
        let err = select_targets(&f, &cluster(2), &args, &NoLocalQueries).unwrap_err();
        assert_eq!(err.to_string(), "node 2 is out of range for cluster users (2 nodes)");
    }

    #[test]
    fn argument_node() {
        let f = function("cluster users; run on key;", TypeId::INT8);
        assert_eq!(
            select_targets(&f, &cluster(4), &[Some(Value::Int8(3))], &NoLocalQueries).unwrap(),
            Targets::Single(3)
        );
        let err = select_targets(&f, &cluster(4), &[None], &NoLocalQueries).unwrap_err();
        assert_eq!(err.to_string(), "node number argument is null");
        assert!(select_targets(&f, &cluster(4), &[Some(Value::Int8(4))], &NoLocalQueries).is_err());
    }

    #[test]
    fn hash_result_is_bounds_checked() {
        let f = function("cluster users; run on hashtext(key);", TypeId::TEXT);
        let local = FixedHash {
            result: Some(Value::Int4(4)),
            seen: RefCell::new(Vec::new()),
        };
        let args = [Some(Value::Text("alice".into()))];
        let err = select_targets(&f, &cluster(3), &args, &local).unwrap_err();
        assert!(matches!(err, RouteError::NodeResolution(_)));
        assert_eq!(local.seen.borrow()[0], ("select hashtext($1)".to_string(), 1));

        let local = FixedHash {
            result: Some(Value::Int4(1)),
            seen: RefCell::new(Vec::new()),
        };
        assert_eq!(select_targets(&f, &cluster(3), &args, &local).unwrap(), Targets::Single(1));
    }

    #[test]
    fn hash_must_return_integer() {
        let f = function("cluster users; run on hashtext(key);", TypeId::TEXT);
        let args = [Some(Value::Text("alice".into()))];
        for result in [None, Some(Value::Text("1".into()))] {
            let local = FixedHash {
                result,
                seen: RefCell::new(Vec::new()),
            };
            assert!(matches!(
                select_targets(&f, &cluster(3), &args, &local),
                Err(RouteError::NodeResolution(_))
            ));
        }
    }

    #[test]
    fn any_stays_in_range() {
        let f = function("cluster users; run on any;", TypeId::INT4);
        for _ in 0..50 {
            match select_targets(&f, &cluster(3), &[None], &NoLocalQueries).unwrap() {
                Targets::Single(n) => assert!(n < 3),
                other => panic!("unexpected targets {other:?}"),
            }
        }
        assert!(select_targets(&f, &cluster(0), &[None], &NoLocalQueries).is_err());
    }

    #[test]
    fn all_visits_every_node_in_order() {
        let f = function("cluster users; run on all;", TypeId::INT4);
        let targets = select_targets(&f, &cluster(3), &[None], &NoLocalQueries).unwrap();
        assert_eq!(targets.nodes(), vec![0, 1, 2]);
    }
}
