use std::rc::Rc;

use tokio_util::sync::CancellationToken;

use plroute::catalog::{ArgDef, NoLocalQueries, Stamp, Volatility};
use plroute::error::RemoteError;
use plroute::transport::memory::MemoryConnector;
use plroute::transport::{RemoteResult, RowSet};
use plroute::{
    Call, CallOutput, Engine, EngineConfig, FunctionDef, FunctionId, MemoryCatalog, Result, RouteError,
    ServerDef, SubXactEvent, TypeId, Value, XactEvent,
};

fn setup(extra_options: &[(&str, &str)]) -> (MemoryConnector, Engine) {
    let catalog = Rc::new(MemoryCatalog::new("app"));
    let mut options: Vec<(String, String)> = (0..2)
        .map(|i| (format!("node_{i}"), format!("dbname=n{i}")))
        .collect();
    options.extend(extra_options.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    catalog.put_server(ServerDef {
        id: 1,
        name: "c".into(),
        options,
    });
    catalog.put_function(FunctionDef {
        id: FunctionId(1),
        schema: "public".into(),
        name: "touch".into(),
        body: "cluster c; run on part;".into(),
        args: vec![ArgDef::new("part", TypeId::INT4)],
        return_type: TypeId::TEXT,
        returns_set: false,
        volatility: Volatility::Volatile,
        stamp: Stamp::new(1, 0, 1),
    });
    let connector = MemoryConnector::new(|_, _| {
        vec![RemoteResult::Rows(RowSet::single_column("touch", [Some("ok")]))]
    });
    let engine = Engine::new(
        EngineConfig::default(),
        catalog,
        Rc::new(NoLocalQueries),
        Box::new(connector.clone()),
    )
    .unwrap();
    (connector, engine)
}

fn touch(engine: &Engine, node: i32, level: u32) -> Result<Option<Value>> {
    let call = Call::new(FunctionId(1), vec![Some(Value::Int4(node))]).with_nest_level(level);
    match engine.call(&call)? {
        CallOutput::Value(v) => Ok(v),
        CallOutput::Rows(_) => panic!("expected a scalar result"),
    }
}

fn depths(engine: &Engine) -> Vec<(usize, u32)> {
    let mut d: Vec<_> = engine
        .connection_depths()
        .into_iter()
        .map(|(_, node, depth)| (node, depth))
        .collect();
    d.sort_unstable();
    d
}

#[test]
fn nested_rollback_reaches_only_deep_connections() {
    let (connector, engine) = setup(&[]);
    touch(&engine, 0, 2).unwrap();
    touch(&engine, 1, 1).unwrap();
    assert_eq!(depths(&engine), vec![(0, 2), (1, 1)]);
    assert_eq!(
        connector.statements_for("dbname=n0")[0],
        "start transaction isolation level read committed;savepoint s2; "
    );
    connector.clear_log();

    engine.on_subxact(SubXactEvent::Abort, 2).unwrap();
    assert_eq!(
        connector.statements_for("dbname=n0"),
        vec!["rollback to savepoint s2; release savepoint s2;"]
    );
    assert!(connector.statements_for("dbname=n1").is_empty());
    assert_eq!(depths(&engine), vec![(0, 1), (1, 1)]);
}

#[test]
fn deeper_nesting_adds_savepoints_incrementally() {
    let (connector, engine) = setup(&[]);
    touch(&engine, 0, 1).unwrap();
    touch(&engine, 0, 3).unwrap();
    let sent = connector.statements_for("dbname=n0");
    assert_eq!(sent[2], "savepoint s2; savepoint s3; ");

    engine.on_subxact(SubXactEvent::Commit, 3).unwrap();
    engine.on_subxact(SubXactEvent::Commit, 2).unwrap();
    assert_eq!(depths(&engine), vec![(0, 1)]);
    engine.on_xact(XactEvent::PreCommit).unwrap();
    assert_eq!(depths(&engine), vec![(0, 0)]);
    assert_eq!(
        connector.statements_for("dbname=n0").last().map(String::as_str),
        Some("commit;")
    );
    assert!(!engine.in_remote_transaction());
}

#[test]
fn skipped_subtransaction_cleanup_is_fatal() {
    let (_, engine) = setup(&[]);
    touch(&engine, 0, 3).unwrap();
    let err = engine.on_subxact(SubXactEvent::Commit, 2).unwrap_err();
    assert!(matches!(err, RouteError::Transaction(_)));
    assert!(err.to_string().contains("missed cleaning up remote subtransaction at level 2"));
}

#[test]
fn abort_rolls_back_every_touched_node() {
    let (connector, engine) = setup(&[]);
    touch(&engine, 0, 1).unwrap();
    touch(&engine, 1, 1).unwrap();
    connector.clear_log();
    engine.on_xact(XactEvent::Abort).unwrap();
    for node in ["dbname=n0", "dbname=n1"] {
        assert_eq!(connector.statements_for(node), vec!["rollback;"]);
    }
    // the next transaction starts afresh
    touch(&engine, 0, 1).unwrap();
    assert_eq!(
        connector.statements_for("dbname=n0")[1],
        "start transaction isolation level read committed;"
    );
}

#[test]
fn auto_commit_cluster_sends_no_transaction_control() {
    let (connector, engine) = setup(&[("isolation_level", "auto commit")]);
    touch(&engine, 1, 2).unwrap();
    assert_eq!(connector.statements_for("dbname=n1"), vec!["select public.touch($1)"]);
    assert!(!engine.in_remote_transaction());
    engine.on_xact(XactEvent::PreCommit).unwrap();
    assert_eq!(connector.log().len(), 1);
}

#[test]
fn read_only_isolation_level() {
    let (connector, engine) = setup(&[("isolation_level", "Read Committed Read Only")]);
    touch(&engine, 0, 1).unwrap();
    assert_eq!(
        connector.statements_for("dbname=n0")[0],
        "start transaction isolation level read committed read only;"
    );
}

#[test]
fn prepare_with_remote_work_is_refused() {
    let (_, engine) = setup(&[]);
    engine.on_xact(XactEvent::PrePrepare).unwrap();
    touch(&engine, 0, 1).unwrap();
    let err = engine.on_xact(XactEvent::PrePrepare).unwrap_err();
    assert_eq!(
        err.to_string(),
        "transaction error: cannot prepare a transaction that modified remote tables"
    );
}

#[test]
fn failed_commit_is_reported_after_reset() {
    let (connector, engine) = setup(&[]);
    touch(&engine, 0, 1).unwrap();
    touch(&engine, 1, 1).unwrap();
    connector.fail_simple("dbname=n0", "commit");
    let err = engine.on_xact(XactEvent::PreCommit).unwrap_err();
    match err {
        RouteError::Remote(e) => assert_eq!(e.sqlstate(), "25P02"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(depths(&engine), vec![(1, 0)]);
    assert_eq!(engine.pool_stats().total_purged, 1);
}

#[test]
fn remote_error_purges_connection_and_keeps_fields() {
    let remote = RemoteError {
        code: Some("23505".into()),
        message: "duplicate key value violates unique constraint".into(),
        detail: Some("Key (id)=(1) already exists.".into()),
        hint: None,
        context: Some("SQL function \"touch\"".into()),
    };
    let expected = remote.clone();
    let catalog = Rc::new(MemoryCatalog::new("app"));
    catalog.put_server(ServerDef {
        id: 1,
        name: "c".into(),
        options: vec![("node_0".into(), "dbname=n0".into())],
    });
    catalog.put_function(FunctionDef {
        id: FunctionId(1),
        schema: "public".into(),
        name: "touch".into(),
        body: "cluster c; run on 0;".into(),
        args: vec![],
        return_type: TypeId::TEXT,
        returns_set: false,
        volatility: Volatility::Volatile,
        stamp: Stamp::default(),
    });
    let connector = MemoryConnector::new(move |_, _| vec![RemoteResult::Error(remote.clone())]);
    let engine = Engine::new(
        EngineConfig::default(),
        catalog,
        Rc::new(NoLocalQueries),
        Box::new(connector.clone()),
    )
    .unwrap();

    let err = engine.call(&Call::new(FunctionId(1), vec![])).unwrap_err();
    match err {
        RouteError::Remote(e) => assert_eq!(e, expected),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.pool_stats().total_connections, 0);
    assert_eq!(engine.pool_stats().total_purged, 1);

    let _ = engine.call(&Call::new(FunctionId(1), vec![]));
    assert_eq!(connector.connects().len(), 2);
}

#[test]
fn interrupted_call_leaves_connection_idle() {
    let (connector, engine) = setup(&[]);
    connector.stall("dbname=n1");
    let token = CancellationToken::new();
    token.cancel();

    let call = Call::new(FunctionId(1), vec![Some(Value::Int4(1))]).with_interrupt(token);
    let err = engine.call(&call).unwrap_err();
    assert!(matches!(err, RouteError::Interrupted));
    assert_eq!(err.to_string(), "canceling statement due to user request");
    assert_eq!(connector.cancel_requests(), 1);
    assert_eq!(engine.pool_stats().total_connections, 1);

    // the connection takes the rollback without complaint
    engine.on_xact(XactEvent::Abort).unwrap();
    assert_eq!(
        connector.statements_for("dbname=n1").last().map(String::as_str),
        Some("rollback;")
    );
    assert_eq!(engine.pool_stats().total_purged, 0);
}

#[test]
fn connect_failure_leaves_pool_empty() {
    let (connector, engine) = setup(&[]);
    connector.refuse("dbname=n1");
    let err = touch(&engine, 1, 1).unwrap_err();
    assert!(matches!(err, RouteError::Connection(_)));
    assert_eq!(
        err.to_string(),
        "failed connect to 'dbname=n1 user=app' (cluster c, node 1): connection refused"
    );
    assert_eq!(engine.pool_stats().total_connections, 0);
    assert!(!engine.in_remote_transaction());
}

#[test]
fn interrupted_begin_drops_the_connection() {
    let (connector, engine) = setup(&[]);
    connector.stall_simple("dbname=n0", "start transaction");
    let token = CancellationToken::new();
    token.cancel();

    let call = Call::new(FunctionId(1), vec![Some(Value::Int4(0))]).with_interrupt(token);
    let err = engine.call(&call).unwrap_err();
    assert!(matches!(err, RouteError::Interrupted));
    assert_eq!(
        connector.statements_for("dbname=n0"),
        vec!["start transaction isolation level read committed;"]
    );
    // closing the connection is what ends the half-open remote transaction
    assert_eq!(engine.pool_stats().total_connections, 0);
    assert_eq!(engine.pool_stats().total_purged, 1);

    engine.on_xact(XactEvent::Abort).unwrap();
    touch(&engine, 0, 1).unwrap();
    assert_eq!(connector.connects().len(), 2);
    assert_eq!(depths(&engine), vec![(0, 1)]);
}
