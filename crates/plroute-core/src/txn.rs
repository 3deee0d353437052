//! Keeps node transactions in step with the client transaction.
//!
//! Each connection tracks its remote depth. Before a statement runs on a
//! node, the node is brought up to the client's nesting level with one
//! `start transaction` plus a `savepoint s<n>` per level. Subtransaction and
//! transaction end events are then replayed on every node that reached the
//! level.

use tracing::{debug, warn};

use crate::cluster::IsolationLevel;
use crate::error::{Result, RouteError};
use crate::executor::{self, ExecContext};
use crate::pool::{Connection, ConnectionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactEvent {
    PreCommit,
    Commit,
    Abort,
    PrePrepare,
    Prepare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubXactEvent {
    Commit,
    Abort,
}

/// SQL that raises a connection from `depth` to `client_level`, and the
/// resulting depth. `None` when nothing needs to be sent.
pub fn begin_statements(level: IsolationLevel, depth: u32, client_level: u32) -> (Option<String>, u32) {
    let target = client_level.max(1);
    let mut depth = depth;
    let mut sql = String::new();
    if depth == 0 {
        sql.push_str(&format!("start transaction isolation level {level};"));
        depth = 1;
    }
    while depth < target {
        depth += 1;
        sql.push_str(&format!("savepoint s{depth}; "));
    }
    ((!sql.is_empty()).then_some(sql), depth)
}

#[derive(Debug, Default)]
pub struct TxnCoordinator {
    registered: bool,
}

impl TxnCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any node joined the current client transaction.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Raises `conn` to the client's nesting level. After an error the
    /// remote depth is unknown and the connection must be dropped.
    pub fn begin_remote(&mut self, conn: &mut Connection, client_level: u32, cx: &ExecContext<'_>) -> Result<()> {
        let level = conn.isolation_level();
        if level == IsolationLevel::AutoCommit {
            return Ok(());
        }
        self.registered = true;

        let (sql, depth) = begin_statements(level, conn.depth(), client_level);
        if let Some(sql) = sql {
            debug!(cluster = conn.cluster(), node = conn.node(), %sql, "raising remote transaction depth");
            executor::exec_command(conn.transport(), &sql, cx)?;
            conn.set_depth(depth);
        }
        Ok(())
    }

    /// Replays the end of the subtransaction at nesting `level`.
    pub fn on_subxact(&mut self, pool: &mut ConnectionPool, event: SubXactEvent, level: u32, cx: &ExecContext<'_>) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        if level < 2 {
            return Err(RouteError::Transaction(format!(
                "invalid subtransaction level {level}"
            )));
        }
        if pool.connections().any(|c| c.depth() > level) {
            return Err(RouteError::Transaction(format!(
                "missed cleaning up remote subtransaction at level {level}"
            )));
        }

        let sql = match event {
            SubXactEvent::Commit => format!("release savepoint s{level};"),
            SubXactEvent::Abort => {
                format!("rollback to savepoint s{level}; release savepoint s{level};")
            }
        };

        let mut first_err = None;
        let mut failed = Vec::new();
        for conn in pool.connections_mut().filter(|c| c.depth() == level) {
            debug!(cluster = conn.cluster(), node = conn.node(), %sql, "ending remote subtransaction");
            match executor::exec_command(conn.transport(), &sql, cx) {
                Ok(()) => conn.set_depth(level - 1),
                Err(e) => {
                    failed.push(conn.dsn().to_string());
                    first_err.get_or_insert(e);
                }
            }
        }
        for dsn in failed {
            pool.remove(&dsn);
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn on_xact(&mut self, pool: &mut ConnectionPool, event: XactEvent, cx: &ExecContext<'_>) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        let sql = match event {
            XactEvent::PreCommit => "commit;",
            XactEvent::Abort => "rollback;",
            XactEvent::PrePrepare => {
                return Err(RouteError::Transaction(
                    "cannot prepare a transaction that modified remote tables".to_string(),
                ))
            }
            XactEvent::Commit | XactEvent::Prepare => {
                return Err(RouteError::Transaction(
                    "missed cleaning up connection during pre-commit".to_string(),
                ))
            }
        };

        let mut first_err = None;
        let mut failed = Vec::new();
        for conn in pool.connections_mut().filter(|c| c.depth() > 0) {
            debug!(cluster = conn.cluster(), node = conn.node(), sql, "ending remote transaction");
            let result = executor::exec_command(conn.transport(), sql, cx);
            conn.set_depth(0);
            if let Err(e) = result {
                if event == XactEvent::Abort {
                    warn!(cluster = conn.cluster(), node = conn.node(), error = %e, "remote rollback failed");
                } else {
                    first_err.get_or_insert(e);
                }
                failed.push(conn.dsn().to_string());
            }
        }
        self.registered = false;
        for dsn in failed {
            pool.remove(&dsn);
        }
        first_err.map_or(Ok(()), Err)
    }
}
