//! In-process transport: every node is answered by a handler closure.
//! Used for dry runs and tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use super::{Connector, Flush, Interest, RemoteConnection, RemoteQuery, RemoteResult};
use crate::error::{RemoteError, Result, RouteError};

type Handler = dyn Fn(&str, &RemoteQuery) -> Vec<RemoteResult>;

/// One statement received by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub dsn: String,
    pub sql: String,
    pub params: Vec<Option<Bytes>>,
}

struct Shared {
    handler: Box<Handler>,
    log: Vec<Received>,
    connects: Vec<String>,
    refuse: Vec<String>,
    stall: Vec<String>,
    stall_simple: Vec<(String, String)>,
    fail_simple: Vec<(String, String)>,
    cancels: usize,
}

fn matches_any(dsn: &str, fragments: &[String]) -> bool {
    fragments.iter().any(|f| dsn.contains(f.as_str()))
}

/// Connector whose nodes answer extended queries through a handler.
/// Simple queries (transaction control) are logged and answered with one
/// command result per statement.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Rc<RefCell<Shared>>,
}

impl fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("MemoryConnector")
            .field("statements", &shared.log.len())
            .field("connects", &shared.connects.len())
            .finish()
    }
}

impl MemoryConnector {
    pub fn new(handler: impl Fn(&str, &RemoteQuery) -> Vec<RemoteResult> + 'static) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                handler: Box::new(handler),
                log: Vec::new(),
                connects: Vec::new(),
                refuse: Vec::new(),
                stall: Vec::new(),
                stall_simple: Vec::new(),
                fail_simple: Vec::new(),
                cancels: 0,
            })),
        }
    }

    /// Every statement received so far, in order.
    pub fn log(&self) -> Vec<Received> {
        self.shared.borrow().log.clone()
    }

    /// SQL received by nodes whose DSN contains `fragment`.
    pub fn statements_for(&self, fragment: &str) -> Vec<String> {
        self.shared
            .borrow()
            .log
            .iter()
            .filter(|r| r.dsn.contains(fragment))
            .map(|r| r.sql.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.shared.borrow_mut().log.clear();
    }

    /// DSNs of every connection opened, in order.
    pub fn connects(&self) -> Vec<String> {
        self.shared.borrow().connects.clone()
    }

    pub fn cancel_requests(&self) -> usize {
        self.shared.borrow().cancels
    }

    /// Refuses connections to DSNs containing `fragment`.
    pub fn refuse(&self, fragment: &str) {
        self.shared.borrow_mut().refuse.push(fragment.to_string());
    }

    /// Queries to DSNs containing `fragment` never finish unless cancelled.
    pub fn stall(&self, fragment: &str) {
        self.shared.borrow_mut().stall.push(fragment.to_string());
    }

    /// The next simple query containing `sql` on a DSN containing
    /// `fragment` is applied but stays busy until cancelled.
    pub fn stall_simple(&self, fragment: &str, sql: &str) {
        self.shared
            .borrow_mut()
            .stall_simple
            .push((fragment.to_string(), sql.to_string()));
    }

    /// Simple queries containing `sql` fail on DSNs containing `fragment`.
    pub fn fail_simple(&self, fragment: &str, sql: &str) {
        self.shared
            .borrow_mut()
            .fail_simple
            .push((fragment.to_string(), sql.to_string()));
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, dsn: &str) -> Result<Box<dyn RemoteConnection>> {
        let mut shared = self.shared.borrow_mut();
        if matches_any(dsn, &shared.refuse) {
            return Err(RouteError::Connection("connection refused".to_string()));
        }
        shared.connects.push(dsn.to_string());
        Ok(Box::new(MemoryConnection {
            dsn: dsn.to_string(),
            shared: Rc::clone(&self.shared),
            results: VecDeque::new(),
            in_flight: false,
            stalled: false,
        }))
    }
}

struct MemoryConnection {
    dsn: String,
    shared: Rc<RefCell<Shared>>,
    results: VecDeque<RemoteResult>,
    in_flight: bool,
    stalled: bool,
}

impl MemoryConnection {
    fn start(&mut self) -> Result<()> {
        if self.in_flight {
            return Err(RouteError::Protocol(
                "another command is already in progress".to_string(),
            ));
        }
        self.in_flight = true;
        self.results.clear();
        Ok(())
    }
}

impl RemoteConnection for MemoryConnection {
    fn send_query(&mut self, query: &RemoteQuery) -> Result<()> {
        self.start()?;
        let mut shared = self.shared.borrow_mut();
        shared.log.push(Received {
            dsn: self.dsn.clone(),
            sql: query.sql.clone(),
            params: query.params.clone(),
        });
        if matches_any(&self.dsn, &shared.stall) {
            self.stalled = true;
            return Ok(());
        }
        self.results = (shared.handler)(&self.dsn, query).into();
        Ok(())
    }

    fn send_simple(&mut self, sql: &str) -> Result<()> {
        self.start()?;
        let mut shared = self.shared.borrow_mut();
        shared.log.push(Received {
            dsn: self.dsn.clone(),
            sql: sql.to_string(),
            params: Vec::new(),
        });
        let dsn = self.dsn.as_str();
        if let Some(i) = shared
            .stall_simple
            .iter()
            .position(|(fragment, needle)| dsn.contains(fragment.as_str()) && sql.contains(needle.as_str()))
        {
            shared.stall_simple.remove(i);
            self.stalled = true;
            return Ok(());
        }
        let failing = shared
            .fail_simple
            .iter()
            .any(|(fragment, needle)| self.dsn.contains(fragment.as_str()) && sql.contains(needle.as_str()));
        if failing {
            self.results.push_back(RemoteResult::Error(RemoteError::new(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            )));
            return Ok(());
        }
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let tag = stmt
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            self.results.push_back(RemoteResult::Command(tag));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<Flush> {
        Ok(Flush::Done)
    }

    fn consume_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.stalled
    }

    fn next_result(&mut self) -> Option<RemoteResult> {
        let next = self.results.pop_front();
        if next.is_none() {
            self.in_flight = false;
        }
        next
    }

    fn wait(&mut self, _interest: Interest, timeout: Duration) -> Result<()> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }

    fn request_cancel(&mut self) -> Result<()> {
        self.shared.borrow_mut().cancels += 1;
        if self.stalled {
            self.stalled = false;
            self.results.push_back(RemoteResult::Error(RemoteError::new(
                "57014",
                "canceling statement due to user request",
            )));
        }
        Ok(())
    }
}
