//! Node transports. [`tcp`] speaks the PostgreSQL v3 protocol over TCP;
//! [`memory`] answers from an in-process handler.

pub mod memory;
pub mod pgwire;
pub mod tcp;

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{RemoteError, Result, RouteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Done,
    Pending,
}

/// A parameterized statement ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
    pub sql: String,
    /// Type oids of the parameters.
    pub param_types: Vec<u32>,
    pub params: Vec<Option<Bytes>>,
    /// Binary format for both parameters and results.
    pub binary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

impl RowSet {
    /// A one-column row set; handy for handlers and tests.
    pub fn single_column<I, B>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Option<B>>,
        B: Into<Bytes>,
    {
        Self {
            columns: vec![column.to_string()],
            rows: values.into_iter().map(|v| vec![v.map(Into::into)]).collect(),
        }
    }
}

/// One result of a statement, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResult {
    Rows(RowSet),
    Command(String),
    Error(RemoteError),
}

/// A non-blocking connection to one node.
///
/// After a send, the caller flushes until [`Flush::Done`], then alternates
/// `consume_input` and `wait` while `is_busy`, then takes results with
/// `next_result` until it yields `None`.
pub trait RemoteConnection {
    fn send_query(&mut self, query: &RemoteQuery) -> Result<()>;
    fn send_simple(&mut self, sql: &str) -> Result<()>;
    fn flush(&mut self) -> Result<Flush>;
    fn consume_input(&mut self) -> Result<()>;
    /// True while the next result is not yet available.
    fn is_busy(&self) -> bool;
    fn next_result(&mut self) -> Option<RemoteResult>;
    /// Blocks until the interest is ready or `timeout` passes.
    fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<()>;
    /// Asks the node to cancel the running statement.
    fn request_cancel(&mut self) -> Result<()>;
}

pub trait Connector {
    fn connect(&self, dsn: &str) -> Result<Box<dyn RemoteConnection>>;
}

/// Parses a `key=value` connection string. Values may be single-quoted,
/// with `\'` and `\\` escapes.
pub fn parse_conninfo(dsn: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let chars: Vec<char> = dsn.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[start..i].iter().collect();
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if chars.get(i) != Some(&'=') {
            return Err(RouteError::Connection(format!(
                "missing \"=\" after \"{key}\" in connection info string"
            )));
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }

        let mut value = String::new();
        if chars.get(i) == Some(&'\'') {
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(RouteError::Connection(
                            "unterminated quoted string in connection info string".to_string(),
                        ))
                    }
                    Some('\\') if i + 1 < chars.len() => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(c) => {
                        value.push(*c);
                        i += 1;
                    }
                }
            }
        } else {
            while i < chars.len() && !chars[i].is_whitespace() {
                value.push(chars[i]);
                i += 1;
            }
        }
        out.insert(key, value);
    }

    Ok(out)
}

/// Quotes a conninfo value when it holds spaces, quotes or backslashes.
pub fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
