//! Per-statement state machine over a [`RemoteConnection`].
//!
//! ```text
//! Sending -> Flushing -> AwaitingResult <-> Draining -> Done
//! ```
//!
//! Waits are bounded by the poll interval; the interrupt token is checked
//! before every wait. On interrupt the node is asked to cancel and the
//! remaining results are drained, so the connection ends idle.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, RouteError};
use crate::transport::{Flush, Interest, RemoteConnection, RemoteQuery, RemoteResult, RowSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Sending,
    Flushing,
    AwaitingResult,
    Draining,
    Done,
}

/// Settings shared by every statement of one call.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    pub poll_interval: Duration,
    pub interrupt: &'a CancellationToken,
}

#[derive(Clone, Copy)]
enum Request<'q> {
    Extended(&'q RemoteQuery),
    Simple(&'q str),
}

/// Runs a parameterized query and returns its single row set.
pub fn fetch_rows(conn: &mut dyn RemoteConnection, query: &RemoteQuery, cx: &ExecContext<'_>) -> Result<RowSet> {
    let mut rows = None;
    drive(conn, Request::Extended(query), cx, |result| match result {
        RemoteResult::Rows(set) => {
            if rows.is_some() {
                return Err(RouteError::Protocol(
                    "query returned more than one result set".to_string(),
                ));
            }
            rows = Some(set);
            Ok(())
        }
        RemoteResult::Command(tag) => Err(RouteError::Protocol(format!(
            "expected rows, got command result '{tag}'"
        ))),
        RemoteResult::Error(err) => Err(RouteError::Remote(err)),
    })?;
    rows.ok_or_else(|| RouteError::Protocol("query returned no result set".to_string()))
}

/// Runs a simple-protocol command string, expecting no rows.
pub fn exec_command(conn: &mut dyn RemoteConnection, sql: &str, cx: &ExecContext<'_>) -> Result<()> {
    drive(conn, Request::Simple(sql), cx, |result| match result {
        RemoteResult::Command(_) => Ok(()),
        RemoteResult::Rows(_) => Err(RouteError::Protocol(format!(
            "command '{sql}' returned rows"
        ))),
        RemoteResult::Error(err) => Err(RouteError::Remote(err)),
    })
}

fn drive(
    conn: &mut dyn RemoteConnection,
    request: Request<'_>,
    cx: &ExecContext<'_>,
    mut accept: impl FnMut(RemoteResult) -> Result<()>,
) -> Result<()> {
    let mut state = CallState::Sending;
    let mut cancelled = false;

    loop {
        trace!(?state, "executor step");
        state = match state {
            CallState::Sending => {
                match request {
                    Request::Extended(query) => conn.send_query(query),
                    Request::Simple(sql) => conn.send_simple(sql),
                }
                .map_err(connection_error)?;
                CallState::Flushing
            }
            CallState::Flushing => match conn.flush().map_err(connection_error)? {
                Flush::Done => CallState::AwaitingResult,
                Flush::Pending => {
                    check_interrupt(conn, cx, &mut cancelled)?;
                    conn.wait(Interest::Write, cx.poll_interval)?;
                    CallState::Flushing
                }
            },
            CallState::AwaitingResult => {
                conn.consume_input()?;
                if conn.is_busy() {
                    check_interrupt(conn, cx, &mut cancelled)?;
                    conn.wait(Interest::Read, cx.poll_interval)?;
                    CallState::AwaitingResult
                } else {
                    CallState::Draining
                }
            }
            CallState::Draining => match conn.next_result() {
                None => CallState::Done,
                Some(result) => {
                    if !cancelled {
                        accept(result)?;
                    }
                    CallState::AwaitingResult
                }
            },
            CallState::Done => {
                return if cancelled {
                    Err(RouteError::Interrupted)
                } else {
                    Ok(())
                };
            }
        };
    }
}

fn connection_error(err: RouteError) -> RouteError {
    match err {
        RouteError::Io(e) => RouteError::Connection(e.to_string()),
        other => other,
    }
}

fn check_interrupt(conn: &mut dyn RemoteConnection, cx: &ExecContext<'_>, cancelled: &mut bool) -> Result<()> {
    if !*cancelled && cx.interrupt.is_cancelled() {
        debug!("interrupt received, cancelling remote statement");
        conn.request_cancel()?;
        *cancelled = true;
    }
    Ok(())
}
