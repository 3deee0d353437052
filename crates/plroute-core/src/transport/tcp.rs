//! PostgreSQL connections over TCP, driven through the shared [`Reactor`].

use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::pgwire::{self, AuthRequest, BackendMessage};
use super::{parse_conninfo, Connector, Flush, Interest, RemoteConnection, RemoteQuery, RemoteResult, RowSet};
use crate::error::{Result, RouteError};
use crate::reactor::Reactor;

const READ_CHUNK: usize = 8 * 1024;

/// Opens [`PgConnection`]s registered with one reactor.
#[derive(Debug, Clone)]
pub struct PgConnector {
    reactor: Rc<Reactor>,
    application_name: String,
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(reactor: Rc<Reactor>, application_name: &str, connect_timeout: Duration) -> Self {
        Self {
            reactor,
            application_name: application_name.to_string(),
            connect_timeout,
        }
    }
}

impl Connector for PgConnector {
    fn connect(&self, dsn: &str) -> Result<Box<dyn RemoteConnection>> {
        let info = parse_conninfo(dsn)?;
        let host = info.get("host").map_or("localhost", String::as_str).to_string();
        let port: u16 = match info.get("port") {
            Some(p) => p
                .parse()
                .map_err(|_| RouteError::Connection(format!("invalid port \"{p}\"")))?,
            None => 5432,
        };
        let user = info
            .get("user")
            .cloned()
            .ok_or_else(|| RouteError::Connection("no user in connection string".to_string()))?;
        let dbname = info.get("dbname").cloned().unwrap_or_else(|| user.clone());
        let password = info.get("password").cloned();
        let timeout = info
            .get("connect_timeout")
            .and_then(|t| t.parse().ok())
            .map_or(self.connect_timeout, Duration::from_secs);

        let mut params = vec![("user", user.as_str()), ("database", dbname.as_str())];
        params.push(("application_name", self.application_name.as_str()));

        let addr = (host.clone(), port);
        let handshake = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let key = startup(&mut stream, &params, password.as_deref()).await?;
            Ok::<_, RouteError>((stream, key))
        };
        let (stream, key) = self
            .reactor
            .block_on(async { tokio::time::timeout(timeout, handshake).await })
            .map_err(|_| RouteError::Connection("timeout expired".to_string()))??;

        debug!(host = %host, port, "node connection established");
        Ok(Box::new(PgConnection {
            reactor: Rc::clone(&self.reactor),
            stream,
            host,
            port,
            cancel_key: key,
            outbound: BytesMut::new(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            results: VecDeque::new(),
            current: None,
            in_flight: false,
            ready: true,
        }))
    }
}

/// Runs the startup handshake. Returns the cancel key when the server sent
/// one.
async fn startup(stream: &mut TcpStream, params: &[(&str, &str)], password: Option<&str>) -> Result<Option<(i32, i32)>> {
    let mut out = BytesMut::new();
    pgwire::startup(&mut out, params);
    stream.write_all(&out).await?;

    let mut inbound = BytesMut::with_capacity(READ_CHUNK);
    let mut key = None;
    loop {
        while let Some(msg) = pgwire::parse_backend_message(&mut inbound)? {
            match msg {
                BackendMessage::Authentication(AuthRequest::Ok) => {}
                BackendMessage::Authentication(AuthRequest::CleartextPassword) => {
                    let password = password.ok_or_else(|| {
                        RouteError::Connection("password is required but none was supplied".to_string())
                    })?;
                    let mut out = BytesMut::new();
                    pgwire::password(&mut out, password);
                    stream.write_all(&out).await?;
                }
                BackendMessage::Authentication(other) => {
                    return Err(RouteError::Connection(format!(
                        "unsupported authentication method {other:?}"
                    )));
                }
                BackendMessage::BackendKeyData { pid, secret } => key = Some((pid, secret)),
                BackendMessage::ErrorResponse(err) => {
                    return Err(RouteError::Connection(err.message));
                }
                BackendMessage::ReadyForQuery(_) => return Ok(key),
                _ => {}
            }
        }
        if stream.read_buf(&mut inbound).await? == 0 {
            return Err(RouteError::Connection(
                "server closed the connection during startup".to_string(),
            ));
        }
    }
}

/// A node connection speaking the extended and simple query protocols.
pub struct PgConnection {
    reactor: Rc<Reactor>,
    stream: TcpStream,
    host: String,
    port: u16,
    cancel_key: Option<(i32, i32)>,
    outbound: BytesMut,
    inbound: BytesMut,
    results: VecDeque<RemoteResult>,
    /// Rows of the result being received.
    current: Option<RowSet>,
    in_flight: bool,
    ready: bool,
}

impl PgConnection {
    fn start(&mut self) -> Result<()> {
        if self.in_flight {
            return Err(RouteError::Protocol(
                "another command is already in progress".to_string(),
            ));
        }
        self.in_flight = true;
        self.ready = false;
        self.results.clear();
        self.current = None;
        Ok(())
    }

    fn handle(&mut self, msg: BackendMessage) {
        match msg {
            BackendMessage::RowDescription(columns) => {
                self.current = Some(RowSet {
                    columns,
                    rows: Vec::new(),
                });
            }
            BackendMessage::DataRow(values) => {
                self.current.get_or_insert_with(RowSet::default).rows.push(values);
            }
            BackendMessage::CommandComplete(tag) => {
                let result = match self.current.take() {
                    Some(rows) => RemoteResult::Rows(rows),
                    None => RemoteResult::Command(tag),
                };
                self.results.push_back(result);
            }
            BackendMessage::EmptyQueryResponse => {
                self.results.push_back(RemoteResult::Command(String::new()));
            }
            BackendMessage::ErrorResponse(err) => {
                self.current = None;
                self.results.push_back(RemoteResult::Error(err));
            }
            BackendMessage::NoticeResponse(notice) => {
                debug!(host = %self.host, message = %notice.message, "notice from node");
            }
            BackendMessage::ReadyForQuery(_) => self.ready = true,
            _ => {}
        }
    }
}

impl RemoteConnection for PgConnection {
    fn send_query(&mut self, query: &RemoteQuery) -> Result<()> {
        self.start()?;
        pgwire::extended_query(
            &mut self.outbound,
            &query.sql,
            &query.param_types,
            &query.params,
            query.binary,
        );
        Ok(())
    }

    fn send_simple(&mut self, sql: &str) -> Result<()> {
        self.start()?;
        pgwire::query(&mut self.outbound, sql);
        Ok(())
    }

    fn flush(&mut self) -> Result<Flush> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => {
                    return Err(RouteError::Connection(
                        "connection closed while sending".to_string(),
                    ))
                }
                Ok(n) => {
                    let _ = self.outbound.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) => return Err(RouteError::Connection(e.to_string())),
            }
        }
        Ok(Flush::Done)
    }

    fn consume_input(&mut self) -> Result<()> {
        loop {
            self.inbound.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => {
                    return Err(RouteError::Connection(
                        "server closed the connection unexpectedly".to_string(),
                    ))
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(RouteError::Connection(e.to_string())),
            }
        }
        while let Some(msg) = pgwire::parse_backend_message(&mut self.inbound)? {
            self.handle(msg);
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.in_flight && self.results.is_empty() && !self.ready
    }

    fn next_result(&mut self) -> Option<RemoteResult> {
        if let Some(result) = self.results.pop_front() {
            return Some(result);
        }
        if self.ready {
            self.in_flight = false;
        }
        None
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<()> {
        self.reactor.wait_ready(&self.stream, interest, timeout)
    }

    fn request_cancel(&mut self) -> Result<()> {
        let Some((pid, secret)) = self.cancel_key else {
            return Err(RouteError::Connection(
                "node did not provide a cancel key".to_string(),
            ));
        };
        let mut out = BytesMut::new();
        pgwire::cancel_request(&mut out, pid, secret);
        let addr = (self.host.clone(), self.port);
        self.reactor.block_on(async {
            let mut side = TcpStream::connect(addr).await?;
            side.write_all(&out).await?;
            side.shutdown().await
        })?;
        debug!(host = %self.host, pid, "cancel request sent");
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        let mut out = BytesMut::new();
        pgwire::terminate(&mut out);
        let _ = self.stream.try_write(&out);
    }
}
