//! Single-threaded readiness reactor shared by every TCP node connection.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};

use crate::error::Result;
use crate::transport::Interest;

/// Owns a current-thread tokio runtime whose I/O driver polls node sockets.
/// All waits run on the calling thread.
pub struct Reactor {
    runtime: Runtime,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_io().enable_time().build()?;
        Ok(Self { runtime })
    }

    /// Drives `fut` to completion. Must not be called from inside another
    /// runtime.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Waits until `stream` is ready for `interest` or `timeout` passes.
    /// A timeout is not an error; the caller re-checks its state.
    pub fn wait_ready(&self, stream: &TcpStream, interest: Interest, timeout: Duration) -> Result<()> {
        let interest = match interest {
            Interest::Read => tokio::io::Interest::READABLE,
            Interest::Write => tokio::io::Interest::WRITABLE,
        };
        self.block_on(async {
            match tokio::time::timeout(timeout, stream.ready(interest)).await {
                Ok(ready) => ready.map(|_| ()),
                Err(_elapsed) => Ok(()),
            }
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_returns_on_readiness() {
        let reactor = Reactor::new().unwrap();
        let (client, _server) = reactor.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            (client, server)
        });
        let start = Instant::now();
        reactor
            .wait_ready(&client, Interest::Write, Duration::from_secs(5))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_without_error() {
        let reactor = Reactor::new().unwrap();
        let (client, _server) = reactor.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            (client, server)
        });
        let start = Instant::now();
        reactor
            .wait_ready(&client, Interest::Read, Duration::from_millis(50))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
