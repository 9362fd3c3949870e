//! Connection factory for streams.
//!
//! `StreamConnector` keeps the coordinator independent of the transport:
//! production code dials TCP, tests hand out in-memory pipes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

/// A boxed future returned by [`StreamConnector::connect`].
pub type ConnectFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Opens one ordered, reliable connection per stream.
pub trait StreamConnector: Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, stream_id: u32) -> ConnectFuture<'_, (Self::Reader, Self::Writer)>;
}

/// Dials a receiver over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    /// `addr` is anything `TcpStream::connect` resolves, e.g. `"backup01:9040"`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl StreamConnector for TcpConnector {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn connect(&self, stream_id: u32) -> ConnectFuture<'_, (Self::Reader, Self::Writer)> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {} timed out", self.addr),
                    )
                })??;
            stream.set_nodelay(true)?;
            debug!(stream_id, addr = %self.addr, "connected");
            Ok(stream.into_split())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));
        let (_r, _w) = connector.connect(0).await.unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connector_reports_refusal() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(5));
        assert!(connector.connect(0).await.is_err());
    }
}
