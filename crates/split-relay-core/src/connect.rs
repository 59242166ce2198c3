//! Outbound TCP connect primitive.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::proxy::session::Endpoint;

/// An established outbound connection, split into halves.
pub struct Outbound<R, W> {
    pub reader: R,
    pub writer: W,
    pub local_addr: SocketAddr,
}

/// Opens outbound connections for the relay.
///
/// Behind a trait so tests can script connect results; the relay only
/// ever sees the split halves.
#[async_trait]
pub trait Connector: Send + Sync {
    type Read: AsyncRead + Unpin + Send + 'static;
    type Write: AsyncWrite + Unpin + Send + 'static;

    /// Connect to the endpoint. `low_latency` disables Nagle so that
    /// consecutive writes leave in separate TCP segments.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        low_latency: bool,
    ) -> io::Result<Outbound<Self::Read, Self::Write>>;
}

/// Real TCP connector with a bounded connect time.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Read = OwnedReadHalf;
    type Write = OwnedWriteHalf;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        low_latency: bool,
    ) -> io::Result<Outbound<Self::Read, Self::Write>> {
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", endpoint),
                ))
            }
        };
        if low_latency {
            stream.set_nodelay(true)?;
        }
        let local_addr = stream.local_addr()?;
        debug!("Connected to {} from {}", endpoint, local_addr);
        let (reader, writer) = stream.into_split();
        Ok(Outbound {
            reader,
            writer,
            local_addr,
        })
    }
}
