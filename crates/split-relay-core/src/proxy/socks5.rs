//! SOCKS5 front end.
//!
//! Minimal CONNECT-only server: negotiates the no-authentication
//! method, parses the request, and hands a [`Session`] to the
//! connection handler. Authentication, BIND, and UDP ASSOCIATE are not
//! supported.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connect::TcpConnector;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::proxy::handler::handle_connect;
use crate::proxy::session::{write_reply, Endpoint, Reply, Session};

// SOCKS5 constants
pub(crate) const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
pub(crate) const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x03;
pub(crate) const ADDR_TYPE_IPV6: u8 = 0x04;

/// SOCKS5 proxy server.
pub struct Socks5Proxy {
    listener: TcpListener,
    relay: RelayConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Socks5Proxy {
    /// Bind the listening socket. Port 0 binds an ephemeral port; the
    /// effective address is available from [`local_addr`](Self::local_addr).
    pub async fn bind(
        bind_addr: SocketAddr,
        relay: RelayConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            relay,
            metrics,
        })
    }

    /// The address the server is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        info!("SOCKS5 proxy listening on {}", self.local_addr()?);
        let connector = TcpConnector::new(self.relay.connect_timeout());

        loop {
            match self.listener.accept().await {
                Ok((stream, client_addr)) => {
                    let relay = self.relay.clone();
                    let metrics = Arc::clone(&self.metrics);
                    let connector = connector.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_client(stream, client_addr, connector, relay, metrics).await
                        {
                            debug!("Connection from {} error: {}", client_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single SOCKS5 client connection.
async fn handle_client(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    connector: TcpConnector,
    relay: RelayConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<()> {
    debug!("New SOCKS5 connection from {}", client_addr);

    negotiate_method(&mut stream).await?;
    let endpoint = match read_request(&mut stream).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("Invalid request from {}: {}", client_addr, e);
            return Err(e);
        }
    };

    debug!("SOCKS5 CONNECT to {}", endpoint);

    let (reader, writer) = stream.into_split();
    let session = Session::new(endpoint, reader, writer);
    handle_connect(session, &connector, &relay, metrics.as_ref()).await?;
    Ok(())
}

/// Negotiate the authentication method; only NO AUTH is offered.
async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(Error::InvalidSocks5Protocol(format!(
            "Invalid version: {}",
            buf[0]
        )));
    }

    let nmethods = buf[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::InvalidSocks5Protocol(
            "No acceptable authentication method".into(),
        ));
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read the connection request and extract the requested endpoint.
async fn read_request<S>(stream: &mut S) -> Result<Endpoint>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(Error::InvalidSocks5Protocol(
            "Invalid request version".into(),
        ));
    }

    let cmd = header[1];
    let atyp = header[3];

    if cmd != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(Error::UnsupportedCommand(cmd));
    }

    parse_address(stream, atyp).await
}

/// Parse a SOCKS5 address into an endpoint.
async fn parse_address<S>(stream: &mut S, atyp: u8) -> Result<Endpoint>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = match atyp {
        ADDR_TYPE_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            format!("{}.{}.{}.{}", buf[0], buf[1], buf[2], buf[3])
        }
        ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8_lossy(&domain).to_string()
        }
        ADDR_TYPE_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            format!(
                "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                u16::from_be_bytes([buf[0], buf[1]]),
                u16::from_be_bytes([buf[2], buf[3]]),
                u16::from_be_bytes([buf[4], buf[5]]),
                u16::from_be_bytes([buf[6], buf[7]]),
                u16::from_be_bytes([buf[8], buf[9]]),
                u16::from_be_bytes([buf[10], buf[11]]),
                u16::from_be_bytes([buf[12], buf[13]]),
                u16::from_be_bytes([buf[14], buf[15]]),
            )
        }
        _ => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(Error::UnsupportedAddressType(atyp));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(Endpoint::new(addr, port))
}
