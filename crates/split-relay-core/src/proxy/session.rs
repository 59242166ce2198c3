//! Client-side session surface handed to the connection handler.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::proxy::socks5::{ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, SOCKS_VERSION};

/// Requested destination of a CONNECT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub address: String,
    /// Destination port.
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// SOCKS5 reply codes sent in response to a CONNECT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    NetworkUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl Reply {
    pub fn code(self) -> u8 {
        match self {
            Reply::Succeeded => 0x00,
            Reply::GeneralFailure => 0x01,
            Reply::NetworkUnreachable => 0x03,
            Reply::ConnectionRefused => 0x05,
            Reply::TtlExpired => 0x06,
            Reply::CommandNotSupported => 0x07,
            Reply::AddressTypeNotSupported => 0x08,
        }
    }

    /// Classify a failed outbound connect into the reply sent to the
    /// client. Classification is structural, by [`io::ErrorKind`]; the
    /// error message text is never inspected.
    pub fn for_connect_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                Reply::NetworkUnreachable
            }
            _ => Reply::GeneralFailure,
        }
    }
}

/// Write a SOCKS5 CONNECT reply: VER REP RSV ATYP BND.ADDR BND.PORT.
///
/// The bound address is the outbound socket's local address on success
/// and all zeros when no socket exists.
pub async fn write_reply<W>(
    writer: &mut W,
    reply: Reply,
    bind: Option<SocketAddr>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = Vec::with_capacity(22);
    response.push(SOCKS_VERSION);
    response.push(reply.code());
    response.push(0x00);
    match bind.map(|addr| addr.ip()) {
        Some(IpAddr::V6(ip)) => {
            response.push(ADDR_TYPE_IPV6);
            response.extend_from_slice(&ip.octets());
        }
        Some(IpAddr::V4(ip)) => {
            response.push(ADDR_TYPE_IPV4);
            response.extend_from_slice(&ip.octets());
        }
        None => {
            response.push(ADDR_TYPE_IPV4);
            response.extend_from_slice(&[0, 0, 0, 0]);
        }
    }
    let port = bind.map(|addr| addr.port()).unwrap_or(0);
    response.extend_from_slice(&port.to_be_bytes());
    writer.write_all(&response).await
}

/// A client connection that has completed the SOCKS5 handshake and
/// issued a CONNECT command.
///
/// The session owns the client-side byte streams until the handler
/// takes them for relaying; closing is by shutdown/drop of the halves
/// during teardown.
pub struct Session<R, W> {
    id: Uuid,
    endpoint: Endpoint,
    reader: R,
    writer: W,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(endpoint: Endpoint, reader: R, writer: W) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            reader,
            writer,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send the CONNECT reply to the client.
    pub async fn write_reply(&mut self, reply: Reply, bind: Option<SocketAddr>) -> io::Result<()> {
        write_reply(&mut self.writer, reply, bind).await
    }

    /// Hand the client byte streams to the relay.
    pub fn into_streams(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_encoding_ipv4() {
        let mut buf = Vec::new();
        let bind: SocketAddr = "192.168.1.2:1080".parse().unwrap();
        write_reply(&mut buf, Reply::Succeeded, Some(bind)).await.unwrap();
        assert_eq!(buf, [5, 0, 0, 1, 192, 168, 1, 2, 0x04, 0x38]);
    }

    #[tokio::test]
    async fn reply_encoding_ipv6() {
        let mut buf = Vec::new();
        let bind: SocketAddr = "[::1]:80".parse().unwrap();
        write_reply(&mut buf, Reply::Succeeded, Some(bind)).await.unwrap();
        assert_eq!(buf[0..4], [5, 0, 0, 4]);
        assert_eq!(buf.len(), 4 + 16 + 2);
        assert_eq!(&buf[20..22], &[0, 80]);
    }

    #[tokio::test]
    async fn reply_encoding_without_bind_address() {
        let mut buf = Vec::new();
        write_reply(&mut buf, Reply::NetworkUnreachable, None).await.unwrap();
        assert_eq!(buf, [5, 3, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn connect_error_classification() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, Reply::ConnectionRefused),
            (io::ErrorKind::TimedOut, Reply::TtlExpired),
            (io::ErrorKind::NetworkUnreachable, Reply::NetworkUnreachable),
            (io::ErrorKind::HostUnreachable, Reply::NetworkUnreachable),
            (io::ErrorKind::PermissionDenied, Reply::GeneralFailure),
            (io::ErrorKind::Other, Reply::GeneralFailure),
        ];
        for (kind, expected) in cases {
            let error = io::Error::new(kind, "test error");
            assert_eq!(Reply::for_connect_error(&error), expected);
        }
    }
}
