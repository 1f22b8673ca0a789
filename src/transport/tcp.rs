//! Raw socket capability and the default TCP implementation.
//!
//! Socket options are applied through socket2 before connecting:
//! - Receive/send buffer sizes (influence the initial window)
//! - TTL for IPv4 packets
//! - TCP keepalive
//!
//! Nodelay is applied on the connected tokio stream.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpSocket;

use crate::endpoint::CapabilityEq;
use crate::error::{Error, Result};
use crate::transport::BoxedIo;

/// Opens raw byte streams to socket addresses.
#[async_trait]
pub trait SocketFactory: CapabilityEq {
    /// Connect to `addr`. Dropping the returned future closes any half-open socket.
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedIo>;
}

/// TCP socket options.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketOptions {
    /// Receive buffer size (bytes). OS default when `None`.
    pub recv_buffer_size: Option<u32>,
    /// Send buffer size (bytes). OS default when `None`.
    pub send_buffer_size: Option<u32>,
    /// IPv4 TTL. OS default when `None`.
    pub ttl: Option<u32>,
    /// Idle time before TCP keepalive probes start.
    pub keepalive: Option<Duration>,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: None,
            send_buffer_size: None,
            ttl: None,
            keepalive: Some(Duration::from_secs(60)),
            nodelay: true,
        }
    }
}

/// Configure a TCP socket before it connects.
pub fn configure_tcp_socket(socket: &Socket, addr: &SocketAddr, opts: &SocketOptions) -> io::Result<()> {
    if let Some(size) = opts.recv_buffer_size {
        socket.set_recv_buffer_size(size as usize)?;
    }
    if let Some(size) = opts.send_buffer_size {
        socket.set_send_buffer_size(size as usize)?;
    }
    if let (Some(ttl), SocketAddr::V4(_)) = (opts.ttl, addr) {
        socket.set_ttl_v4(ttl)?;
    }
    if let Some(idle) = opts.keepalive {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}

/// Plain TCP socket factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TcpSocketFactory {
    options: SocketOptions,
}

impl TcpSocketFactory {
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedIo> {
        let connect_err = |source: io::Error| Error::Connect { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(connect_err)?;
        configure_tcp_socket(&socket, &addr, &self.options).map_err(connect_err)?;
        // tokio requires non-blocking sockets
        socket.set_nonblocking(true).map_err(connect_err)?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpSocket::from_std_stream(std_stream)
            .connect(addr)
            .await
            .map_err(connect_err)?;

        if self.options.nodelay {
            stream.set_nodelay(true).map_err(connect_err)?;
        }
        tracing::trace!("TCP: connected to {}", addr);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_option_defaults() {
        let opts = SocketOptions::default();
        assert_eq!(opts.recv_buffer_size, None);
        assert_eq!(opts.keepalive, Some(Duration::from_secs(60)));
        assert!(opts.nodelay);
    }

    #[test]
    fn test_factories_compare_by_options() {
        let a = TcpSocketFactory::default();
        let b = TcpSocketFactory::default();
        let c = TcpSocketFactory::new(SocketOptions {
            ttl: Some(64),
            ..SocketOptions::default()
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_connect_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let factory = TcpSocketFactory::new(SocketOptions {
            recv_buffer_size: Some(65535),
            send_buffer_size: Some(65535),
            ttl: Some(64),
            ..SocketOptions::default()
        });
        let mut io = factory.connect(addr).await.unwrap();
        io.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpSocketFactory::default().connect(addr).await.err().unwrap();
        assert!(matches!(err, Error::Connect { addr: a, .. } if a == addr));
    }
}
