//! Transport capabilities and their default implementations.
//!
//! - Name resolution (system resolver, static table)
//! - TCP sockets via socket2 + tokio
//! - TLS via tokio-boring, driven by [`profile::TlsProfile`]
//! - Hostname verification and certificate pinning
//! - HTTP `CONNECT` tunnels through proxies

pub mod profile;
pub mod resolver;
pub mod tcp;
pub mod tls;
pub mod tunnel;
pub mod verify;

use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream owned by a connection.
pub trait Io: AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Debug + Send + Unpin + 'static {}

/// Type-erased transport stream.
pub type BoxedIo = Box<dyn Io>;
