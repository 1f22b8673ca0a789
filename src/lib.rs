//! # linkpool
//!
//! Connection identity, route fallback and connection pooling for HTTP clients.
//!
//! A request target plus a [`ClientConfig`] yields an [`EndpointIdentity`]:
//! the key that decides whether two requests may share a connection. The
//! [`Dispatcher`] looks that key up in a [`ConnectionPool`] and, on a miss,
//! walks the endpoint's route candidates in order until one connects.
//!
//! ```rust,no_run
//! use linkpool::{ClientConfig, ConnectionPool, Dispatcher, PoolConfig};
//!
//! # async fn run() -> linkpool::Result<()> {
//! let pool = ConnectionPool::new(PoolConfig::default());
//! let _sweeper = pool.spawn_sweeper();
//! let dispatcher = Dispatcher::new(pool.clone(), ClientConfig::default());
//!
//! let lease = dispatcher.dispatch(&"https://example.com/".parse().unwrap()).await?;
//! println!("{} via {}", lease.protocol(), lease.route());
//! drop(lease);
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod route;
pub mod timeouts;
pub mod transport;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use dispatch::Dispatcher;
pub use endpoint::{Cap, CapabilityEq, EndpointBuilder, EndpointIdentity, Scheme};
pub use error::{Error, Result};
pub use pool::{Connection, ConnectionPool, Lease, PoolConfig, PoolStats};
pub use protocol::Protocol;
pub use route::{
    BasicProxyAuth, Credentials, NoProxy, NoProxyAuth, Proxy, ProxyAddr, ProxyAuthenticator,
    ProxyChallenge, ProxySelector, RouteCandidate, RouteEnumerator, StaticProxySelector,
};
pub use timeouts::Timeouts;
pub use transport::profile::{TlsProfile, TlsVersion};
pub use transport::resolver::{Resolver, StaticResolver, SystemResolver};
pub use transport::tcp::{SocketFactory, SocketOptions, TcpSocketFactory};
pub use transport::tls::{BoringTlsFactory, Certificate, SecureStream, SecureTransportFactory};
pub use transport::verify::{
    CertificatePinner, DefaultHostnameVerifier, HostnameVerifier, Pin, PinSet,
};
pub use transport::{BoxedIo, Io};
