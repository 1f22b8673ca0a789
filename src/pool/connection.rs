//! One established transport to one route candidate.
//!
//! A connection is built by [`Connection::establish`], handed to the pool, and
//! from then on only its bookkeeping (stream count, health, idle time) changes.
//! Closing is terminal.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::MappedMutexGuard;
use tokio::time::Instant;

use crate::endpoint::EndpointIdentity;
use crate::error::{Error, Result};
use crate::protocol::{self, Protocol};
use crate::route::{Proxy, RouteCandidate};
use crate::timeouts::with_deadline;
use crate::transport::profile::TlsProfile;
use crate::transport::tls::Certificate;
use crate::transport::tunnel::open_tunnel;
use crate::transport::BoxedIo;

/// Stream limit for multiplexed connections until the peer or pool says otherwise.
pub const DEFAULT_MAX_STREAMS: u32 = 100;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct State {
    in_use: u32,
    max_streams: u32,
    last_active: Instant,
    healthy: bool,
    closed: bool,
}

/// Outcome of trying to claim a stream on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Acquired,
    Busy,
    Dead,
}

/// Outcome of a sweeper pass over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepCheck {
    /// Streams outstanding.
    InUse,
    /// Idle and healthy for this long.
    Idle(Duration),
    /// Marked closed; the caller must remove and close it.
    Evict(&'static str),
}

/// An established connection.
pub struct Connection {
    id: u64,
    identity: EndpointIdentity,
    route: RouteCandidate,
    protocol: Protocol,
    peer_chain: Vec<Certificate>,
    state: Mutex<State>,
    transport: tokio::sync::Mutex<Option<BoxedIo>>,
}

impl Connection {
    pub(crate) fn new(
        identity: EndpointIdentity,
        route: RouteCandidate,
        protocol: Protocol,
        io: BoxedIo,
        peer_chain: Vec<Certificate>,
    ) -> Self {
        let max_streams = if protocol.supports_multiplexing() {
            DEFAULT_MAX_STREAMS
        } else {
            1
        };
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            route,
            protocol,
            peer_chain,
            state: Mutex::new(State {
                in_use: 0,
                max_streams,
                last_active: Instant::now(),
                healthy: true,
                closed: false,
            }),
            transport: tokio::sync::Mutex::new(Some(io)),
        }
    }

    /// Connect to `candidate` on behalf of `identity`.
    ///
    /// `timeout` bounds this candidate alone: socket connect, proxy tunnel and
    /// every TLS handshake attempt. On failure nothing is left open.
    pub async fn establish(
        candidate: RouteCandidate,
        identity: &EndpointIdentity,
        timeout: Option<Duration>,
    ) -> Result<Connection> {
        with_deadline(timeout, Error::ConnectTimeout, connect(candidate, identity)).await
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    pub fn route(&self) -> &RouteCandidate {
        &self.route
    }

    /// Negotiated application protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_multiplexed(&self) -> bool {
        self.protocol.supports_multiplexing()
    }

    /// Peer certificates, leaf first. Empty for cleartext connections.
    pub fn peer_chain(&self) -> &[Certificate] {
        &self.peer_chain
    }

    /// Streams currently held.
    pub fn in_use(&self) -> u32 {
        self.lock_state().in_use
    }

    pub fn max_streams(&self) -> u32 {
        self.lock_state().max_streams
    }

    pub fn last_active(&self) -> Instant {
        self.lock_state().last_active
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Cheap, non-blocking liveness check.
    ///
    /// Idle HTTP/1.1 connections are polled once for a peer close or stray
    /// bytes. Multiplexed connections and connections with streams in use are
    /// not polled: they report healthy until [`Connection::mark_unhealthy`],
    /// [`Connection::close`] or idle eviction.
    pub fn is_healthy(&self) -> bool {
        let state = self.lock_state();
        if state.closed || !state.healthy {
            return false;
        }
        state.in_use > 0 || self.is_multiplexed() || self.probe()
    }

    /// Stop handing this connection out. It is closed once its last stream is released.
    pub fn mark_unhealthy(&self) {
        let mut state = self.lock_state();
        if state.healthy {
            tracing::debug!("Connection {}: marked unhealthy ({})", self.id, self.identity.authority());
        }
        state.healthy = false;
    }

    /// Apply a stream limit, e.g. the peer's advertised maximum.
    ///
    /// Ignored for protocols that do not multiplex.
    pub fn set_max_streams(&self, max: u32) {
        if self.is_multiplexed() {
            self.lock_state().max_streams = max;
        }
    }

    /// Close the transport. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if !state.closed {
                tracing::debug!(
                    "Connection {}: closing ({}, {} streams in use)",
                    self.id,
                    self.identity.authority(),
                    state.in_use
                );
            }
            state.closed = true;
            state.healthy = false;
        }
        // A caller still holding the stream keeps it until its guard drops.
        if let Ok(mut transport) = self.transport.try_lock() {
            transport.take();
        }
    }

    /// Exclusive access to the underlying byte stream.
    pub async fn io(&self) -> Result<MappedMutexGuard<'_, BoxedIo>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let guard = self.transport.lock().await;
        tokio::sync::MutexGuard::try_map(guard, |io| io.as_mut()).map_err(|_| Error::ConnectionClosed)
    }

    /// Take one stream.
    pub(crate) fn acquire_stream(&self) -> Result<()> {
        match self.try_claim() {
            Claim::Acquired => Ok(()),
            Claim::Busy => Err(Error::Busy),
            Claim::Dead => Err(Error::ConnectionClosed),
        }
    }

    /// Give back one stream; returns how many remain held.
    pub(crate) fn release_stream(&self) -> u32 {
        let mut state = self.lock_state();
        state.in_use = state.in_use.saturating_sub(1);
        state.last_active = Instant::now();
        state.in_use
    }

    /// Whether a released connection may go back into rotation.
    pub(crate) fn is_reusable(&self) -> bool {
        let state = self.lock_state();
        !state.closed && state.healthy
    }

    /// Check capacity and claim a stream under one lock.
    pub(crate) fn try_claim(&self) -> Claim {
        let mut state = self.lock_state();
        if state.closed || !state.healthy {
            return Claim::Dead;
        }
        if state.in_use >= state.max_streams {
            return Claim::Busy;
        }
        if state.in_use == 0 && !self.is_multiplexed() && !self.probe() {
            state.healthy = false;
            return Claim::Dead;
        }
        state.in_use += 1;
        state.last_active = Instant::now();
        Claim::Acquired
    }

    /// Decide whether the sweeper should evict this connection at `now`.
    ///
    /// Evicted connections are marked closed before the lock is released, so
    /// a concurrent acquire can never claim them.
    pub(crate) fn sweep_check(&self, now: Instant, idle_timeout: Duration) -> SweepCheck {
        let mut state = self.lock_state();
        if state.closed {
            return SweepCheck::Evict("closed");
        }
        if state.in_use > 0 {
            return SweepCheck::InUse;
        }
        let reason = if !state.healthy {
            Some("unhealthy")
        } else if now.saturating_duration_since(state.last_active) > idle_timeout {
            Some("idle timeout")
        } else if !self.is_multiplexed() && !self.probe() {
            Some("peer closed")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                state.closed = true;
                state.healthy = false;
                SweepCheck::Evict(reason)
            }
            None => SweepCheck::Idle(now.saturating_duration_since(state.last_active)),
        }
    }

    /// Mark closed if no stream is held. Returns whether it was retired.
    pub(crate) fn retire_if_idle(&self) -> bool {
        let mut state = self.lock_state();
        if state.closed || state.in_use > 0 {
            return false;
        }
        state.closed = true;
        state.healthy = false;
        true
    }

    /// Poll the idle stream once without blocking. Pending means nothing
    /// happened on the wire, which is the only healthy answer for an idle
    /// HTTP/1.1 connection.
    fn probe(&self) -> bool {
        let Ok(mut transport) = self.transport.try_lock() else {
            // Someone is using the stream; nothing to learn from it.
            return true;
        };
        let Some(io) = transport.as_mut() else {
            return false;
        };
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(io).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => {
                tracing::trace!(
                    "Connection {}: probe read {} byte(s) on idle stream",
                    self.id,
                    buf.filled().len()
                );
                false
            }
            Poll::Ready(Err(_)) => false,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.identity.authority())
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .field("in_use", &state.in_use)
            .field("max_streams", &state.max_streams)
            .field("healthy", &state.healthy)
            .field("closed", &state.closed)
            .finish()
    }
}

async fn connect(candidate: RouteCandidate, identity: &EndpointIdentity) -> Result<Connection> {
    if !identity.is_secure() {
        let protocol = identity
            .protocols()
            .iter()
            .copied()
            .find(Protocol::allows_cleartext)
            .ok_or_else(|| Error::ProtocolMismatch {
                offered: protocol::describe(identity.protocols()),
                negotiated: "cleartext".to_string(),
            })?;
        let io = open_socket(&candidate, identity).await?;
        tracing::debug!(
            "Connect: {} established via {} ({})",
            identity.authority(),
            candidate,
            protocol
        );
        return Ok(Connection::new(identity.clone(), candidate, protocol, io, Vec::new()));
    }

    let profiles: Vec<&TlsProfile> = identity.tls_profiles().iter().filter(|p| p.is_tls()).collect();
    let Some((last, earlier)) = profiles.split_last() else {
        return Err(Error::config("no TLS profile configured for https endpoint"));
    };
    for profile in earlier {
        match connect_secure(&candidate, identity, profile).await {
            Err(Error::Handshake(reason)) => {
                tracing::debug!(
                    "Connect: TLS profile '{}' failed for {} via {}: {}; falling back",
                    profile.name,
                    identity.authority(),
                    candidate,
                    reason
                );
            }
            result => return result,
        }
    }
    connect_secure(&candidate, identity, last).await
}

async fn connect_secure(
    candidate: &RouteCandidate,
    identity: &EndpointIdentity,
    profile: &TlsProfile,
) -> Result<Connection> {
    let factory = identity
        .secure_transport()
        .ok_or_else(|| Error::config("secure transport factory is required for https endpoints"))?;
    let verifier = identity
        .hostname_verifier()
        .ok_or_else(|| Error::config("hostname verifier is required for https endpoints"))?;

    let io = open_socket(candidate, identity).await?;
    let secure = factory
        .wrap(io, identity.host(), profile, identity.protocols())
        .await?;

    if !verifier.verify(identity.host(), &secure.peer_chain) {
        return Err(Error::Verification {
            host: identity.host().to_string(),
        });
    }
    if let Some(pinner) = identity.certificate_pinner() {
        pinner.check(identity.host(), &secure.peer_chain)?;
    }

    let protocol = negotiate(identity.protocols(), secure.alpn.as_deref())?;
    tracing::debug!(
        "Connect: {} established via {} ({}, profile '{}')",
        identity.authority(),
        candidate,
        protocol,
        profile.name
    );
    Ok(Connection::new(
        identity.clone(),
        candidate.clone(),
        protocol,
        secure.io,
        secure.peer_chain,
    ))
}

/// Raw stream to the candidate, tunnelled when a secure target sits behind a proxy.
async fn open_socket(candidate: &RouteCandidate, identity: &EndpointIdentity) -> Result<BoxedIo> {
    let mut io = identity.socket_factory().connect(candidate.addr).await?;
    if let Proxy::Http(proxy) = &candidate.proxy {
        if candidate.requires_tunnel(identity) {
            open_tunnel(
                &mut io,
                proxy,
                identity.host(),
                identity.port(),
                identity.proxy_authenticator(),
            )
            .await?;
        }
    }
    Ok(io)
}

/// Pick the protocol the peer selected, which must be one we offered.
///
/// A peer that ignores ALPN is assumed to speak HTTP/1.1.
fn negotiate(offered: &[Protocol], alpn: Option<&[u8]>) -> Result<Protocol> {
    let mismatch = |negotiated: String| Error::ProtocolMismatch {
        offered: protocol::describe(offered),
        negotiated,
    };
    match alpn {
        None if offered.contains(&Protocol::Http11) => Ok(Protocol::Http11),
        None => Err(mismatch("none".to_string())),
        Some(id) => match Protocol::from_alpn(id) {
            Some(p) if offered.contains(&p) => Ok(p),
            _ => Err(mismatch(String::from_utf8_lossy(id).into_owned())),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use tokio::io::{duplex, DuplexStream};

    pub(crate) fn identity(uri: &str) -> EndpointIdentity {
        ClientConfig::builder()
            .build()
            .identity_for(&uri.parse().unwrap())
            .unwrap()
    }

    pub(crate) fn route() -> RouteCandidate {
        RouteCandidate {
            proxy: Proxy::Direct,
            addr: "127.0.0.1:443".parse().unwrap(),
            index: 0,
        }
    }

    /// Connection over an in-memory stream; keep the peer end alive to stay healthy.
    pub(crate) fn test_connection(
        identity: &EndpointIdentity,
        protocol: Protocol,
    ) -> (Connection, DuplexStream) {
        let (client, server) = duplex(1024);
        let conn = Connection::new(identity.clone(), route(), protocol, Box::new(client), Vec::new());
        (conn, server)
    }

    #[tokio::test]
    async fn test_single_user_protocol_is_exclusive() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::Http11);

        assert!(conn.acquire_stream().is_ok());
        assert!(matches!(conn.acquire_stream(), Err(Error::Busy)));
        assert_eq!(conn.release_stream(), 0);
        assert!(conn.acquire_stream().is_ok());
    }

    #[tokio::test]
    async fn test_multiplexed_respects_stream_limit() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        conn.set_max_streams(2);

        assert!(conn.acquire_stream().is_ok());
        assert!(conn.acquire_stream().is_ok());
        assert!(matches!(conn.acquire_stream(), Err(Error::Busy)));
        assert_eq!(conn.in_use(), 2);
        conn.release_stream();
        assert!(conn.acquire_stream().is_ok());
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        assert_eq!(conn.release_stream(), 0);
        assert_eq!(conn.in_use(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_makes_idle_connection_unhealthy() {
        let id = identity("https://example.test/");
        let (conn, peer) = test_connection(&id, Protocol::Http11);
        assert!(conn.is_healthy());

        drop(peer);
        assert!(!conn.is_healthy());
        assert!(matches!(conn.acquire_stream(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.is_healthy());
        assert!(matches!(conn.acquire_stream(), Err(Error::ConnectionClosed)));
        assert!(matches!(conn.io().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_mark_unhealthy_blocks_new_streams() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        conn.acquire_stream().unwrap();
        conn.mark_unhealthy();
        assert!(matches!(conn.acquire_stream(), Err(Error::ConnectionClosed)));
        assert!(!conn.is_reusable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_check_threshold() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::H2);
        let idle = Duration::from_secs(60);
        let start = conn.last_active();

        assert_eq!(
            conn.sweep_check(start + idle, idle),
            SweepCheck::Idle(idle)
        );
        assert_eq!(
            conn.sweep_check(start + idle + Duration::from_millis(1), idle),
            SweepCheck::Evict("idle timeout")
        );
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_sweep_skips_in_use() {
        let id = identity("https://example.test/");
        let (conn, _peer) = test_connection(&id, Protocol::Http11);
        conn.acquire_stream().unwrap();
        assert_eq!(
            conn.sweep_check(Instant::now() + Duration::from_secs(3600), Duration::from_secs(1)),
            SweepCheck::InUse
        );
        assert!(!conn.retire_if_idle());
    }

    #[test]
    fn test_negotiate() {
        let offered = [Protocol::H2, Protocol::Http11];
        assert_eq!(negotiate(&offered, Some(b"h2")).unwrap(), Protocol::H2);
        assert_eq!(negotiate(&offered, None).unwrap(), Protocol::Http11);
        assert!(matches!(
            negotiate(&[Protocol::H2], None),
            Err(Error::ProtocolMismatch { .. })
        ));
        assert!(matches!(
            negotiate(&[Protocol::Http11], Some(b"h2")),
            Err(Error::ProtocolMismatch { ref negotiated, .. }) if negotiated == "h2"
        ));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let id = identity("https://example.test/");
        let (a, _pa) = test_connection(&id, Protocol::H2);
        let (b, _pb) = test_connection(&id, Protocol::H2);
        assert_ne!(a.id(), b.id());
    }
}
