use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use linkpool::{
    BoxedIo, Certificate, CertificatePinner, Error, HostnameVerifier, Protocol, Result,
    SecureStream, SecureTransportFactory, SocketFactory, TlsProfile,
};
use tokio::io::{duplex, DuplexStream};

#[derive(Debug, Default)]
struct NetState {
    attempts: Vec<SocketAddr>,
    refused: HashSet<SocketAddr>,
    stalled: HashSet<SocketAddr>,
    peers: Vec<DuplexStream>,
}

/// In-memory socket factory that records every connect attempt.
///
/// Each successful connect hands out one end of a duplex pipe and keeps the
/// other end, so connections stay healthy until [`FakeNet::hang_up_all`].
/// Clones share state and compare equal; separate instances never do.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct FakeNet {
    state: Arc<Mutex<NetState>>,
}

#[allow(dead_code)]
impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to `addr`.
    pub fn refuse(&self, addr: SocketAddr) -> &Self {
        self.state.lock().unwrap().refused.insert(addr);
        self
    }

    /// Never complete connections to `addr`.
    pub fn stall(&self, addr: SocketAddr) -> &Self {
        self.state.lock().unwrap().stalled.insert(addr);
        self
    }

    /// Addresses connected to, in order, including failed attempts.
    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Close the server side of every connection handed out so far.
    pub fn hang_up_all(&self) {
        self.state.lock().unwrap().peers.clear();
    }
}

impl PartialEq for FakeNet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for FakeNet {}

impl Hash for FakeNet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.state) as usize).hash(state);
    }
}

#[async_trait]
impl SocketFactory for FakeNet {
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedIo> {
        let stalled = {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(addr);
            if state.refused.contains(&addr) {
                return Err(Error::Connect {
                    addr,
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                });
            }
            state.stalled.contains(&addr)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let (client, server) = duplex(4096);
        self.state.lock().unwrap().peers.push(server);
        Ok(Box::new(client))
    }
}

/// Shared record of TLS profiles tried, compared by instance.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct HandshakeLog(Arc<Mutex<Vec<String>>>);

#[allow(dead_code)]
impl HandshakeLog {
    pub fn profiles(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl PartialEq for HandshakeLog {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HandshakeLog {}

impl Hash for HandshakeLog {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Secure transport that skips cryptography and reports a canned result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[allow(dead_code)]
pub struct FakeTls {
    /// ALPN identifier the "server" selects.
    pub alpn: Option<&'static [u8]>,
    /// Profiles whose handshake fails.
    pub failing_profiles: Vec<&'static str>,
    /// Never finish a handshake.
    pub stall: bool,
    pub log: HandshakeLog,
}

#[allow(dead_code)]
impl FakeTls {
    pub fn http11() -> Self {
        Self {
            alpn: Some(b"http/1.1"),
            ..Self::default()
        }
    }

    pub fn h2() -> Self {
        Self {
            alpn: Some(b"h2"),
            ..Self::default()
        }
    }

    pub fn failing(mut self, profile: &'static str) -> Self {
        self.failing_profiles.push(profile);
        self
    }

    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }
}

#[async_trait]
impl SecureTransportFactory for FakeTls {
    async fn wrap(
        &self,
        io: BoxedIo,
        _server_name: &str,
        profile: &TlsProfile,
        _alpn: &[Protocol],
    ) -> Result<SecureStream> {
        self.log.0.lock().unwrap().push(profile.name.clone());
        if self.stall {
            std::future::pending::<()>().await;
        }
        if self.failing_profiles.iter().any(|p| *p == profile.name) {
            return Err(Error::handshake(format!("alert: handshake failure ({})", profile.name)));
        }
        Ok(SecureStream {
            io,
            alpn: self.alpn.map(<[u8]>::to_vec),
            peer_chain: vec![Certificate::from_der(b"fake-leaf".to_vec())],
        })
    }
}

/// Hostname verifier with a fixed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(dead_code)]
pub struct FixedVerifier(pub bool);

impl HostnameVerifier for FixedVerifier {
    fn verify(&self, _host: &str, chain: &[Certificate]) -> bool {
        self.0 && !chain.is_empty()
    }
}

/// Pinner that rejects every host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[allow(dead_code)]
pub struct RejectAllPins;

impl CertificatePinner for RejectAllPins {
    fn check(&self, host: &str, _chain: &[Certificate]) -> Result<()> {
        Err(Error::PinMismatch {
            host: host.to_string(),
            pins: "sha256/AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
            chain: "fake-leaf".to_string(),
        })
    }
}
