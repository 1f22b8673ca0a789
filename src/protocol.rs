//! Application protocols an endpoint may speak.

use std::fmt;

/// Application protocol negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// HTTP/1.1 ("http/1.1").
    Http11,
    /// HTTP/2 over TLS, selected via ALPN ("h2").
    H2,
    /// Cleartext HTTP/2 without upgrade ("h2_prior_knowledge").
    H2PriorKnowledge,
}

impl Protocol {
    /// Get human-readable protocol string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::H2 => "h2",
            Self::H2PriorKnowledge => "h2_prior_knowledge",
        }
    }

    /// Identifier advertised during the TLS handshake, if the protocol is negotiable there.
    pub fn alpn_id(&self) -> Option<&'static [u8]> {
        match self {
            Self::Http11 => Some(b"http/1.1"),
            Self::H2 => Some(b"h2"),
            Self::H2PriorKnowledge => None,
        }
    }

    /// Map a negotiated ALPN identifier back to a protocol.
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(Self::Http11),
            b"h2" => Some(Self::H2),
            _ => None,
        }
    }

    /// Check if this protocol carries many concurrent exchanges over one connection.
    pub fn supports_multiplexing(&self) -> bool {
        matches!(self, Self::H2 | Self::H2PriorKnowledge)
    }

    /// Check if this protocol can be spoken without TLS.
    pub fn allows_cleartext(&self) -> bool {
        matches!(self, Self::Http11 | Self::H2PriorKnowledge)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode protocols as an ALPN wire list (length-prefixed identifiers).
pub fn alpn_wire_format(protocols: &[Protocol]) -> Vec<u8> {
    let mut out = Vec::new();
    for id in protocols.iter().filter_map(Protocol::alpn_id) {
        out.push(id.len() as u8);
        out.extend_from_slice(id);
    }
    out
}

/// Render a protocol list for diagnostics.
pub(crate) fn describe(protocols: &[Protocol]) -> String {
    protocols
        .iter()
        .map(Protocol::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
