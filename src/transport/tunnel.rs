//! HTTP `CONNECT` tunnels through proxies (RFC 9110 Section 9.3.6).

use http::header::{CONNECTION, CONTENT_LENGTH, PROXY_AUTHENTICATE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::route::{Credentials, ProxyAddr, ProxyAuthenticator, ProxyChallenge};
use crate::transport::BoxedIo;

/// Upper bound on authentication round trips for one tunnel.
const MAX_TUNNEL_ATTEMPTS: usize = 5;

/// Upper bound on a proxy response head.
const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS_COUNT: usize = 64;

/// Upper bound on a chunk-size or trailer line.
const MAX_LINE_LEN: usize = 1024;

/// Upper bound on a 407 body we are willing to skip.
const MAX_DISCARD_LEN: u64 = 64 * 1024;

#[derive(Debug)]
struct ProxyResponse {
    status: StatusCode,
    headers: HeaderMap,
}

/// How the body of a proxy response is delimited (RFC 9112 Section 6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(u64),
    Chunked,
    /// Runs until the proxy closes the connection.
    UntilClose,
}

impl ProxyResponse {
    fn wants_close(&self) -> bool {
        self.headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }

    fn body_framing(&self) -> Result<BodyFraming> {
        if self.headers.contains_key(TRANSFER_ENCODING) {
            // chunked must be the final coding to delimit the body
            let last = self
                .headers
                .get_all(TRANSFER_ENCODING)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return Ok(match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
                _ => BodyFraming::UntilClose,
            });
        }
        match self.headers.get(CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(BodyFraming::Length)
                .ok_or_else(|| Error::tunnel("invalid Content-Length in proxy response")),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    fn challenges(&self) -> Vec<String> {
        self.headers
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect()
    }
}

/// Open a tunnel to `host:port` over a stream already connected to `proxy`.
///
/// On success the stream carries raw bytes to the target.
pub async fn open_tunnel(
    io: &mut BoxedIo,
    proxy: &ProxyAddr,
    host: &str,
    port: u16,
    authenticator: &dyn ProxyAuthenticator,
) -> Result<()> {
    let target = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut credentials: Option<Credentials> = None;

    for attempt in 1..=MAX_TUNNEL_ATTEMPTS {
        write_connect(io, &target, credentials.as_ref()).await?;
        let response = read_response_head(io).await?;

        if response.status.is_success() {
            tracing::debug!("Tunnel: {} open via {} (attempt {})", target, proxy, attempt);
            return Ok(());
        }

        if response.status != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(Error::tunnel(format!(
                "unexpected response to CONNECT {} from {}: {}",
                target, proxy, response.status
            )));
        }

        let challenge = ProxyChallenge {
            proxy: proxy.clone(),
            target: target.clone(),
            challenges: response.challenges(),
            prior: credentials.take(),
        };
        let Some(next) = authenticator.authenticate(&challenge) else {
            return Err(Error::ProxyAuth(format!(
                "{} requires authentication for {}",
                proxy, target
            )));
        };
        if response.wants_close() {
            return Err(Error::ProxyAuth(format!(
                "{} closed the connection after 407",
                proxy
            )));
        }
        match response.body_framing()? {
            BodyFraming::Length(len) => discard_exact(io, len).await?,
            BodyFraming::Chunked => discard_chunked(io).await?,
            BodyFraming::UntilClose => {
                return Err(Error::tunnel(format!(
                    "407 from {} has no body length; the connection cannot be reused",
                    proxy
                )));
            }
        }
        credentials = Some(next);
    }

    Err(Error::ProxyAuth(format!(
        "too many tunnel authentication attempts to {}",
        proxy
    )))
}

async fn write_connect(io: &mut BoxedIo, target: &str, credentials: Option<&Credentials>) -> Result<()> {
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(credentials) = credentials {
        request.push_str("Proxy-Authorization: ");
        request.push_str(credentials.as_str());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// Read the final response head, skipping 1xx responses.
///
/// Reads byte by byte so nothing past the head is consumed.
async fn read_response_head(io: &mut BoxedIo) -> Result<ProxyResponse> {
    let mut head = Vec::with_capacity(256);
    loop {
        if head.len() >= MAX_HEAD_LEN {
            return Err(Error::tunnel("proxy response head too large"));
        }
        let mut byte = [0u8; 1];
        if io.read(&mut byte).await? == 0 {
            return Err(Error::tunnel("proxy closed the connection during CONNECT"));
        }
        head.push(byte[0]);
        if !head.ends_with(b"\n\n") && !head.ends_with(b"\r\n\r\n") {
            continue;
        }
        match parse_response_head(&head)? {
            Some(response) if response.status.is_informational() => head.clear(),
            Some(response) => return Ok(response),
            None => {}
        }
    }
}

/// Parse a proxy response head. `None` means more bytes are needed.
fn parse_response_head(head: &[u8]) -> Result<Option<ProxyResponse>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);

    let parsed = response
        .parse(head)
        .map_err(|e| Error::tunnel(format!("malformed proxy response: {}", e)))?;
    if parsed.is_partial() {
        return Ok(None);
    }

    let code = response
        .code
        .ok_or_else(|| Error::tunnel("proxy response has no status code"))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::tunnel(format!("invalid proxy status code {}", code)))?;

    let mut map = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::tunnel(format!("invalid header name: {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::tunnel(format!("invalid header value for {}", name)))?;
        map.append(name, value);
    }

    Ok(Some(ProxyResponse {
        status,
        headers: map,
    }))
}

async fn discard_exact(io: &mut BoxedIo, len: u64) -> Result<()> {
    if len > MAX_DISCARD_LEN {
        return Err(Error::tunnel("407 response body too large"));
    }
    let mut remaining = len as usize;
    let mut buf = [0u8; 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = io.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::tunnel("proxy closed the connection during 407 body"));
        }
        remaining -= n;
    }
    Ok(())
}

/// Skip a chunked body, trailers included.
///
/// chunked-body = *chunk last-chunk trailer-section CRLF
async fn discard_chunked(io: &mut BoxedIo) -> Result<()> {
    let mut total = 0u64;
    loop {
        let line = read_line(io).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16)
            .map_err(|_| Error::tunnel(format!("malformed chunk size: {:?}", line)))?;

        if size == 0 {
            for _ in 0..MAX_HEADERS_COUNT {
                if read_line(io).await?.is_empty() {
                    return Ok(());
                }
            }
            return Err(Error::tunnel("too many trailer fields in 407 body"));
        }

        total = total.saturating_add(size);
        if total > MAX_DISCARD_LEN {
            return Err(Error::tunnel("407 response body too large"));
        }
        discard_exact(io, size).await?;
        if !read_line(io).await?.is_empty() {
            return Err(Error::tunnel("chunk not terminated by CRLF"));
        }
    }
}

/// One line without its terminator.
async fn read_line(io: &mut BoxedIo) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if io.read(&mut byte).await? == 0 {
            return Err(Error::tunnel("proxy closed the connection during 407 body"));
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(Error::tunnel("line too long in 407 body"));
        }
        line.push(byte[0]);
    }
}
