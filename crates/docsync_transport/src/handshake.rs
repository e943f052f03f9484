//! HTTP upgrade handshake and redirect logic.
//!
//! [`HttpLogic`] builds the `GET ... Upgrade: websocket` request for the
//! current target and decides what a response means: upgraded, redirect to
//! a new target, or failure. It does no I/O; the connection code feeds it
//! parsed [`HttpResponse`]s.

use crate::config::{cookie_header, ConnectionOptions, Credentials};
use crate::error::{NetworkErrorKind, TransportError, TransportResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use tracing::debug;
use url::Url;

/// GUID appended to the nonce when computing `Sec-WebSocket-Accept`.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: u32 = 10;

/// Largest response head accepted.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Generates a fresh base64 `Sec-WebSocket-Key`.
pub fn generate_nonce() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Computes the `Sec-WebSocket-Accept` value expected for `nonce`.
pub fn accept_key(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Builds an HTTP `CONNECT` request for tunnelling through a proxy.
pub fn connect_request(host: &str, port: u16, credentials: Option<&Credentials>) -> String {
    let authority = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]:{port}"),
        _ => format!("{host}:{port}"),
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = credentials {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            credentials.basic_header()
        ));
    }
    request.push_str("\r\n");
    request
}

/// Parses a `Set-Cookie` value into its name and value.
pub fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let pair = value.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// A parsed HTTP response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Headers in received order.
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    /// Parses a response head from the start of `buf`.
    ///
    /// Returns `Ok(None)` until the blank line ending the head has arrived;
    /// otherwise the response and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> TransportResult<Option<(Self, usize)>> {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(TransportError::Protocol("response head too large".into()));
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| TransportError::Protocol("response head is not UTF-8".into()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(TransportError::Protocol(format!(
                "bad status line: {status_line:?}"
            )));
        }
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| TransportError::Protocol(format!("bad status line: {status_line:?}")))?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::Protocol(format!("bad header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Some((
            Self {
                status,
                reason,
                headers,
            },
            end + 4,
        )))
    }

    /// Returns the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over all headers named `name` (case-insensitive).
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the cookies set by this response.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers_named("Set-Cookie")
            .filter_map(parse_set_cookie)
            .collect()
    }

    /// Returns true if the comma-separated `name` header lists `token`.
    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers_named(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// What a handshake response means for the connection.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The connection is upgraded.
    Upgraded,
    /// Reconnect to [`HttpLogic::url`], which now holds the new target.
    Redirect,
    /// The handshake failed.
    Failed(TransportError),
}

/// Request building and response interpretation for one logical connection.
#[derive(Debug)]
pub struct HttpLogic {
    url: Url,
    nonce: String,
    redirects: u32,
    max_redirects: u32,
    cookies: Vec<(String, String)>,
}

impl HttpLogic {
    /// Creates handshake logic for `url`.
    pub fn new(url: Url, max_redirects: u32) -> TransportResult<Self> {
        let url = websocket_url(url)?;
        if url.host_str().is_none() {
            return Err(TransportError::network(
                NetworkErrorKind::InvalidUrl,
                format!("{url} has no host"),
            ));
        }
        Ok(Self {
            url,
            nonce: String::new(),
            redirects: 0,
            max_redirects,
            cookies: Vec::new(),
        })
    }

    /// Returns the current target.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the current target host, without IPv6 brackets.
    pub fn host(&self) -> &str {
        let host = self.url.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// Returns the current target port.
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Returns true if the target needs TLS.
    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// Returns the number of redirects followed so far.
    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    /// Returns cookies received from responses so far.
    pub fn received_cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// Builds the upgrade request, generating a fresh nonce.
    pub fn upgrade_request(&mut self, options: &ConnectionOptions) -> String {
        self.nonce = generate_nonce();

        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        let authority = self.url.host_str().unwrap_or_default();
        let host = match self.url.port() {
            Some(port) => format!("{authority}:{port}"),
            None => authority.to_string(),
        };

        let mut request = format!("GET {target} HTTP/1.1\r\n");
        let mut push = |name: &str, value: &str| {
            if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                debug!(header = name, "dropping header with illegal characters");
                return;
            }
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        };

        push("Host", &host);
        push("User-Agent", &options.user_agent);
        push("Connection", "Upgrade");
        push("Upgrade", "websocket");
        push("Sec-WebSocket-Version", "13");
        push("Sec-WebSocket-Key", &self.nonce);
        if !options.protocols.is_empty() {
            push("Sec-WebSocket-Protocol", &options.protocols.join(", "));
        }
        if let Some(credentials) = &options.credentials {
            push("Authorization", &credentials.basic_header());
        }
        for (name, value) in &options.headers {
            push(name, value);
        }
        let cookies = options
            .cookies
            .iter()
            .filter(|(name, _)| !self.cookies.iter().any(|(n, _)| n == name))
            .chain(self.cookies.iter());
        if let Some(cookie) = cookie_header(cookies) {
            push("Cookie", &cookie);
        }

        request.push_str("\r\n");
        request
    }

    /// Interprets a response to the last request from [`upgrade_request`](Self::upgrade_request).
    pub fn handle_response(&mut self, response: &HttpResponse) -> HandshakeOutcome {
        for (name, value) in response.cookies() {
            match self.cookies.iter_mut().find(|(n, _)| *n == name) {
                Some(existing) => existing.1 = value,
                None => self.cookies.push((name, value)),
            }
        }

        match response.status {
            101 => match self.check_upgrade(response) {
                Ok(()) => HandshakeOutcome::Upgraded,
                Err(err) => HandshakeOutcome::Failed(err),
            },
            300..=399 => match self.follow_redirect(response) {
                Ok(()) => HandshakeOutcome::Redirect,
                Err(err) => HandshakeOutcome::Failed(err),
            },
            200..=299 => HandshakeOutcome::Failed(TransportError::Protocol(format!(
                "server answered {} without upgrading",
                response.status
            ))),
            status => HandshakeOutcome::Failed(TransportError::Http {
                status,
                reason: response.reason.clone(),
            }),
        }
    }

    fn check_upgrade(&self, response: &HttpResponse) -> TransportResult<()> {
        if !response.header_has_token("Connection", "upgrade") {
            return Err(TransportError::Protocol(
                "missing 'Connection: Upgrade' header".into(),
            ));
        }
        if !response
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            return Err(TransportError::Protocol(
                "missing 'Upgrade: websocket' header".into(),
            ));
        }
        match response.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(&self.nonce) => Ok(()),
            Some(_) => Err(TransportError::Protocol(
                "Sec-WebSocket-Accept does not match key".into(),
            )),
            None => Err(TransportError::Protocol(
                "missing Sec-WebSocket-Accept header".into(),
            )),
        }
    }

    fn follow_redirect(&mut self, response: &HttpResponse) -> TransportResult<()> {
        self.redirects += 1;
        if self.redirects > self.max_redirects {
            return Err(TransportError::network(
                NetworkErrorKind::TooManyRedirects,
                format!("gave up after {} redirects", self.max_redirects),
            ));
        }
        let location = response.header("Location").ok_or_else(|| {
            TransportError::network(
                NetworkErrorKind::InvalidRedirect,
                format!("{} without Location", response.status),
            )
        })?;
        let next = self.url.join(location).map_err(|err| {
            TransportError::network(
                NetworkErrorKind::InvalidRedirect,
                format!("bad Location {location:?}: {err}"),
            )
        })?;
        let next = websocket_url(next).map_err(|_| {
            TransportError::network(
                NetworkErrorKind::InvalidRedirect,
                format!("redirect to unsupported scheme: {location}"),
            )
        })?;
        debug!(from = %self.url, to = %next, status = response.status, "following redirect");
        self.url = next;
        Ok(())
    }
}

/// Maps `http`/`https` to `ws`/`wss`, rejecting other schemes.
fn websocket_url(mut url: Url) -> TransportResult<Url> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::network(
                NetworkErrorKind::InvalidUrl,
                format!("unsupported scheme {other:?}"),
            ))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::network(
            NetworkErrorKind::InvalidUrl,
            format!("cannot convert {url} to {scheme}"),
        ));
    }
    Ok(url)
}
