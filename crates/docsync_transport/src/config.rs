//! Connection and transport configuration.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Default `User-Agent` sent with the upgrade request.
pub const DEFAULT_USER_AGENT: &str = concat!("docsync/", env!("CARGO_PKG_VERSION"));

/// Username/password pair for HTTP Basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the `Basic ...` header value.
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// HTTP `CONNECT` proxy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Credentials for `Proxy-Authorization`.
    pub credentials: Option<Credentials>,
}

impl ProxyConfig {
    /// Creates a proxy configuration without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Sets proxy credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Options for a single connection.
///
/// Authenticators write into these before the connection is opened.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Target URL (`ws`/`wss`; `http`/`https` are accepted and mapped).
    pub url: Url,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Cookies sent with the request, as name/value pairs.
    pub cookies: Vec<(String, String)>,
    /// Credentials for `Authorization: Basic`.
    pub credentials: Option<Credentials>,
    /// Offered `Sec-WebSocket-Protocol` values.
    pub protocols: Vec<String>,
    /// DER bytes of the only server certificate to accept.
    pub pinned_certificate: Option<Vec<u8>>,
    /// Optional HTTP proxy.
    pub proxy: Option<ProxyConfig>,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl ConnectionOptions {
    /// Creates options for `url` with defaults.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            cookies: Vec::new(),
            credentials: None,
            protocols: Vec::new(),
            pinned_certificate: None,
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: crate::handshake::MAX_REDIRECTS,
        }
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    /// Adds a request header in place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Sets a cookie in place, replacing one with the same name.
    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = value,
            None => self.cookies.push((name, value)),
        }
    }

    /// Sets Basic credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Adds an offered sub-protocol.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Pins the server certificate (DER).
    pub fn with_pinned_certificate(mut self, der: Vec<u8>) -> Self {
        self.pinned_certificate = Some(der);
        self
    }

    /// Routes the connection through an HTTP proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Returns the `Cookie` header value, or `None` without cookies.
    pub fn cookie_header(&self) -> Option<String> {
        cookie_header(self.cookies.iter())
    }
}

/// Joins name/value pairs into a `Cookie` header value.
pub(crate) fn cookie_header<'a>(
    cookies: impl Iterator<Item = &'a (String, String)>,
) -> Option<String> {
    let joined = cookies
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}

/// Settings shared by all connections of a [`TransportManager`](crate::TransportManager).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing TCP.
    pub connect_timeout: Duration,
    /// Timeout for the whole open sequence (TCP, proxy, TLS, upgrade).
    pub handshake_timeout: Duration,
    /// Unacknowledged received bytes at which reading pauses.
    pub high_water_mark: usize,
    /// Size of each socket read.
    pub read_buffer_size: usize,
    /// How long each loop may take to exit after close before it is aborted.
    pub drain_timeout: Duration,
}

impl TransportConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(30),
            high_water_mark: 256 * 1024,
            read_buffer_size: 32 * 1024,
            drain_timeout: Duration::from_secs(3),
        }
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the open-sequence timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the receive high-water mark.
    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes.max(1);
        self
    }

    /// Sets the read buffer size.
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes.max(1);
        self
    }

    /// Sets the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}
