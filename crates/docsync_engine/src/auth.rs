//! Authenticators that inject credentials into connection attempts.

use docsync_transport::{ConnectionOptions, Credentials};
use std::fmt;

/// Default name of the session cookie.
pub const DEFAULT_SESSION_COOKIE: &str = "SyncGatewaySession";

/// Adds credentials to the options of each connection attempt.
///
/// Called once per attempt, after saved cookies have been applied.
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// Injects credentials into `options`.
    fn apply(&self, options: &mut ConnectionOptions);
}

/// HTTP Basic authentication.
#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    credentials: Credentials,
}

impl BasicAuthenticator {
    /// Creates a Basic authenticator.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }

    /// Returns the user name.
    pub fn username(&self) -> &str {
        &self.credentials.username
    }
}

impl Authenticator for BasicAuthenticator {
    fn apply(&self, options: &mut ConnectionOptions) {
        options.credentials = Some(self.credentials.clone());
    }
}

/// Authenticates with a session ID obtained elsewhere.
#[derive(Clone)]
pub struct SessionAuthenticator {
    session_id: String,
    cookie_name: String,
}

impl SessionAuthenticator {
    /// Creates an authenticator using the default cookie name.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
        }
    }

    /// Uses a different cookie name.
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Returns the cookie name.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

impl Authenticator for SessionAuthenticator {
    fn apply(&self, options: &mut ConnectionOptions) {
        options.set_cookie(&self.cookie_name, &self.session_id);
    }
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("cookie_name", &self.cookie_name)
            .field("session_id", &"<redacted>")
            .finish()
    }
}

/// Bearer token authentication.
#[derive(Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    /// Creates a bearer token authenticator.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn apply(&self, options: &mut ConnectionOptions) {
        options.add_header("Authorization", format!("Bearer {}", self.token));
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Cookies received from the server, sent again on later connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores cookies, replacing any with the same name. An empty value
    /// removes the cookie.
    pub fn merge<I>(&mut self, cookies: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in cookies {
            self.cookies.retain(|(n, _)| *n != name);
            if !value.is_empty() {
                self.cookies.push((name, value));
            }
        }
    }

    /// Returns a cookie value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the number of cookies.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Returns true if the jar is empty.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Adds the cookies to a connection attempt.
    pub fn apply(&self, options: &mut ConnectionOptions) {
        for (name, value) in &self.cookies {
            options.set_cookie(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions::new("wss://sync.example.com/db".parse().unwrap())
    }

    #[test]
    fn basic_sets_credentials() {
        let mut opts = options();
        BasicAuthenticator::new("alice", "secret").apply(&mut opts);
        let credentials = opts.credentials.unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "secret");
    }

    #[test]
    fn session_sets_cookie() {
        let mut opts = options();
        opts.set_cookie(DEFAULT_SESSION_COOKIE, "stale");
        SessionAuthenticator::new("abc123").apply(&mut opts);
        assert_eq!(opts.cookie_header().as_deref(), Some("SyncGatewaySession=abc123"));

        let mut opts = options();
        SessionAuthenticator::new("abc123")
            .with_cookie_name("Custom")
            .apply(&mut opts);
        assert_eq!(opts.cookie_header().as_deref(), Some("Custom=abc123"));
    }

    #[test]
    fn token_sets_bearer_header() {
        let mut opts = options();
        TokenAuthenticator::new("t0k").apply(&mut opts);
        assert!(opts
            .headers
            .iter()
            .any(|(name, value)| name == "Authorization" && value == "Bearer t0k"));
    }

    #[test]
    fn cookie_jar_merges_and_applies() {
        let mut jar = CookieJar::new();
        jar.merge([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
        jar.merge([("a".to_string(), "3".to_string()), ("b".to_string(), String::new())]);
        assert_eq!(jar.get("a"), Some("3"));
        assert_eq!(jar.get("b"), None);
        assert_eq!(jar.len(), 1);

        // Authenticator cookies applied afterwards win.
        let mut opts = options();
        jar.merge([(DEFAULT_SESSION_COOKIE.to_string(), "old".to_string())]);
        jar.apply(&mut opts);
        SessionAuthenticator::new("new").apply(&mut opts);
        assert_eq!(opts.cookie_header().as_deref(), Some("a=3; SyncGatewaySession=new"));
    }

    #[test]
    fn debug_redacts_secrets() {
        let debug = format!("{:?}", TokenAuthenticator::new("t0k"));
        assert!(!debug.contains("t0k"));
        let debug = format!("{:?}", SessionAuthenticator::new("abc123"));
        assert!(!debug.contains("abc123"));
    }
}
