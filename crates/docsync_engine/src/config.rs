//! Configuration for the replicator.

use crate::auth::Authenticator;
use crate::reachability::ReachabilityConfig;
use docsync_transport::{ProxyConfig, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Retry budget of a non-continuous replication.
pub const DEFAULT_ONE_SHOT_RETRIES: u32 = 2;

/// Ceiling for the wait between retries.
pub const DEFAULT_MAX_RETRY_WAIT: Duration = Duration::from_secs(600);

/// Which direction documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicatorType {
    /// Local changes are sent to the remote.
    Push,
    /// Remote changes are applied locally.
    Pull,
    /// Both directions.
    PushAndPull,
}

impl ReplicatorType {
    /// Returns true if local changes are pushed.
    pub fn is_push(self) -> bool {
        matches!(self, ReplicatorType::Push | ReplicatorType::PushAndPull)
    }

    /// Returns true if remote changes are pulled.
    pub fn is_pull(self) -> bool {
        matches!(self, ReplicatorType::Pull | ReplicatorType::PushAndPull)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ReplicatorType::Push => "push",
            ReplicatorType::Pull => "pull",
            ReplicatorType::PushAndPull => "push-pull",
        }
    }
}

/// Configuration for a replicator.
///
/// The replicator keeps its own copy; the session it runs never sees later
/// changes to the value it was built from.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Remote endpoint (`ws`, `wss`, `http` or `https`).
    pub target: Url,
    /// Replication direction.
    pub replicator_type: ReplicatorType,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Injects credentials into each connection attempt.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Channels to replicate; empty means all.
    pub channels: Vec<String>,
    /// Document IDs to replicate; empty means all.
    pub document_ids: Vec<String>,
    /// Retries before giving up. `None` uses the default for the mode.
    pub max_retries: Option<u32>,
    /// Ceiling for the wait between retries.
    pub max_retry_wait: Duration,
    /// Keep-alive interval handed to the replication protocol.
    pub heartbeat: Duration,
    /// DER-encoded certificate the server must present.
    pub pinned_certificate: Option<Vec<u8>>,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
    /// HTTP proxy to tunnel through.
    pub proxy: Option<ProxyConfig>,
    /// Minimum time between checkpoint saves.
    pub checkpoint_interval: Duration,
    /// Discard the saved checkpoint when the next connection starts.
    pub reset_checkpoint: bool,
    /// Transport settings.
    pub transport: TransportConfig,
    /// Reachability monitor settings.
    pub reachability: ReachabilityConfig,
}

impl ReplicatorConfig {
    /// Creates a push-and-pull, one-shot configuration.
    pub fn new(target: Url) -> Self {
        Self {
            target,
            replicator_type: ReplicatorType::PushAndPull,
            continuous: false,
            authenticator: None,
            channels: Vec::new(),
            document_ids: Vec::new(),
            max_retries: None,
            max_retry_wait: DEFAULT_MAX_RETRY_WAIT,
            heartbeat: Duration::from_secs(300),
            pinned_certificate: None,
            headers: Vec::new(),
            proxy: None,
            checkpoint_interval: Duration::from_secs(5),
            reset_checkpoint: false,
            transport: TransportConfig::default(),
            reachability: ReachabilityConfig::default(),
        }
    }

    /// Sets the replication direction.
    pub fn with_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the authenticator.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Restricts replication to these channels.
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts replication to these documents.
    pub fn with_document_ids<I, S>(mut self, document_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = document_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the ceiling for the wait between retries.
    pub fn with_max_retry_wait(mut self, wait: Duration) -> Self {
        self.max_retry_wait = wait;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Pins the server certificate.
    pub fn with_pinned_certificate(mut self, der: Vec<u8>) -> Self {
        self.pinned_certificate = Some(der);
        self
    }

    /// Adds a header to the upgrade request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Tunnels through an HTTP proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Sets the minimum time between checkpoint saves.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Discards the saved checkpoint on the next connection.
    pub fn with_reset_checkpoint(mut self, reset: bool) -> Self {
        self.reset_checkpoint = reset;
        self
    }

    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the reachability monitor configuration.
    pub fn with_reachability(mut self, reachability: ReachabilityConfig) -> Self {
        self.reachability = reachability;
        self
    }

    /// Returns the retry policy for this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        let max_retries = match (self.max_retries, self.continuous) {
            (Some(retries), _) => Some(retries),
            (None, true) => None,
            (None, false) => Some(DEFAULT_ONE_SHOT_RETRIES),
        };
        RetryPolicy {
            max_retries,
            max_wait: self.max_retry_wait,
        }
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt; `None` is unlimited.
    pub max_retries: Option<u32>,
    /// Ceiling for a single wait.
    pub max_wait: Duration,
}

impl RetryPolicy {
    /// Creates a policy with a retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            max_wait: DEFAULT_MAX_RETRY_WAIT,
        }
    }

    /// Creates a policy that never gives up.
    pub fn unlimited() -> Self {
        Self {
            max_retries: None,
            max_wait: DEFAULT_MAX_RETRY_WAIT,
        }
    }

    /// Sets the ceiling for a single wait.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Wait before the retry that follows `attempt` earlier retries:
    /// `min(2^attempt seconds, max_wait)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_wait)
    }

    /// Returns true if another retry is allowed after `retries` retries.
    pub fn allows(&self, retries: u32) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ONE_SHOT_RETRIES)
    }
}
