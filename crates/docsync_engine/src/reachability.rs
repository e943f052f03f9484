//! Network reachability monitoring.
//!
//! The monitor enumerates host interfaces every poll interval, ignores
//! loopback, tunnel and virtual interfaces, and considers the network
//! reachable while any remaining interface has a routable unicast address.
//! Only transitions are reported; the first assessment is the baseline.

use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Interface name prefixes that never carry a usable route.
const EXCLUDED_PREFIXES: &[&str] = &[
    "lo", "utun", "tun", "tap", "awdl", "llw", "ipsec", "bridge", "vmnet", "vboxnet", "docker",
    "veth", "virbr", "gif", "stf", "anpi", "p2p",
];

/// Whether a usable network path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// At least one usable interface is up.
    Reachable,
    /// No usable interface.
    Unreachable,
}

/// One address of a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    /// Interface name, e.g. `en0`.
    pub name: String,
    /// Assigned address.
    pub addr: IpAddr,
    /// Reported as loopback by the OS.
    pub is_loopback: bool,
}

impl NetInterface {
    /// Creates an interface entry.
    pub fn new(name: impl Into<String>, addr: IpAddr) -> Self {
        let addr_is_loopback = addr.is_loopback();
        Self {
            name: name.into(),
            addr,
            is_loopback: addr_is_loopback,
        }
    }

    /// Returns true if this interface can reach the network.
    pub fn is_usable(&self) -> bool {
        !self.is_loopback && !is_excluded(&self.name) && is_routable(self.addr)
    }
}

/// Source of the host's interfaces.
pub trait InterfaceSource: Send + Sync {
    /// Lists interface addresses.
    fn interfaces(&self) -> io::Result<Vec<NetInterface>>;
}

/// The host's real interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| NetInterface {
                is_loopback: iface.is_loopback(),
                addr: iface.ip(),
                name: iface.name,
            })
            .collect())
    }
}

/// A settable interface list for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Arc<Mutex<Vec<NetInterface>>>,
}

impl StaticInterfaces {
    /// Creates a source with no interfaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the interface list.
    pub fn set(&self, interfaces: Vec<NetInterface>) {
        *self.interfaces.lock() = interfaces;
    }
}

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<NetInterface>> {
        Ok(self.interfaces.lock().clone())
    }
}

/// Assesses an interface list.
pub fn assess(interfaces: &[NetInterface]) -> Reachability {
    if interfaces.iter().any(NetInterface::is_usable) {
        Reachability::Reachable
    } else {
        Reachability::Unreachable
    }
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn is_routable(addr: IpAddr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() || addr.is_multicast() {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => !v4.is_broadcast() && !v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 != 0xfe80,
    }
}

/// Configuration for the reachability monitor.
#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// How often interfaces are enumerated.
    pub poll_interval: Duration,
}

impl ReachabilityConfig {
    /// Creates a configuration with the default poll interval.
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches reachability.
#[derive(Clone)]
pub struct ReachabilityMonitor {
    source: Arc<dyn InterfaceSource>,
    config: ReachabilityConfig,
}

impl ReachabilityMonitor {
    /// Creates a monitor over `source`.
    pub fn new(source: Arc<dyn InterfaceSource>, config: ReachabilityConfig) -> Self {
        Self { source, config }
    }

    /// Creates a monitor over the host's interfaces.
    pub fn system(config: ReachabilityConfig) -> Self {
        Self::new(Arc::new(SystemInterfaces), config)
    }

    /// Assesses reachability once.
    pub fn current(&self) -> Reachability {
        match self.source.interfaces() {
            Ok(interfaces) => assess(&interfaces),
            Err(err) => {
                warn!(error = %err, "failed to enumerate network interfaces");
                Reachability::Unreachable
            }
        }
    }

    /// Starts watching. Polling stops when the returned watch is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self) -> ReachabilityWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = None;
            loop {
                ticker.tick().await;
                let now = monitor.current();
                match last {
                    None => debug!(reachability = ?now, "reachability baseline"),
                    Some(previous) if previous != now => {
                        debug!(reachability = ?now, "reachability changed");
                        if tx.send(now).is_err() {
                            return;
                        }
                    }
                    Some(_) => {}
                }
                last = Some(now);
            }
        });
        ReachabilityWatch { changes: rx, task }
    }
}

/// Reachability transitions from a running monitor.
pub struct ReachabilityWatch {
    changes: mpsc::UnboundedReceiver<Reachability>,
    task: JoinHandle<()>,
}

impl ReachabilityWatch {
    /// Waits for the next transition.
    pub async fn changed(&mut self) -> Option<Reachability> {
        self.changes.recv().await
    }
}

impl Drop for ReachabilityWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
