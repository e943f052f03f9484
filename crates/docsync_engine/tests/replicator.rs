//! Replicator behaviour against in-memory servers and failing networks.

use bytes::Bytes;
use docsync_engine::{
    checkpoint_id, Activity, Checkpoint, CloseKind, DocumentReplication, ManualLifecycle,
    MemoryStorage, NetInterface, NetworkErrorKind, Progress, ProtocolContext, ProtocolEvent,
    ProtocolFactory, ReachabilityConfig, ReplicationProtocol, Replicator, ReplicatorConfig,
    ReplicatorError, ReplicatorStatus, RevisionId, SessionParams, StaticInterfaces, Storage,
};
use docsync_transport::{
    accept_key, close_code, BoxFuture, BoxedStream, Connector, TransportError, TransportResult,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Surfaces library logs when run with `RUST_LOG` set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Fails every attempt with the same error.
struct FailingConnector {
    error: fn() -> TransportError,
    attempts: Mutex<Vec<Instant>>,
}

impl FailingConnector {
    fn new(error: fn() -> TransportError) -> Arc<Self> {
        Arc::new(Self {
            error,
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempts_since(&self, start: Instant) -> Vec<u128> {
        self.attempts
            .lock()
            .iter()
            .map(|at| (*at - start).as_millis())
            .collect()
    }
}

impl Connector for FailingConnector {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, TransportResult<BoxedStream>> {
        self.attempts.lock().push(Instant::now());
        let error = (self.error)();
        Box::pin(async move { Err(error) })
    }
}

fn host_unreachable() -> TransportError {
    TransportError::network(NetworkErrorKind::HostUnreachable, "no route to host")
}

fn connection_refused() -> TransportError {
    TransportError::Io(io::ErrorKind::ConnectionRefused.into())
}

/// What the in-memory server does with each connection.
#[derive(Debug, Clone, Copy)]
enum Server {
    /// Upgrades, answers `hello` with `done`, then waits for the client to leave.
    Replicate,
    /// Upgrades and waits for the client to leave.
    Hold,
    /// Answers 101 without `Sec-WebSocket-Accept`.
    NoAccept,
}

struct ServerConnector {
    server: Server,
    attempts: Mutex<usize>,
}

impl ServerConnector {
    fn new(server: Server) -> Arc<Self> {
        Arc::new(Self {
            server,
            attempts: Mutex::new(0),
        })
    }

    fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

impl Connector for ServerConnector {
    fn connect<'a>(&'a self, _host: &'a str, _port: u16) -> BoxFuture<'a, TransportResult<BoxedStream>> {
        *self.attempts.lock() += 1;
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve(server, self.server));
        Box::pin(async move { Ok(Box::new(client) as BoxedStream) })
    }
}

async fn serve(mut stream: DuplexStream, server: Server) {
    let key = read_upgrade_key(&mut stream).await;
    let accept = match server {
        Server::NoAccept => String::new(),
        _ => format!("Sec-WebSocket-Accept: {}\r\n", accept_key(&key)),
    };
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n{accept}\r\n"
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    if let Server::Replicate = server {
        let mut hello = [0u8; 5];
        if stream.read_exact(&mut hello).await.is_err() {
            return;
        }
        assert_eq!(&hello, b"hello");
        if stream.write_all(b"done").await.is_err() {
            return;
        }
    }

    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink).await;
}

async fn read_upgrade_key(stream: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf)
        .unwrap()
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: ").map(str::to_string))
        .expect("upgrade request carries a key")
}

// ---------------------------------------------------------------------------
// Replication protocol double
// ---------------------------------------------------------------------------

const CONFLICT_DOC: &str = "doc-1";

#[derive(Default)]
struct TestFactory {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl TestFactory {
    fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }
}

impl ProtocolFactory for TestFactory {
    fn protocols(&self) -> Vec<String> {
        vec!["test-sync-1".to_string()]
    }

    fn create(&self, params: SessionParams) -> Box<dyn ReplicationProtocol> {
        self.checkpoints.lock().push(params.checkpoint.clone());
        Box::new(TestProtocol {
            storage: params.storage,
            continuous: params.continuous,
            received: Vec::new(),
        })
    }
}

/// Sends `hello`; on `done` pulls a conflicting revision and reports idle.
/// Continuous sessions report idle as soon as they open.
struct TestProtocol {
    storage: Arc<dyn Storage>,
    continuous: bool,
    received: Vec<u8>,
}

impl ReplicationProtocol for TestProtocol {
    fn on_open(&mut self, ctx: &mut ProtocolContext) {
        ctx.send(Bytes::from_static(b"hello"));
        if self.continuous {
            ctx.emit(ProtocolEvent::Idle);
        }
    }

    fn on_data(&mut self, ctx: &mut ProtocolContext, data: &[u8]) {
        self.received.extend_from_slice(data);
        if !self.received.ends_with(b"done") {
            return;
        }

        let rev = RevisionId::new(1, "ffff");
        self.storage
            .put_revision(CONFLICT_DOC, &rev, None, Bytes::from_static(b"{}"), false, true)
            .unwrap();
        ctx.emit(ProtocolEvent::Progress(Progress::new(1, 1)));
        ctx.emit(ProtocolEvent::Checkpoint(Checkpoint {
            local: Some(1),
            remote: Some("10".into()),
        }));
        ctx.emit(ProtocolEvent::DocumentEnded(
            DocumentReplication::pulled(CONFLICT_DOC, rev).with_error(ReplicatorError::Conflict {
                doc_id: CONFLICT_DOC.into(),
            }),
        ));
        ctx.emit(ProtocolEvent::Idle);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> ReplicatorConfig {
    ReplicatorConfig::new("ws://sync.example.com:4984/db/_blipsync".parse().unwrap())
}

fn record_statuses(replicator: &Replicator) -> mpsc::UnboundedReceiver<ReplicatorStatus> {
    let (tx, rx) = mpsc::unbounded_channel();
    replicator.add_change_listener(move |status| {
        let _ = tx.send(status.clone());
    });
    rx
}

/// Collects statuses up to and including the first with `activity`.
async fn collect_until(
    statuses: &mut mpsc::UnboundedReceiver<ReplicatorStatus>,
    activity: Activity,
) -> Vec<ReplicatorStatus> {
    let mut seen = Vec::new();
    loop {
        let status = tokio::time::timeout(Duration::from_secs(3600), statuses.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status listener dropped");
        let done = status.activity == activity;
        seen.push(status);
        if done {
            return seen;
        }
    }
}

fn activities(statuses: &[ReplicatorStatus]) -> Vec<Activity> {
    let mut activities: Vec<Activity> = statuses.iter().map(|s| s.activity).collect();
    activities.dedup();
    activities
}

fn drain(statuses: &mut mpsc::UnboundedReceiver<ReplicatorStatus>) -> Vec<ReplicatorStatus> {
    let mut seen = Vec::new();
    while let Ok(status) = statuses.try_recv() {
        seen.push(status);
    }
    seen
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn continuous_unreachable_host_backs_off_and_retries_when_network_returns() {
    init_tracing();
    let connector = FailingConnector::new(host_unreachable);
    let interfaces = StaticInterfaces::new();
    let config = config()
        .with_continuous(true)
        .with_reachability(ReachabilityConfig::new().with_poll_interval(Duration::from_secs(2)));
    let replicator = Replicator::builder(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(interfaces.clone()))
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    let start = Instant::now();
    replicator.start();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(connector.attempts_since(start), vec![0, 1000, 3000]);

    // The next backoff would end at 7s; the network coming back at the
    // 4s poll cuts it short.
    interfaces.set(vec![NetInterface::new("en0", "192.168.1.20".parse().unwrap())]);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.attempts_since(start), vec![0, 1000, 3000, 4000]);

    let seen = drain(&mut statuses);
    assert_eq!(
        activities(&seen)[..4],
        [Activity::Connecting, Activity::Offline, Activity::Connecting, Activity::Offline]
    );
    assert!(seen.iter().all(|s| s.error.is_none()), "retries must not surface errors");
    assert!(!seen.iter().any(|s| s.activity == Activity::Busy));

    replicator.stop();
    let end = collect_until(&mut statuses, Activity::Stopped).await;
    assert_eq!(end.last().unwrap().error, None);
}

#[tokio::test(start_paused = true)]
async fn continuous_replication_retries_indefinitely() {
    init_tracing();
    let connector = FailingConnector::new(connection_refused);
    let config = config()
        .with_continuous(true)
        .with_max_retry_wait(Duration::from_secs(4));
    let replicator = Replicator::builder(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(StaticInterfaces::new()))
    .build()
    .unwrap();

    let start = Instant::now();
    replicator.start();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let attempts = connector.attempts_since(start);
    assert_eq!(attempts[..5], [0, 1000, 3000, 7000, 11000]);
    assert!(attempts.len() > 10);
    let status = replicator.status();
    assert_eq!(status.activity, Activity::Offline);
    assert_eq!(status.error, None);
}

#[tokio::test(start_paused = true)]
async fn one_shot_replication_gives_up_after_two_retries() {
    init_tracing();
    let connector = FailingConnector::new(connection_refused);
    let replicator = Replicator::builder(
        config(),
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    let start = Instant::now();
    replicator.start();
    let seen = collect_until(&mut statuses, Activity::Stopped).await;

    assert_eq!(
        activities(&seen),
        vec![
            Activity::Connecting,
            Activity::Offline,
            Activity::Connecting,
            Activity::Offline,
            Activity::Connecting,
            Activity::Stopped,
        ]
    );
    let error = seen.last().unwrap().error.clone().expect("terminal error");
    assert!(error.is_transient());
    assert_eq!(
        error.close_status().map(|s| s.kind),
        Some(CloseKind::Io(io::ErrorKind::ConnectionRefused))
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts_since(start), vec![0, 1000, 3000]);
}

#[tokio::test(start_paused = true)]
async fn one_shot_network_dependent_failure_is_permanent() {
    init_tracing();
    let connector = FailingConnector::new(host_unreachable);
    let replicator = Replicator::builder(
        config(),
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(StaticInterfaces::new()))
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    let start = Instant::now();
    replicator.start();
    let seen = collect_until(&mut statuses, Activity::Stopped).await;
    assert_eq!(activities(&seen), vec![Activity::Connecting, Activity::Stopped]);
    assert!(seen.last().unwrap().error.as_ref().unwrap().is_network_dependent());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts_since(start), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn missing_accept_header_is_a_permanent_failure() {
    init_tracing();
    let connector = ServerConnector::new(Server::NoAccept);
    let replicator = Replicator::builder(
        config().with_continuous(true),
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(StaticInterfaces::new()))
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    replicator.start();
    let seen = collect_until(&mut statuses, Activity::Stopped).await;
    assert_eq!(activities(&seen), vec![Activity::Connecting, Activity::Stopped]);

    let error = seen.last().unwrap().error.clone().expect("terminal error");
    assert_eq!(
        error.close_status().map(|s| s.kind),
        Some(CloseKind::WebSocket(close_code::PROTOCOL_ERROR))
    );
    assert!(!error.is_transient());

    tokio::time::sleep(Duration::from_secs(700)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn one_shot_replication_completes_and_saves_checkpoint() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    storage.save(CONFLICT_DOC, "local").unwrap();
    let factory = Arc::new(TestFactory::default());
    let config = config();
    let cp_id = checkpoint_id(storage.uuid(), &config);

    let replicator = Replicator::builder(config, storage.clone(), factory.clone())
        .with_connector(ServerConnector::new(Server::Replicate))
        .build()
        .unwrap();
    let mut statuses = record_statuses(&replicator);
    let (docs_tx, mut docs) = mpsc::unbounded_channel();
    replicator.add_document_listener(move |doc| {
        let _ = docs_tx.send(doc.clone());
    });

    replicator.start();
    let seen = collect_until(&mut statuses, Activity::Stopped).await;
    assert_eq!(
        activities(&seen),
        vec![Activity::Connecting, Activity::Busy, Activity::Idle, Activity::Stopped]
    );
    let last = seen.last().unwrap();
    assert_eq!(last.error, None);
    assert_eq!(last.progress, Progress::new(1, 1));

    let doc = docs.recv().await.unwrap();
    assert_eq!(doc.doc_id, CONFLICT_DOC);
    assert!(doc.is_pull_conflict());

    let saved: Checkpoint =
        serde_json::from_slice(&storage.get_checkpoint(&cp_id).unwrap().unwrap()).unwrap();
    assert_eq!(
        saved,
        Checkpoint {
            local: Some(1),
            remote: Some("10".into()),
        }
    );
    assert_eq!(factory.checkpoints(), vec![Checkpoint::default()]);

    // Conflict resolution runs in the background and does not fail the run.
    for _ in 0..200 {
        if storage.leaves(CONFLICT_DOC).len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(storage.leaves(CONFLICT_DOC).len(), 1);
    assert_eq!(storage.resolved_conflicts(), vec![CONFLICT_DOC.to_string()]);
}

#[tokio::test]
async fn reset_checkpoint_applies_to_next_connection() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    let factory = Arc::new(TestFactory::default());
    let config = config();
    storage
        .set_checkpoint(&checkpoint_id(storage.uuid(), &config), Some(br#"{"local":5}"#.as_slice()))
        .unwrap();

    let replicator = Replicator::builder(config, storage.clone(), factory.clone())
        .with_connector(ServerConnector::new(Server::Replicate))
        .build()
        .unwrap();
    let mut statuses = record_statuses(&replicator);

    replicator.start();
    // Commands are handled in order, so the replicator is already running.
    assert_eq!(
        replicator.reset_checkpoint().await,
        Err(ReplicatorError::NotStopped)
    );
    collect_until(&mut statuses, Activity::Stopped).await;

    replicator.reset_checkpoint().await.unwrap();
    replicator.start();
    collect_until(&mut statuses, Activity::Stopped).await;

    let checkpoints = factory.checkpoints();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].local, Some(5));
    assert!(checkpoints[1].is_empty());
}

#[tokio::test(start_paused = true)]
async fn suspend_parks_offline_and_resume_reconnects() {
    init_tracing();
    let connector = ServerConnector::new(Server::Hold);
    let lifecycle = ManualLifecycle::new();
    let replicator = Replicator::builder(
        config().with_continuous(true),
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(StaticInterfaces::new()))
    .with_lifecycle(Arc::new(lifecycle.clone()))
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    replicator.start();
    let seen = collect_until(&mut statuses, Activity::Idle).await;
    assert_eq!(
        activities(&seen),
        vec![Activity::Connecting, Activity::Busy, Activity::Idle]
    );

    lifecycle.suspend();
    let seen = collect_until(&mut statuses, Activity::Offline).await;
    assert_eq!(seen.last().unwrap().error, None);

    // No retries while suspended.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(replicator.status().activity, Activity::Offline);

    lifecycle.resume();
    let seen = collect_until(&mut statuses, Activity::Idle).await;
    assert_eq!(activities(&seen), vec![Activity::Connecting, Activity::Busy, Activity::Idle]);
    assert_eq!(connector.attempts(), 2);

    replicator.stop();
    collect_until(&mut statuses, Activity::Stopped).await;
}

#[tokio::test]
async fn start_twice_is_a_noop_and_stop_is_idempotent() {
    init_tracing();
    let connector = ServerConnector::new(Server::Hold);
    let replicator = Replicator::builder(
        config().with_continuous(true),
        Arc::new(MemoryStorage::new()),
        Arc::new(TestFactory::default()),
    )
    .with_connector(connector.clone())
    .with_interfaces(Arc::new(StaticInterfaces::new()))
    .build()
    .unwrap();
    let mut statuses = record_statuses(&replicator);

    replicator.start();
    replicator.start();
    collect_until(&mut statuses, Activity::Idle).await;
    assert_eq!(connector.attempts(), 1);

    replicator.stop();
    replicator.stop();
    let seen = collect_until(&mut statuses, Activity::Stopped).await;
    assert_eq!(seen.last().unwrap().error, None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut statuses).is_empty());
    assert_eq!(replicator.status().activity, Activity::Stopped);
}
