//! The replicator state machine.
//!
//! A [`Replicator`] is a handle to a single task that owns the connection,
//! the retry timer, the reachability watch and the protocol session. Every
//! input (caller commands, transport events, local changes, timers,
//! reachability and lifecycle signals) is handled on that task one at a
//! time, so no state is shared with the caller except the published status.
//!
//! ```text
//!   Stopped ──start──▶ Connecting ──opened──▶ Busy ⇄ Idle
//!      ▲                  │  ▲                  │
//!      │        retryable │  │ backoff elapsed  │ closed
//!      │                  ▼  │ or reachable     ▼
//!      └──permanent─── Offline ◀─────────── (classify)
//! ```

use crate::auth::CookieJar;
use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::{ReplicatorConfig, RetryPolicy};
use crate::error::{classify, ErrorClass, ReplicatorError, ReplicatorResult, StorageResult};
use crate::lifecycle::{AppState, LifecycleSource, NoopLifecycle};
use crate::protocol::{
    ProtocolContext, ProtocolEvent, ProtocolFactory, ReplicationProtocol, SessionParams,
};
use crate::reachability::{
    InterfaceSource, Reachability, ReachabilityMonitor, ReachabilityWatch, SystemInterfaces,
};
use crate::status::{Activity, DocumentReplication, ListenerToken, Listeners, Progress, ReplicatorStatus};
use crate::storage::{DocumentChange, Storage};
use docsync_transport::{
    close_code, CloseStatus, ConnectionEvent, ConnectionId, ConnectionOptions, Connector,
    TransportEvent, TransportManager,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Requests from the handle to the task.
enum Command {
    Start,
    Stop,
    ResetCheckpoint(oneshot::Sender<ReplicatorResult<()>>),
}

/// Builds a [`Replicator`] with non-default collaborators.
pub struct ReplicatorBuilder {
    config: ReplicatorConfig,
    storage: Arc<dyn Storage>,
    protocols: Arc<dyn ProtocolFactory>,
    connector: Option<Arc<dyn Connector>>,
    interfaces: Arc<dyn InterfaceSource>,
    lifecycle: Arc<dyn LifecycleSource>,
}

impl ReplicatorBuilder {
    /// Creates a builder.
    pub fn new(
        config: ReplicatorConfig,
        storage: Arc<dyn Storage>,
        protocols: Arc<dyn ProtocolFactory>,
    ) -> Self {
        Self {
            config,
            storage,
            protocols,
            connector: None,
            interfaces: Arc::new(SystemInterfaces),
            lifecycle: Arc::new(NoopLifecycle),
        }
    }

    /// Opens connections through `connector` instead of TCP.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Reads network interfaces from `interfaces`.
    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceSource>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Receives suspend/resume signals from `lifecycle`.
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleSource>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Validates the configuration and spawns the replicator task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> ReplicatorResult<Replicator> {
        validate_target(&self.config.target)?;

        let transport = match self.connector {
            Some(connector) => TransportManager::with_connector(self.config.transport.clone(), connector),
            None => TransportManager::new(self.config.transport.clone()),
        };
        let monitor = ReachabilityMonitor::new(self.interfaces, self.config.reachability.clone());
        let (status_tx, status_rx) = watch::channel(ReplicatorStatus::stopped());
        let listeners = Arc::new(Listeners::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        let task = ReplicatorTask {
            retry: self.config.retry_policy(),
            reset_pending: self.config.reset_checkpoint,
            config: self.config,
            storage: self.storage,
            protocols: self.protocols,
            transport,
            monitor,
            lifecycle_source: self.lifecycle,
            status: status_tx,
            listeners: Arc::clone(&listeners),
            transport_tx,
            changes_tx,
            state: State::Stopped,
            progress: Progress::default(),
            connection: None,
            session: None,
            retries: 0,
            retry_at: None,
            reachability: None,
            lifecycle: None,
            suspended: false,
            checkpointer: None,
            flush_at: None,
            cookies: CookieJar::new(),
            change_listener: None,
            conflicts: JoinSet::new(),
            pending_error: None,
            restart: false,
        };
        tokio::spawn(task.run(commands_rx, transport_rx, changes_rx));

        Ok(Replicator {
            commands: commands_tx,
            status: status_rx,
            listeners,
        })
    }
}

fn validate_target(url: &Url) -> ReplicatorResult<()> {
    match url.scheme() {
        "ws" | "wss" | "http" | "https" if url.host_str().is_some() => Ok(()),
        "ws" | "wss" | "http" | "https" => Err(ReplicatorError::InvalidConfig(format!(
            "target {url} has no host"
        ))),
        other => Err(ReplicatorError::InvalidConfig(format!(
            "unsupported target scheme {other:?}"
        ))),
    }
}

/// Replicates between a local [`Storage`] and a remote endpoint.
///
/// All methods return immediately; results are observed through the status
/// and listeners. Dropping the handle stops the replicator.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// # use std::sync::Arc;
/// # fn factory() -> Arc<dyn docsync_engine::ProtocolFactory> { unimplemented!() }
/// use docsync_engine::{Activity, MemoryStorage, Replicator, ReplicatorConfig};
///
/// let config = ReplicatorConfig::new("wss://sync.example.com/db".parse()?).with_continuous(true);
/// let replicator = Replicator::new(config, Arc::new(MemoryStorage::new()), factory())?;
///
/// replicator.add_change_listener(|status| println!("{:?}", status.activity));
/// replicator.start();
///
/// let mut status = replicator.subscribe_status();
/// status.wait_for(|s| s.activity == Activity::Idle).await?;
/// replicator.stop();
/// # Ok(())
/// # }
/// ```
pub struct Replicator {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ReplicatorStatus>,
    listeners: Arc<Listeners>,
}

impl Replicator {
    /// Creates a replicator with the default collaborators.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ReplicatorConfig,
        storage: Arc<dyn Storage>,
        protocols: Arc<dyn ProtocolFactory>,
    ) -> ReplicatorResult<Self> {
        ReplicatorBuilder::new(config, storage, protocols).build()
    }

    /// Returns a builder.
    pub fn builder(
        config: ReplicatorConfig,
        storage: Arc<dyn Storage>,
        protocols: Arc<dyn ProtocolFactory>,
    ) -> ReplicatorBuilder {
        ReplicatorBuilder::new(config, storage, protocols)
    }

    /// Starts replicating. Does nothing if already running.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Stops replicating. Does nothing if already stopped.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Discards the saved checkpoint when the next connection starts.
    ///
    /// Fails with [`ReplicatorError::NotStopped`] unless stopped.
    pub async fn reset_checkpoint(&self) -> ReplicatorResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ResetCheckpoint(tx));
        rx.await.map_err(|_| ReplicatorError::Shutdown)?
    }

    /// Returns the current status.
    pub fn status(&self) -> ReplicatorStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status snapshots. Rapid changes may be coalesced;
    /// use [`add_change_listener`](Self::add_change_listener) to see each one.
    pub fn subscribe_status(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status.clone()
    }

    /// Registers a status listener, called on every status change.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.listeners.add_status(Arc::new(listener))
    }

    /// Registers a listener for finished documents.
    pub fn add_document_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.listeners.add_document(Arc::new(listener))
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.listeners.remove(token)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("replicator task is gone");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Connecting,
    Connected,
    /// Waiting to retry, or suspended.
    Offline,
    /// Waiting for the connection to close before stopping.
    Stopping,
}

struct ReplicatorTask {
    config: ReplicatorConfig,
    retry: RetryPolicy,
    storage: Arc<dyn Storage>,
    protocols: Arc<dyn ProtocolFactory>,
    transport: TransportManager,
    monitor: ReachabilityMonitor,
    lifecycle_source: Arc<dyn LifecycleSource>,
    status: watch::Sender<ReplicatorStatus>,
    listeners: Arc<Listeners>,
    transport_tx: mpsc::UnboundedSender<ConnectionEvent>,
    changes_tx: mpsc::UnboundedSender<Vec<DocumentChange>>,

    state: State,
    progress: Progress,
    connection: Option<ConnectionId>,
    session: Option<Box<dyn ReplicationProtocol>>,
    /// Retries since the last successful connection.
    retries: u32,
    retry_at: Option<Instant>,
    reachability: Option<ReachabilityWatch>,
    lifecycle: Option<watch::Receiver<AppState>>,
    suspended: bool,
    /// One-shot; consumed by the next connection attempt.
    reset_pending: bool,
    checkpointer: Option<Checkpointer>,
    flush_at: Option<Instant>,
    cookies: CookieJar,
    change_listener: Option<u64>,
    conflicts: JoinSet<(String, StorageResult<()>)>,
    /// Reported when the pending close completes.
    pending_error: Option<ReplicatorError>,
    /// Start again once stopped.
    restart: bool,
}

impl ReplicatorTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut changes: mpsc::UnboundedReceiver<Vec<DocumentChange>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                Some(changes) = changes.recv() => self.handle_local_changes(changes),
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    debug!(attempt = self.retries, "backoff elapsed");
                    self.connect();
                }
                _ = sleep_until(self.flush_at) => {
                    self.flush_at = None;
                    self.flush_checkpoint();
                }
                change = next_reachability(&mut self.reachability) => self.handle_reachability(change),
                state = next_app_state(&mut self.lifecycle) => self.handle_app_state(state),
                Some(result) = self.conflicts.join_next(), if !self.conflicts.is_empty() => {
                    self.handle_conflict_resolved(result)
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::ResetCheckpoint(reply) => {
                let result = if self.state == State::Stopped {
                    self.reset_pending = true;
                    debug!("checkpoint reset requested");
                    Ok(())
                } else {
                    Err(ReplicatorError::NotStopped)
                };
                let _ = reply.send(result);
            }
        }
    }

    fn start(&mut self) {
        match self.state {
            State::Stopped => {}
            State::Stopping => {
                debug!("start requested while stopping; restarting once stopped");
                self.restart = true;
                return;
            }
            _ => {
                debug!("start ignored: already running");
                return;
            }
        }

        info!(
            url = %self.config.target,
            replicator_type = self.config.replicator_type.as_str(),
            continuous = self.config.continuous,
            "replicator starting"
        );
        self.retries = 0;
        self.progress = Progress::default();
        self.pending_error = None;
        let checkpointer = Checkpointer::new(Arc::clone(&self.storage), &self.config);
        debug!(checkpoint = checkpointer.id(), "using checkpoint");
        self.checkpointer = Some(checkpointer);

        if self.config.replicator_type.is_push() {
            let changes = self.changes_tx.clone();
            self.change_listener = Some(self.storage.add_change_listener(Arc::new(move |batch| {
                let _ = changes.send(batch.to_vec());
            })));
        }

        let lifecycle = self.lifecycle_source.subscribe();
        self.suspended = *lifecycle.borrow() == AppState::Suspended;
        self.lifecycle = Some(lifecycle);

        if self.suspended {
            info!("application suspended; waiting to resume");
            self.state = State::Offline;
            self.publish(Activity::Offline);
        } else {
            self.connect();
        }
    }

    fn stop(&mut self) {
        match self.state {
            State::Stopped | State::Stopping => {
                debug!("stop ignored: not running");
                self.restart = false;
            }
            State::Connecting | State::Connected => {
                info!("replicator stopping");
                self.state = State::Stopping;
                self.restart = false;
                self.retry_at = None;
                self.reachability = None;
                self.close_connection(CloseStatus::websocket(close_code::NORMAL, "replicator stopped"));
            }
            State::Offline => {
                info!("replicator stopping");
                self.finish_stop(None);
            }
        }
    }

    /// Opens a new connection, consuming a pending checkpoint reset.
    fn connect(&mut self) {
        self.retry_at = None;
        if self.reset_pending {
            self.reset_pending = false;
            if let Some(checkpointer) = &mut self.checkpointer {
                if let Err(err) = checkpointer.reset() {
                    warn!(error = %err, "failed to reset checkpoint");
                }
            }
        }

        let mut options = ConnectionOptions::new(self.config.target.clone());
        options.headers = self.config.headers.clone();
        options.protocols = self.protocols.protocols();
        options.pinned_certificate = self.config.pinned_certificate.clone();
        options.proxy = self.config.proxy.clone();
        self.cookies.apply(&mut options);
        if let Some(authenticator) = &self.config.authenticator {
            authenticator.apply(&mut options);
        }

        self.state = State::Connecting;
        self.publish(Activity::Connecting);
        let id = self.transport.open(options, self.transport_tx.clone());
        debug!(connection_id = %id, attempt = self.retries, "connecting");
        self.connection = Some(id);
    }

    fn handle_transport(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { id, event } = event;
        if self.connection != Some(id) {
            debug!(connection_id = %id, "ignoring event from old connection");
            return;
        }
        match event {
            TransportEvent::Opened {
                url,
                cookies,
                protocol,
            } => self.on_opened(url, cookies, protocol),
            TransportEvent::Received(data) => {
                self.with_session(|session, ctx| session.on_data(ctx, &data));
                if let Err(err) = self.transport.receive_complete(id, data.len()) {
                    debug!(connection_id = %id, error = %err, "receive ack after close");
                }
            }
            TransportEvent::WriteCompleted(bytes) => {
                self.with_session(|session, ctx| session.on_write_completed(ctx, bytes))
            }
            TransportEvent::Closed(status) => self.on_closed(status),
        }
    }

    fn on_opened(&mut self, url: Url, cookies: Vec<(String, String)>, protocol: Option<String>) {
        if self.state != State::Connecting {
            // Stopping or suspending; the close is already on its way.
            return;
        }
        info!(%url, ?protocol, "connected");
        self.state = State::Connected;
        self.retries = 0;
        self.reachability = None;
        self.cookies.merge(cookies);

        let loaded = match &mut self.checkpointer {
            Some(checkpointer) => checkpointer.load().cloned(),
            None => Ok(Checkpoint::default()),
        };
        let checkpoint = match loaded {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                self.stop_with_error(err);
                return;
            }
        };
        let params = SessionParams {
            url,
            protocol,
            replicator_type: self.config.replicator_type,
            continuous: self.config.continuous,
            channels: self.config.channels.clone(),
            document_ids: self.config.document_ids.clone(),
            heartbeat: self.config.heartbeat,
            checkpoint,
            storage: Arc::clone(&self.storage),
        };
        self.session = Some(self.protocols.create(params));
        self.publish(Activity::Busy);
        self.with_session(|session, ctx| session.on_open(ctx));
    }

    fn on_closed(&mut self, status: CloseStatus) {
        self.connection = None;
        if let Some(mut session) = self.session.take() {
            session.on_close(&status);
        }
        self.flush_checkpoint();

        if self.state == State::Stopping {
            let error = self.pending_error.take();
            self.finish_stop(error);
            return;
        }
        if self.suspended {
            info!(%status, "connection closed while suspended");
            self.state = State::Offline;
            self.publish(Activity::Offline);
            return;
        }
        if status.is_normal() {
            info!("connection closed normally");
            self.finish_stop(None);
            return;
        }

        let class = classify(&status);
        let retryable = match class {
            ErrorClass::Transient => true,
            ErrorClass::NetworkDependent => self.config.continuous,
            ErrorClass::Permanent => false,
        };
        let error = ReplicatorError::Closed(status);
        if !retryable {
            warn!(error = %error, ?class, "permanent failure");
            self.finish_stop(Some(error));
            return;
        }
        if !self.retry.allows(self.retries) {
            warn!(error = %error, retries = self.retries, "retry budget exhausted");
            self.finish_stop(Some(error));
            return;
        }

        let delay = self.retry.delay_for_attempt(self.retries);
        self.retries += 1;
        self.retry_at = Some(Instant::now() + delay);
        self.state = State::Offline;
        info!(
            error = %error,
            attempt = self.retries,
            delay_ms = delay.as_millis() as u64,
            "connection failed; retrying"
        );
        if class == ErrorClass::NetworkDependent && self.reachability.is_none() {
            self.reachability = Some(self.monitor.watch());
        }
        self.publish(Activity::Offline);
    }

    /// Runs a session callback and applies what it queued.
    fn with_session<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut dyn ReplicationProtocol, &mut ProtocolContext),
    {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut ctx = ProtocolContext::new();
        callback(&mut **session, &mut ctx);

        let (frames, events) = ctx.take();
        if let Some(id) = self.connection {
            for frame in frames {
                if let Err(err) = self.transport.send(id, frame) {
                    debug!(connection_id = %id, error = %err, "frame dropped");
                }
            }
        }
        for event in events {
            self.handle_protocol_event(event);
        }
    }

    fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Busy => {
                if self.state == State::Connected {
                    self.publish(Activity::Busy);
                }
            }
            ProtocolEvent::Idle => {
                if self.state != State::Connected {
                    return;
                }
                self.publish(Activity::Idle);
                if !self.config.continuous {
                    info!("replication complete");
                    self.state = State::Stopping;
                    self.close_connection(CloseStatus::websocket(close_code::NORMAL, "replication complete"));
                }
            }
            ProtocolEvent::Progress(progress) => {
                self.progress = progress;
                let activity = self.status.borrow().activity;
                self.publish(activity);
            }
            ProtocolEvent::DocumentEnded(document) => self.on_document_ended(document),
            ProtocolEvent::Checkpoint(checkpoint) => {
                let Some(checkpointer) = &mut self.checkpointer else {
                    return;
                };
                match checkpointer.update(checkpoint) {
                    Ok(Some(at)) => {
                        self.flush_at.get_or_insert(at);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "failed to save checkpoint"),
                }
            }
            ProtocolEvent::Close(status) => {
                debug!(%status, "protocol requested close");
                self.close_connection(status);
            }
        }
    }

    fn on_document_ended(&mut self, document: DocumentReplication) {
        if document.is_pull_conflict() {
            debug!(doc_id = %document.doc_id, "resolving pull conflict");
            let storage = Arc::clone(&self.storage);
            let doc_id = document.doc_id.clone();
            self.conflicts.spawn_blocking(move || {
                let result = storage.resolve_conflict(&doc_id);
                (doc_id, result)
            });
        } else if let Some(err) = &document.error {
            warn!(doc_id = %document.doc_id, is_push = document.is_push, error = %err, "document failed");
        }
        self.listeners.notify_document(&document);
    }

    fn handle_conflict_resolved(&mut self, result: Result<(String, StorageResult<()>), JoinError>) {
        match result {
            Ok((doc_id, Ok(()))) => debug!(%doc_id, "conflict resolved"),
            Ok((doc_id, Err(err))) => {
                warn!(%doc_id, error = %err, "conflict resolution failed");
                self.listeners.notify_document(&DocumentReplication {
                    doc_id,
                    rev_id: None,
                    is_push: false,
                    is_deleted: false,
                    error: Some(err.into()),
                });
            }
            Err(err) => warn!(error = %err, "conflict resolution task failed"),
        }
    }

    fn handle_local_changes(&mut self, changes: Vec<DocumentChange>) {
        if self.state == State::Connected {
            self.with_session(|session, ctx| session.on_local_change(ctx, &changes));
        }
    }

    fn handle_reachability(&mut self, change: Option<Reachability>) {
        match change {
            Some(Reachability::Reachable) => {
                if self.state == State::Offline && !self.suspended && self.retry_at.is_some() {
                    info!("network reachable; retrying now");
                    self.connect();
                }
            }
            Some(Reachability::Unreachable) => debug!("network unreachable"),
            None => self.reachability = None,
        }
    }

    fn handle_app_state(&mut self, state: Option<AppState>) {
        match state {
            Some(AppState::Suspended) if !self.suspended => {
                info!("suspending replication");
                self.suspended = true;
                match self.state {
                    State::Connecting | State::Connected => {
                        self.close_connection(CloseStatus::websocket(close_code::GOING_AWAY, "suspended"))
                    }
                    State::Offline => {
                        self.retry_at = None;
                        self.reachability = None;
                    }
                    State::Stopped | State::Stopping => {}
                }
            }
            Some(AppState::Active) if self.suspended => {
                info!("resuming replication");
                self.suspended = false;
                if self.state == State::Offline {
                    self.connect();
                }
            }
            Some(_) => {}
            None => self.lifecycle = None,
        }
    }

    fn stop_with_error(&mut self, error: ReplicatorError) {
        warn!(error = %error, "stopping after error");
        self.state = State::Stopping;
        self.pending_error = Some(error);
        if self.connection.is_some() {
            self.close_connection(CloseStatus::websocket(close_code::INTERNAL_ERROR, "replicator error"));
        } else {
            let error = self.pending_error.take();
            self.finish_stop(error);
        }
    }

    fn close_connection(&mut self, status: CloseStatus) {
        match self.connection {
            Some(id) => self.transport.close(id, status),
            None => {
                if self.state == State::Stopping {
                    let error = self.pending_error.take();
                    self.finish_stop(error);
                }
            }
        }
    }

    fn finish_stop(&mut self, error: Option<ReplicatorError>) {
        self.retry_at = None;
        self.reachability = None;
        self.lifecycle = None;
        self.suspended = false;
        self.flush_checkpoint();
        self.flush_at = None;
        self.checkpointer = None;
        if let Some(id) = self.change_listener.take() {
            self.storage.remove_change_listener(id);
        }

        self.state = State::Stopped;
        match &error {
            Some(err) => warn!(error = %err, "replicator stopped"),
            None => info!("replicator stopped"),
        }
        self.publish_status(Activity::Stopped, error);

        if std::mem::take(&mut self.restart) {
            self.start();
        }
    }

    fn flush_checkpoint(&mut self) {
        if let Some(checkpointer) = &mut self.checkpointer {
            if let Err(err) = checkpointer.flush() {
                warn!(error = %err, "failed to save checkpoint");
            }
        }
    }

    /// Handle dropped: close whatever is open.
    fn shutdown(&mut self) {
        if let Some(id) = self.connection.take() {
            self.transport
                .close(id, CloseStatus::websocket(close_code::GOING_AWAY, "replicator dropped"));
        }
        self.flush_checkpoint();
        if let Some(id) = self.change_listener.take() {
            self.storage.remove_change_listener(id);
        }
        debug!("replicator task finished");
    }

    fn publish(&mut self, activity: Activity) {
        self.publish_status(activity, None);
    }

    fn publish_status(&mut self, activity: Activity, error: Option<ReplicatorError>) {
        let status = ReplicatorStatus {
            activity,
            progress: self.progress,
            error,
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            debug!(?activity, completed = status.progress.completed, total = status.progress.total, "status changed");
            self.listeners.notify_status(&status);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_reachability(watch: &mut Option<ReachabilityWatch>) -> Option<Reachability> {
    match watch {
        Some(watch) => watch.changed().await,
        None => std::future::pending().await,
    }
}

async fn next_app_state(lifecycle: &mut Option<watch::Receiver<AppState>>) -> Option<AppState> {
    match lifecycle {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
