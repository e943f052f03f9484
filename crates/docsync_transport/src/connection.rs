//! Per-connection control queue, read loop and write loop.
//!
//! Each connection runs three tasks that share no mutable state except
//! through messages:
//!
//! - the **control queue** owns the connection phase and is the only task
//!   that emits [`TransportEvent`]s; it never touches the socket
//! - the **read loop** owns the read half and blocks on the receive gate
//!   and on socket reads
//! - the **write loop** owns the write half and writes queued frames in
//!   FIFO order
//!
//! The receive gate counts delivered-but-unacknowledged bytes. Reading
//! pauses while the count is at or above the high-water mark and resumes
//! once [`TransportManager::receive_complete`](crate::TransportManager::receive_complete)
//! brings it back below.

use crate::config::{ConnectionOptions, TransportConfig};
use crate::error::{CloseKind, CloseStatus, NetworkErrorKind, TransportError, TransportResult};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stream::{establish, BoxedStream, Connector, Established};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Events reported to the owner of a connection, in occurrence order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The upgrade succeeded; the connection carries raw bytes from now on.
    Opened {
        /// Final URL after redirects.
        url: Url,
        /// Cookies set by the server during the handshake.
        cookies: Vec<(String, String)>,
        /// Sub-protocol selected by the server.
        protocol: Option<String>,
    },
    /// Bytes arrived. Acknowledge them once processed.
    Received(Bytes),
    /// A frame of this many bytes was written to the socket.
    WriteCompleted(usize),
    /// The connection is gone. Always the last event, sent exactly once.
    Closed(CloseStatus),
}

/// A [`TransportEvent`] tagged with its connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    /// Connection the event belongs to.
    pub id: ConnectionId,
    /// The event.
    pub event: TransportEvent,
}

/// Messages processed by the control queue.
enum Control {
    Established(TransportResult<Established>),
    Send(Bytes),
    ReceiveComplete(usize),
    Close(CloseStatus),
    Received(Bytes),
    WriteCompleted(usize),
    ReadEnded(Option<io::Error>),
    WriteFailed(io::Error),
    Drained,
}

/// Cloneable handle that enqueues requests on a connection's control queue.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl ConnectionHandle {
    pub(crate) fn send(&self, data: Bytes) -> TransportResult<()> {
        self.control
            .send(Control::Send(data))
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn receive_complete(&self, bytes: usize) -> TransportResult<()> {
        self.control
            .send(Control::ReceiveComplete(bytes))
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn close(&self, status: CloseStatus) {
        // Already finished connections have nothing left to close.
        let _ = self.control.send(Control::Close(status));
    }
}

/// Starts a connection: registers it and spawns its control queue.
pub(crate) fn spawn(
    id: ConnectionId,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    registry: ConnectionRegistry,
) -> ConnectionHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        control: control_tx.clone(),
    };
    registry.insert(id, handle.clone());

    let connect_task = {
        let control = control_tx.clone();
        let handshake_timeout = config.handshake_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(handshake_timeout, establish(connector.as_ref(), &options))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::network(
                        NetworkErrorKind::Timeout,
                        "handshake timed out",
                    ))
                });
            let _ = control.send(Control::Established(result));
        })
    };

    let (shutdown, _) = watch::channel(false);
    let queue = ControlQueue {
        id,
        gate: Arc::new(ReceiveGate::new(config.high_water_mark)),
        config,
        events,
        control: control_tx,
        registry,
        phase: Phase::Connecting,
        connect_task: Some(connect_task),
        writer: None,
        read_task: None,
        write_task: None,
        shutdown: Arc::new(shutdown),
        close_status: None,
    };
    tokio::spawn(queue.run(control_rx));
    handle
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct ControlQueue {
    id: ConnectionId,
    config: TransportConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    control: mpsc::UnboundedSender<Control>,
    registry: ConnectionRegistry,
    phase: Phase,
    connect_task: Option<JoinHandle<()>>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    gate: Arc<ReceiveGate>,
    /// First close reason wins.
    close_status: Option<CloseStatus>,
}

impl ControlQueue {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Control>) {
        while let Some(message) = inbox.recv().await {
            self.handle(message);
            if self.phase == Phase::Closed {
                break;
            }
        }
    }

    fn handle(&mut self, message: Control) {
        match message {
            Control::Established(Ok(established)) => self.on_established(established),
            Control::Established(Err(err)) => {
                if self.phase == Phase::Connecting {
                    info!(connection_id = %self.id, error = %err, "connection failed");
                    self.close_status = Some(err.close_status());
                }
                self.finish();
            }
            Control::Send(data) => match (&self.writer, self.phase) {
                (Some(writer), Phase::Open) => {
                    let _ = writer.send(data);
                }
                _ => debug!(connection_id = %self.id, len = data.len(), "dropping frame on closed connection"),
            },
            Control::ReceiveComplete(bytes) => self.gate.release(bytes),
            Control::Close(status) => match self.phase {
                Phase::Connecting => {
                    if let Some(task) = self.connect_task.take() {
                        task.abort();
                    }
                    self.close_status = Some(status);
                    self.finish();
                }
                Phase::Open => self.begin_close(status, true),
                Phase::Closing | Phase::Closed => {
                    debug!(connection_id = %self.id, "ignoring duplicate close request")
                }
            },
            Control::Received(data) => {
                if self.phase == Phase::Open {
                    self.emit(TransportEvent::Received(data));
                }
            }
            Control::WriteCompleted(bytes) => {
                if self.phase == Phase::Open {
                    self.emit(TransportEvent::WriteCompleted(bytes));
                }
            }
            Control::ReadEnded(error) => {
                if self.phase == Phase::Open {
                    let status = match error {
                        Some(err) => CloseStatus::new(CloseKind::Io(err.kind()), err.to_string()),
                        None => CloseStatus::normal(),
                    };
                    self.begin_close(status, false);
                }
            }
            Control::WriteFailed(err) => {
                if self.phase == Phase::Open {
                    let status = CloseStatus::new(CloseKind::Io(err.kind()), err.to_string());
                    self.begin_close(status, false);
                }
            }
            Control::Drained => self.finish(),
        }
    }

    fn on_established(&mut self, established: Established) {
        self.connect_task = None;
        if self.phase != Phase::Connecting {
            // Close won the race; drop the stream.
            return;
        }

        let Established {
            stream,
            leftover,
            url,
            cookies,
            protocol,
        } = established;
        info!(connection_id = %self.id, %url, "connection opened");

        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        self.writer = Some(frames_tx);
        self.phase = Phase::Open;
        self.emit(TransportEvent::Opened {
            url,
            cookies,
            protocol,
        });

        self.write_task = Some(tokio::spawn(write_loop(
            writer,
            frames_rx,
            self.shutdown.subscribe(),
            self.control.clone(),
        )));
        self.read_task = Some(tokio::spawn(read_loop(
            reader,
            leftover,
            Arc::clone(&self.gate),
            self.config.read_buffer_size,
            self.shutdown.subscribe(),
            self.control.clone(),
        )));
    }

    /// Stops both loops, then reports `Drained` back to this queue.
    ///
    /// A graceful close lets the write loop flush queued frames first.
    fn begin_close(&mut self, status: CloseStatus, graceful: bool) {
        debug!(connection_id = %self.id, %status, graceful, "closing connection");
        self.close_status.get_or_insert(status);
        self.phase = Phase::Closing;
        self.writer = None;
        if !graceful {
            self.shutdown.send_replace(true);
        }

        let write_task = self.write_task.take();
        let read_task = self.read_task.take();
        let shutdown = Arc::clone(&self.shutdown);
        let control = self.control.clone();
        let drain = self.config.drain_timeout;
        let id = self.id;
        tokio::spawn(async move {
            if let Some(mut task) = write_task {
                if tokio::time::timeout(drain, &mut task).await.is_err() {
                    warn!(connection_id = %id, "write loop did not drain in time");
                    task.abort();
                }
            }
            shutdown.send_replace(true);
            if let Some(mut task) = read_task {
                if tokio::time::timeout(drain, &mut task).await.is_err() {
                    warn!(connection_id = %id, "read loop did not stop in time");
                    task.abort();
                }
            }
            let _ = control.send(Control::Drained);
        });
    }

    fn finish(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.phase = Phase::Closed;
        self.registry.remove(&self.id);
        let status = self.close_status.take().unwrap_or_else(CloseStatus::normal);
        info!(connection_id = %self.id, %status, "connection closed");
        self.emit(TransportEvent::Closed(status));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(ConnectionEvent { id: self.id, event });
    }
}

/// Counts received bytes not yet acknowledged by the consumer.
pub(crate) struct ReceiveGate {
    high_water_mark: usize,
    pending: watch::Sender<usize>,
}

impl ReceiveGate {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            high_water_mark,
            pending,
        }
    }

    pub(crate) fn add(&self, bytes: usize) {
        self.pending.send_modify(|pending| *pending += bytes);
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(bytes));
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Waits until the unacknowledged count is below the high-water mark.
    pub(crate) async fn wait_open(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|p| *p < self.high_water_mark).await;
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    leftover: Vec<u8>,
    gate: Arc<ReceiveGate>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
    control: mpsc::UnboundedSender<Control>,
) {
    if !leftover.is_empty() {
        gate.add(leftover.len());
        if control.send(Control::Received(Bytes::from(leftover))).is_err() {
            return;
        }
    }

    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            _ = gate.wait_open() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            result = reader.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                let _ = control.send(Control::ReadEnded(None));
                return;
            }
            Ok(n) => {
                gate.add(n);
                let data = Bytes::copy_from_slice(&buf[..n]);
                if control.send(Control::Received(data)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = control.send(Control::ReadEnded(Some(err)));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    control: mpsc::UnboundedSender<Control>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            // Queue closed and drained: graceful close.
            let _ = writer.shutdown().await;
            return;
        };

        let len = frame.len();
        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            result = write_frame(&mut writer, &frame) => result,
        };
        match result {
            Ok(()) => {
                if control.send(Control::WriteCompleted(len)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = control.send(Control::WriteFailed(err));
                return;
            }
        }
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxedStream>, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
