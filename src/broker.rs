//! Kafka broker connection interface.
//!
//! A single task owns the TCP connection to the broker and serializes every operation on it. The
//! handle talks to the task over a channel; the task moves between the `Absent`, `Connecting` and
//! `Established` states, and a connect requested while one is already in flight joins that attempt
//! instead of opening another socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::prelude::*;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::codec::{self, KafkaReader, KafkaWriter, Response};
use crate::error::BrokerErrorKind;

type BrokerResult = Result<(), BrokerErrorKind>;
type ResultTx = oneshot::Sender<BrokerResult>;

/// The state of a broker connection, as observed by handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists.
    Absent,
    /// A connection attempt is in flight.
    Connecting,
    /// A live connection exists.
    Established,
}

pub(crate) enum Msg {
    /// Ensure a connection exists, resolving once it does or once the attempt fails.
    Connect(ResultTx),
    /// Write a frame to the connection.
    Write(Bytes, ResultTx),
}

/// A handle to a broker connection.
pub(crate) struct Broker {
    chan: mpsc::Sender<Msg>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU64>,
    _shutdown: DropGuard,
}

impl Broker {
    /// Create a new instance. No connection is opened until one is requested.
    pub(crate) fn new(addr: String, keepalive: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1_000);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Absent);
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let task = BrokerTask::new(addr, keepalive, rx, state_tx, attempts.clone(), shutdown.clone());
        tokio::spawn(task.run());
        Broker {
            chan: tx,
            state: state_rx,
            attempts,
            _shutdown: shutdown.drop_guard(),
        }
    }

    /// Ensure a connection to the broker exists.
    ///
    /// Resolves immediately if a connection is established, joins the in-flight attempt if the
    /// broker is being connected to, and otherwise starts a new attempt. Every caller waiting on an
    /// attempt observes the same outcome.
    pub(crate) async fn connect(&self) -> BrokerResult {
        let (tx, rx) = oneshot::channel();
        self.chan.send(Msg::Connect(tx)).await.map_err(|_| BrokerErrorKind::Disconnected)?;
        rx.await.unwrap_or(Err(BrokerErrorKind::Disconnected))
    }

    /// Write a frame to the live connection.
    ///
    /// Fails with `BrokerErrorKind::SocketClosed` if there is no connection or the broker has closed
    /// it. Writes issued while a connection attempt is in flight are sent once it completes.
    pub(crate) async fn write(&self, frame: Bytes) -> BrokerResult {
        let (tx, rx) = oneshot::channel();
        self.chan.send(Msg::Write(frame, tx)).await.map_err(|_| BrokerErrorKind::Disconnected)?;
        rx.await.unwrap_or(Err(BrokerErrorKind::Disconnected))
    }

    /// The current state of the connection.
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver of connection state changes.
    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The number of connection attempts started, successful or not.
    pub(crate) fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }
}

/// All possible states in which a broker connection may exist.
enum BrokerState {
    Absent(BrokerAbsent),
    Connecting(BrokerConnecting),
    Established(BrokerEstablished),
    Terminated(BrokerTask),
}

/// The core state of a broker connection.
struct BrokerTask {
    /// The `host:port` address of the broker.
    addr: String,
    /// Interval of TCP keep-alive probes.
    keepalive: Duration,
    /// The channel used for communicating with this connection.
    chan: mpsc::Receiver<Msg>,
    /// Publishes the connection state to handles.
    state: watch::Sender<ConnectionState>,
    /// The number of connection attempts started over the life of this task.
    attempts: Arc<AtomicU64>,
    /// A shutdown signal for this broker connection.
    shutdown: CancellationToken,
    /// The number of connections established over the life of this task.
    connections: u64,
}

impl BrokerTask {
    /// Create a new instance.
    fn new(
        addr: String,
        keepalive: Duration,
        chan: mpsc::Receiver<Msg>,
        state: watch::Sender<ConnectionState>,
        attempts: Arc<AtomicU64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr,
            keepalive,
            chan,
            state,
            attempts,
            shutdown,
            connections: 0,
        }
    }

    async fn run(self) {
        // Core task loop as a state machine.
        let mut next = BrokerState::Absent(BrokerAbsent { inner: self });
        let state = loop {
            next = match next {
                BrokerState::Absent(inner) => inner.run().await,
                BrokerState::Connecting(inner) => inner.run().await,
                BrokerState::Established(inner) => inner.run().await,
                BrokerState::Terminated(inner) => break inner,
            }
        };
        tracing::trace!(broker = %state.addr, connections = state.connections, "broker connection terminated");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// The broker has no connection.
struct BrokerAbsent {
    inner: BrokerTask,
}

impl BrokerAbsent {
    #[tracing::instrument(level = "trace", parent = None, skip_all, fields(broker = %self.inner.addr))]
    async fn run(mut self) -> BrokerState {
        self.inner.set_state(ConnectionState::Absent);
        let shutdown = self.inner.shutdown.clone();
        loop {
            let msg = tokio::select! {
                msg = self.inner.chan.recv() => msg,
                _ = shutdown.cancelled() => return BrokerState::Terminated(self.inner),
            };
            match msg {
                Some(Msg::Connect(tx)) => return BrokerState::Connecting(BrokerConnecting::new(self.inner, tx)),
                Some(Msg::Write(_, tx)) => {
                    tracing::trace!("write requested with no connection to broker");
                    let _ = tx.send(Err(BrokerErrorKind::SocketClosed));
                }
                None => return BrokerState::Terminated(self.inner),
            }
        }
    }
}

/// The broker needs to (re-)connect.
struct BrokerConnecting {
    inner: BrokerTask,
    /// Callers waiting on the outcome of this connection attempt.
    waiters: Vec<ResultTx>,
    /// Writes received while connecting, sent in order once connected.
    deferred: Vec<(Bytes, ResultTx)>,
}

impl BrokerConnecting {
    fn new(inner: BrokerTask, waiter: ResultTx) -> Self {
        Self {
            inner,
            waiters: vec![waiter],
            deferred: Vec::new(),
        }
    }

    #[tracing::instrument(level = "trace", parent = None, skip_all, fields(broker = %self.inner.addr))]
    async fn run(mut self) -> BrokerState {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(attempt, "connecting to broker");
        self.inner.set_state(ConnectionState::Connecting);
        let shutdown = self.inner.shutdown.clone();
        let fut = try_connect(self.inner.addr.clone(), self.inner.keepalive);
        tokio::pin!(fut);
        // Queued messages are taken before the outcome, so everything sent ahead of it shares it.
        let res = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return BrokerState::Terminated(self.inner),
                Some(msg) = self.inner.chan.recv() => match msg {
                    Msg::Connect(tx) => {
                        tracing::trace!("connection attempt already in flight, waiting on it");
                        self.waiters.push(tx);
                    }
                    Msg::Write(frame, tx) => {
                        tracing::trace!(deferred = self.deferred.len() + 1, "write deferred until connected");
                        self.deferred.push((frame, tx));
                    }
                },
                res = &mut fut => break res,
            }
        };

        let Self { inner, waiters, deferred } = self;
        let (reader, writer) = match res {
            Ok(transport) => transport,
            Err(err) => {
                tracing::error!(error = %err, waiters = waiters.len(), "error connecting to broker");
                for tx in waiters {
                    let _ = tx.send(Err(err.clone()));
                }
                for (_, tx) in deferred {
                    let _ = tx.send(Err(err.clone()));
                }
                return BrokerState::Absent(BrokerAbsent { inner });
            }
        };

        let mut ready = BrokerEstablished { inner, reader, writer };
        ready.inner.connections += 1;
        ready.inner.set_state(ConnectionState::Established);
        tracing::debug!(connections = ready.inner.connections, waiters = waiters.len(), "connected to broker");

        // Writes issued during the attempt go out first, in the order they were issued.
        let mut closed = false;
        for (frame, tx) in deferred {
            if closed {
                let _ = tx.send(Err(BrokerErrorKind::SocketClosed));
                continue;
            }
            let res = ready.write(frame).await;
            closed = matches!(&res, Err(err) if err.is_socket_closed());
            let _ = tx.send(res);
        }
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }

        if closed {
            BrokerState::Absent(BrokerAbsent { inner: ready.inner })
        } else {
            BrokerState::Established(ready)
        }
    }
}

/// Open a socket to the broker & wrap it in framed codecs.
async fn try_connect(addr: String, keepalive: Duration) -> Result<(KafkaReader, KafkaWriter), BrokerErrorKind> {
    let conn = TcpStream::connect(&addr).await.map_err(BrokerErrorKind::from_connect_error)?;
    configure_socket(&conn, keepalive).map_err(|err| BrokerErrorKind::Unexpected(format!("{:#}", err)))?;
    Ok(codec::new_kafka_transport(conn, None))
}

/// Set TCP nodelay & keep-alive probing on the broker socket.
fn configure_socket(conn: &TcpStream, keepalive: Duration) -> anyhow::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(keepalive).with_interval(keepalive);
    let sock = socket2::SockRef::from(conn);
    sock.set_nodelay(true).context("error setting nodelay on broker socket")?;
    sock.set_tcp_keepalive(&keepalive).context("error configuring keepalive on broker socket")?;
    Ok(())
}

/// The broker is connected and ready for writes.
struct BrokerEstablished {
    inner: BrokerTask,
    reader: KafkaReader,
    writer: KafkaWriter,
}

impl BrokerEstablished {
    #[tracing::instrument(level = "trace", parent = None, skip_all, fields(broker = %self.inner.addr))]
    async fn run(mut self) -> BrokerState {
        // Main operations loop.
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                opt = self.reader.next() => {
                    if let Err(err) = handle_incoming_frame(opt) {
                        tracing::error!(error = ?err, "broker connection closed");
                        return BrokerState::Absent(BrokerAbsent { inner: self.inner });
                    }
                }
                Some(msg) = self.inner.chan.recv() => match msg {
                    Msg::Connect(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    Msg::Write(frame, tx) => {
                        let res = self.write(frame).await;
                        let closed = matches!(&res, Err(err) if err.is_socket_closed());
                        let _ = tx.send(res);
                        if closed {
                            return BrokerState::Absent(BrokerAbsent { inner: self.inner });
                        }
                    }
                },
                _ = shutdown.cancelled() => return BrokerState::Terminated(self.inner),
            }
        }
    }

    /// Write a single frame to the socket.
    async fn write(&mut self, frame: Bytes) -> BrokerResult {
        let len = frame.len();
        self.writer.send(frame).await.map_err(|err| {
            tracing::error!(error = ?err, len, "error writing frame to broker");
            BrokerErrorKind::from_write_error(err)
        })?;
        tracing::trace!(len, "frame written to broker");
        Ok(())
    }
}

/// Handle output from the connection framed decoder.
///
/// Responses are drained and dropped, as acknowledgements are not interpreted.
fn handle_incoming_frame(opt_res: Option<Result<Response, std::io::Error>>) -> anyhow::Result<()> {
    let resp = opt_res
        .context("broker connection ended by the broker")?
        .context("error reading response from broker, disconnecting")?;
    tracing::trace!(correlation_id = resp.correlation_id, len = resp.body.len(), "discarding broker response");
    Ok(())
}
