//! One live TCP connection with its read and write workers.
//!
//! A session owns its socket exclusively. After connecting, a receive
//! worker turns inbound frames into message callbacks and a send worker
//! drains the outbound queue; both exit on disconnect or socket failure.
//! Socket errors never reach the send APIs directly — they surface
//! through the status and error callbacks plus the session metrics, and
//! the caller decides whether to dial again.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::TcpConnectionConfig;
use crate::connection::framing;
use crate::connection::tcp::apply_socket_options;
use crate::error::CommError;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpSessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl TcpSessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            4 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct SessionCallbacks {
    message: Option<MessageCallback>,
    status: Option<StatusCallback>,
    error: Option<ErrorCallback>,
}

#[derive(Default)]
pub(crate) struct SessionCounters {
    connections_established: AtomicU64,
    connections_dropped: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    error_count: AtomicU64,
    timeout_count: AtomicU64,
    average_latency: AtomicU64,
}

/// Snapshot of per-session transport metrics. Latency is the smoothed
/// per-send write time in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub connections_established: u64,
    pub connections_dropped: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub average_latency: f64,
}

impl SessionMetrics {
    /// Field-wise sum, used by the server to aggregate client sessions.
    pub fn merge(&mut self, other: &SessionMetrics) {
        self.connections_established += other.connections_established;
        self.connections_dropped += other.connections_dropped;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.error_count += other.error_count;
        self.timeout_count += other.timeout_count;
        if other.average_latency > 0.0 {
            self.average_latency = if self.average_latency == 0.0 {
                other.average_latency
            } else {
                (self.average_latency + other.average_latency) / 2.0
            };
        }
    }
}

/// A client session: one socket, one receive worker, one send worker.
pub struct TcpSession {
    client_id: String,
    config: TcpConnectionConfig,
    state: AtomicU8,
    running: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    send_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    callbacks: Mutex<SessionCallbacks>,
    counters: SessionCounters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSession {
    pub fn new(client_id: impl Into<String>, config: TcpConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            config,
            state: AtomicU8::new(TcpSessionState::Disconnected as u8),
            running: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            send_tx: Mutex::new(None),
            callbacks: Mutex::new(SessionCallbacks::default()),
            counters: SessionCounters::default(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> TcpSessionState {
        TcpSessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TcpSessionState::Connected
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_connection_status_callback(&self, callback: StatusCallback) {
        self.callbacks.lock().unwrap().status = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.callbacks.lock().unwrap().error = Some(callback);
    }

    /// Dials the configured server. Returns `true` when the session ends
    /// up connected; calling on an already-connected session is a no-op
    /// returning `true`.
    pub async fn connect(self: &Arc<Self>) -> bool {
        if self.is_connected() {
            return true;
        }
        self.set_state(TcpSessionState::Connecting);

        let address = format!("{}:{}", self.config.server_address, self.config.server_port);
        let attempt = TcpStream::connect(&address);
        let stream = match tokio::time::timeout(self.config.connect_timeout(), attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail_connect(&address, &e.to_string());
                return false;
            }
            Err(_) => {
                self.counters.timeout_count.fetch_add(1, Ordering::Relaxed);
                self.fail_connect(&address, "connect timed out");
                return false;
            }
        };

        debug!("TcpSession[{}]: connected to {}", self.client_id, address);
        self.adopt_stream(stream).await;
        true
    }

    /// Takes ownership of an established stream (server accept path or a
    /// successful dial), applies socket options and starts the workers.
    pub(crate) async fn adopt_stream(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = apply_socket_options(&stream, &self.config) {
            warn!("TcpSession[{}]: socket options failed: {}", self.client_id, e);
        }

        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::with_capacity(self.config.buffer_size, read_half);
        *self.writer.lock().await = Some(write_half);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        *self.send_tx.lock().unwrap() = Some(send_tx);

        self.running.store(true, Ordering::SeqCst);
        self.set_state(TcpSessionState::Connected);
        self.counters
            .connections_established
            .fetch_add(1, Ordering::Relaxed);

        let mut workers = self.workers.lock().unwrap();
        workers.push(tokio::spawn(Arc::clone(self).receive_worker(reader)));
        workers.push(tokio::spawn(Arc::clone(self).send_worker(send_rx)));
        drop(workers);

        self.notify_status(true);
    }

    /// Tears the session down. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let was_connected = self.is_connected();
        if was_connected {
            self.set_state(TcpSessionState::Disconnecting);
        }
        self.running.store(false, Ordering::SeqCst);
        self.send_tx.lock().unwrap().take();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        self.writer.lock().await.take();
        self.set_state(TcpSessionState::Disconnected);
        if was_connected {
            debug!("TcpSession[{}]: disconnected", self.client_id);
            self.notify_status(false);
        }
    }

    /// Queues one message for the send worker. The returned flag is an
    /// acceptance gate only — `true` means the session took the message,
    /// not that the peer received it.
    pub fn send_message(&self, message: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        let tx = self.send_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Writes one message directly on the caller task, bypassing the
    /// queue, and reports per-call success.
    pub async fn send_message_sync(&self, message: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let started = Instant::now();
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        let write = framing::write_frame(writer, message.as_bytes());
        match tokio::time::timeout(self.config.write_timeout(), write).await {
            Ok(Ok(())) => {
                drop(guard);
                self.record_send(message.len(), started);
                true
            }
            Ok(Err(e)) => {
                drop(guard);
                self.report_error(format!("send failed: {}", e));
                false
            }
            Err(_) => {
                drop(guard);
                self.counters.timeout_count.fetch_add(1, Ordering::Relaxed);
                self.report_error(String::from("send timed out"));
                false
            }
        }
    }

    pub fn metrics(&self) -> SessionMetrics {
        let c = &self.counters;
        SessionMetrics {
            connections_established: c.connections_established.load(Ordering::Relaxed),
            connections_dropped: c.connections_dropped.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            error_count: c.error_count.load(Ordering::Relaxed),
            timeout_count: c.timeout_count.load(Ordering::Relaxed),
            average_latency: f64::from_bits(c.average_latency.load(Ordering::Relaxed)),
        }
    }

    // --- workers ---

    async fn receive_worker(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        debug!("TcpSession[{}]: receive worker started", self.client_id);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match framing::read_frame(&mut reader).await {
                Ok(message) => {
                    self.counters
                        .messages_received
                        .fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_received
                        .fetch_add(message.len() as u64, Ordering::Relaxed);
                    self.deliver_message(message);
                }
                Err(CommError::PeerClosed) => {
                    self.counters
                        .connections_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    self.on_socket_closed("peer closed the connection");
                    break;
                }
                Err(e) => {
                    self.report_error(format!("receive failed: {}", e));
                    self.on_socket_closed(&e.to_string());
                    break;
                }
            }
        }
        debug!("TcpSession[{}]: receive worker stopped", self.client_id);
    }

    async fn send_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        debug!("TcpSession[{}]: send worker started", self.client_id);
        while let Some(message) = rx.recv().await {
            let started = Instant::now();
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else { break };

            match framing::write_frame(writer, message.as_bytes()).await {
                Ok(()) => {
                    drop(guard);
                    self.record_send(message.len(), started);
                }
                Err(e) => {
                    drop(guard);
                    // The receive worker observes the closed socket and
                    // drives the state change; just count and report.
                    self.report_error(format!("queued send failed: {}", e));
                }
            }
        }
        debug!("TcpSession[{}]: send worker stopped", self.client_id);
    }

    // --- helpers ---

    fn set_state(&self, state: TcpSessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn fail_connect(&self, address: &str, reason: &str) {
        self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(TcpSessionState::Error);
        self.report_error(format!("connect to {} failed: {}", address, reason));
        self.set_state(TcpSessionState::Disconnected);
    }

    /// Connected → Error → Disconnected transition driven by the receive
    /// worker. The status callback fires exactly once per drop.
    fn on_socket_closed(&self, reason: &str) {
        let transitioned = self
            .state
            .compare_exchange(
                TcpSessionState::Connected as u8,
                TcpSessionState::Error as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        self.running.store(false, Ordering::SeqCst);
        self.send_tx.lock().unwrap().take();

        if transitioned {
            warn!("TcpSession[{}]: connection lost: {}", self.client_id, reason);
            self.notify_status(false);
            self.set_state(TcpSessionState::Disconnected);
        }
    }

    fn record_send(&self, bytes: usize, started: Instant) {
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let sample = started.elapsed().as_secs_f64() * 1000.0;
        let current = f64::from_bits(self.counters.average_latency.load(Ordering::Relaxed));
        let next = if current == 0.0 { sample } else { (current + sample) / 2.0 };
        self.counters
            .average_latency
            .store(next.to_bits(), Ordering::Relaxed);
    }

    fn deliver_message(&self, message: String) {
        let callback = self.callbacks.lock().unwrap().message.clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                error!("TcpSession[{}]: message callback panicked", self.client_id);
            }
        }
    }

    fn notify_status(&self, connected: bool) {
        let callback = self.callbacks.lock().unwrap().status.clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(connected))).is_err() {
                error!("TcpSession[{}]: status callback panicked", self.client_id);
            }
        }
    }

    fn report_error(&self, error: String) {
        self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        let callback = self.callbacks.lock().unwrap().error.clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                error!("TcpSession[{}]: error callback panicked", self.client_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, TcpConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let config = TcpConnectionConfig::client(address.ip().to_string(), address.port());
        (listener, config)
    }

    #[tokio::test]
    async fn connect_transitions_to_connected() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        assert!(session.connect().await);
        assert_eq!(session.state(), TcpSessionState::Connected);
        assert!(session.is_connected());
        // Idempotent.
        assert!(session.connect().await);
        assert_eq!(session.metrics().connections_established, 1);

        let _peer = accept.await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), TcpSessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_ends_disconnected() {
        let mut config = TcpConnectionConfig::client("127.0.0.1", 1);
        config.connect_timeout = 300;
        let session = TcpSession::new("c1", config);
        assert!(!session.connect().await);
        assert_eq!(session.state(), TcpSessionState::Disconnected);
        assert!(session.metrics().error_count >= 1);
    }

    #[tokio::test]
    async fn queued_sends_arrive_in_order() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            for _ in 0..3 {
                received.push(framing::read_frame(&mut socket).await.unwrap());
            }
            received
        });

        assert!(session.connect().await);
        assert!(session.send_message(String::from("one")));
        assert!(session.send_message(String::from("two")));
        assert!(session.send_message(String::from("three")));

        let received = server.await.unwrap();
        assert_eq!(received, vec!["one", "two", "three"]);
        assert_eq!(session.metrics().messages_sent, 3);
        assert!(session.metrics().bytes_sent >= 11);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn sync_send_reports_success() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            framing::read_frame(&mut socket).await.unwrap()
        });

        assert!(session.connect().await);
        assert!(session.send_message_sync("direct").await);
        assert_eq!(server.await.unwrap(), "direct");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn send_without_connection_is_rejected() {
        let session = TcpSession::new("c1", TcpConnectionConfig::client("127.0.0.1", 9));
        assert!(!session.send_message(String::from("nope")));
        assert!(!session.send_message_sync("nope").await);
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_callback() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        session.set_message_callback(Arc::new(move |message| {
            sink.lock().unwrap().push(message);
        }));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            framing::write_frame(&mut socket, b"{\"command\":\"pong\"}")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            socket
        });

        assert!(session.connect().await);
        let _socket = server.await.unwrap();
        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(received.lock().unwrap().as_slice(), ["{\"command\":\"pong\"}"]);
        assert_eq!(session.metrics().messages_received, 1);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn peer_close_fires_status_callback_once() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        session.set_connection_status_callback(Arc::new(move |connected| {
            sink.lock().unwrap().push(connected);
        }));

        let server = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        assert!(session.connect().await);
        let peer = server.await.unwrap();
        drop(peer); // peer closes

        for _ in 0..100 {
            if session.state() == TcpSessionState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(session.state(), TcpSessionState::Disconnected);
        let statuses = statuses.lock().unwrap().clone();
        assert_eq!(statuses, vec![true, false]);
        assert_eq!(session.metrics().connections_dropped, 1);
    }

    #[tokio::test]
    async fn panicking_message_callback_keeps_worker_alive() {
        let (listener, config) = listener().await;
        let session = TcpSession::new("c1", config);
        session.set_message_callback(Arc::new(|_| panic!("handler bug")));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            framing::write_frame(&mut socket, b"first").await.unwrap();
            framing::write_frame(&mut socket, b"second").await.unwrap();
            socket
        });

        assert!(session.connect().await);
        let _socket = server.await.unwrap();
        for _ in 0..100 {
            if session.metrics().messages_received >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Both frames were read despite the panicking callback.
        assert_eq!(session.metrics().messages_received, 2);
        assert!(session.is_connected());
        session.disconnect().await;
    }
}
