//! The communicator façade.
//!
//! [`TcpCommunicator`] wires the performance subsystems to the transport
//! layer and exposes the [`DeviceCommunicator`] contract device drivers
//! program against. One communicator is either a client (one session
//! toward a server) or a server (accept loop plus client registry),
//! decided by `is_server` in its configuration.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::batch::{Message, MessageBatcher};
use crate::config::{ConnectionPoolConfig, MessageBatcherConfig, TcpConnectionConfig};
use crate::connection::pool::ConnectionPool;
use crate::connection::server::TcpServer;
use crate::connection::session::TcpSession;
use crate::connection::tcp::TcpConnectionFactory;
use crate::context::CommContext;
use crate::error::CommError;
use crate::message::{CommunicationMessage, CommunicationResponse, CommunicationStats};
use crate::pool::StringPool;
use crate::serialize::SerializationOptimizer;

/// Transport protocols a communicator can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

pub type DeviceMessageCallback = Arc<dyn Fn(CommunicationMessage) + Send + Sync>;
pub type ConnectionStatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// The contract device drivers consume.
#[async_trait]
pub trait DeviceCommunicator: Send + Sync {
    /// Applies the configuration and connects (or starts the server).
    /// Connecting an already-connected communicator is a no-op that
    /// returns `true`.
    async fn connect(&self, config: &TcpConnectionConfig) -> bool;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    /// Queued send: the response reports acceptance into the outbound
    /// path, decoupled from socket delivery.
    async fn send_message(&self, message: CommunicationMessage) -> CommunicationResponse;
    /// Direct send: writes on the caller task and reports per-call
    /// success.
    async fn send_message_sync(&self, message: CommunicationMessage) -> CommunicationResponse;
    fn set_message_callback(&self, callback: DeviceMessageCallback);
    fn set_connection_status_callback(&self, callback: ConnectionStatusCallback);
    fn statistics(&self) -> CommunicationStats;
    fn reset_statistics(&self);
    fn supported_protocols(&self) -> Vec<Protocol>;
}

#[derive(Default)]
struct UserCallbacks {
    message: Option<DeviceMessageCallback>,
    status: Option<ConnectionStatusCallback>,
}

/// TCP implementation of [`DeviceCommunicator`].
///
/// Worker callbacks never capture the façade itself — they share only
/// the small pieces they need (stats, callbacks, the connected flag), so
/// dropping the communicator tears everything down cleanly.
pub struct TcpCommunicator {
    config: Mutex<TcpConnectionConfig>,
    connected: Arc<AtomicBool>,

    session: Arc<Mutex<Option<Arc<TcpSession>>>>,
    server: Mutex<Option<Arc<TcpServer>>>,

    string_pool: Option<Arc<StringPool>>,
    optimizer: Option<Arc<SerializationOptimizer>>,
    batcher: Mutex<Option<Arc<MessageBatcher>>>,
    connection_pool: Mutex<Option<Arc<ConnectionPool>>>,
    pool_config: Mutex<ConnectionPoolConfig>,

    callbacks: Arc<Mutex<UserCallbacks>>,
    stats: Arc<Mutex<CommunicationStats>>,

    batching_enabled: AtomicBool,
    pooling_enabled: AtomicBool,
    memory_pooling_enabled: AtomicBool,
    serialization_enabled: AtomicBool,
}

impl TcpCommunicator {
    /// A communicator using the process-wide context when one has been
    /// installed (see [`crate::context::init_global`]), else a bare one
    /// where serialization goes straight through `serde_json`.
    pub fn new(config: TcpConnectionConfig) -> Arc<Self> {
        match crate::context::global() {
            Some(context) => Self::with_context(config, &context),
            None => Self::build(config, None, None),
        }
    }

    /// A communicator sharing the context's string pool and optimizer.
    pub fn with_context(config: TcpConnectionConfig, context: &CommContext) -> Arc<Self> {
        Self::build(
            config,
            Some(context.string_pool()),
            Some(context.optimizer()),
        )
    }

    fn build(
        config: TcpConnectionConfig,
        string_pool: Option<Arc<StringPool>>,
        optimizer: Option<Arc<SerializationOptimizer>>,
    ) -> Arc<Self> {
        debug!("TcpCommunicator: created, server mode: {}", config.is_server);
        Arc::new(Self {
            config: Mutex::new(config),
            connected: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(None)),
            server: Mutex::new(None),
            string_pool,
            optimizer,
            batcher: Mutex::new(None),
            connection_pool: Mutex::new(None),
            pool_config: Mutex::new(ConnectionPoolConfig {
                min_connections: 0,
                initial_connections: 0,
                ..Default::default()
            }),
            callbacks: Arc::new(Mutex::new(UserCallbacks::default())),
            stats: Arc::new(Mutex::new(CommunicationStats::default())),
            batching_enabled: AtomicBool::new(true),
            pooling_enabled: AtomicBool::new(false),
            memory_pooling_enabled: AtomicBool::new(true),
            serialization_enabled: AtomicBool::new(true),
        })
    }

    pub fn set_tcp_configuration(&self, config: TcpConnectionConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn tcp_configuration(&self) -> TcpConnectionConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn is_server_mode(&self) -> bool {
        self.config.lock().unwrap().is_server
    }

    pub fn enable_message_batching(&self, enabled: bool) {
        self.batching_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enable_connection_pooling(&self, enabled: bool) {
        self.pooling_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enable_memory_pooling(&self, enabled: bool) {
        self.memory_pooling_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enable_serialization_optimization(&self, enabled: bool) {
        self.serialization_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_connection_pool_config(&self, config: ConnectionPoolConfig) {
        *self.pool_config.lock().unwrap() = config;
    }

    /// Server mode: ids of the currently connected clients.
    pub fn connected_clients(&self) -> Vec<String> {
        match self.server.lock().unwrap().as_ref() {
            Some(server) => server.connected_clients(),
            None => Vec::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        match self.server.lock().unwrap().as_ref() {
            Some(server) => server.client_count(),
            None => 0,
        }
    }

    /// Server mode: the actual listening port (resolves port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.server.lock().unwrap().as_ref().map(|s| s.local_port())
    }

    /// Transport metrics: the client session's, or the server aggregate.
    pub fn tcp_metrics(&self) -> crate::connection::session::SessionMetrics {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            return session.metrics();
        }
        if let Some(server) = self.server.lock().unwrap().as_ref() {
            return server.aggregated_metrics();
        }
        Default::default()
    }

    /// Client mode: the lazily created auxiliary connection pool. The
    /// pool fronts extra framed channels toward the same server, next to
    /// the primary session.
    pub async fn connection_pool(&self) -> Option<Arc<ConnectionPool>> {
        if !self.pooling_enabled.load(Ordering::SeqCst) || self.is_server_mode() {
            return None;
        }
        if let Some(pool) = self.connection_pool.lock().unwrap().as_ref() {
            return Some(Arc::clone(pool));
        }

        let factory = Arc::new(TcpConnectionFactory::new(self.tcp_configuration()));
        let pool = ConnectionPool::new(factory, self.pool_config.lock().unwrap().clone());
        if pool.start().await.is_err() {
            return None;
        }

        // A concurrent caller may have won the race; keep theirs.
        let existing = {
            let mut slot = self.connection_pool.lock().unwrap();
            match slot.as_ref() {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    *slot = Some(Arc::clone(&pool));
                    None
                }
            }
        };
        match existing {
            Some(existing) => {
                pool.shutdown().await;
                Some(existing)
            }
            None => Some(pool),
        }
    }

    // --- internals ---

    fn serialize_envelope(&self, message: &CommunicationMessage) -> crate::error::Result<String> {
        let envelope = message.to_json();
        let serialized = match (&self.optimizer, self.serialization_enabled.load(Ordering::SeqCst)) {
            (Some(optimizer), true) => optimizer.serialize(&envelope)?,
            _ => serde_json::to_string(&envelope)?,
        };

        // Stage the wire bytes in a pooled buffer so repeated sends reuse
        // allocations instead of growing fresh strings.
        if self.memory_pooling_enabled.load(Ordering::SeqCst) {
            if let Some(pool) = &self.string_pool {
                if let Some(mut buffer) = pool.acquire() {
                    buffer.clear();
                    buffer.push_str(&serialized);
                    return Ok(buffer.clone());
                }
            }
        }
        Ok(serialized)
    }

    fn deserialize_envelope(
        optimizer: &Option<Arc<SerializationOptimizer>>,
        raw: &str,
    ) -> CommunicationMessage {
        let parsed: crate::error::Result<Value> = match optimizer {
            Some(optimizer) => optimizer.deserialize(raw),
            None => serde_json::from_str(raw).map_err(CommError::from),
        };
        match parsed.and_then(|value| CommunicationMessage::from_json(&value)) {
            Ok(message) => message,
            Err(e) => {
                warn!("TcpCommunicator: failed to parse inbound message: {}", e);
                CommunicationMessage::parse_failure(raw, &e.to_string())
            }
        }
    }

    async fn start_server(&self, config: &TcpConnectionConfig) -> bool {
        let server = TcpServer::new(config.clone());

        let stats = Arc::clone(&self.stats);
        let callbacks = Arc::clone(&self.callbacks);
        let optimizer = self.optimizer.clone();
        server.set_message_received_callback(Arc::new(move |client_id, raw| {
            debug!("TcpCommunicator: message from client {}", client_id);
            let message = Self::deserialize_envelope(&optimizer, &raw);
            stats.lock().unwrap().record_received();
            let callback = callbacks.lock().unwrap().message.clone();
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                    stats.lock().unwrap().messages_error += 1;
                }
            }
        }));

        let callbacks = Arc::clone(&self.callbacks);
        server.set_client_connected_callback(Arc::new(move |client_id| {
            info!("TcpCommunicator: client connected: {}", client_id);
            let callback = callbacks.lock().unwrap().status.clone();
            if let Some(callback) = callback {
                callback(true);
            }
        }));

        server.set_client_disconnected_callback(Arc::new(|client_id| {
            info!("TcpCommunicator: client disconnected: {}", client_id);
        }));

        let stats = Arc::clone(&self.stats);
        server.set_error_callback(Arc::new(move |error| {
            warn!("TcpCommunicator: server error: {}", error);
            stats.lock().unwrap().messages_error += 1;
        }));

        match server.start().await {
            Ok(()) => {
                *self.server.lock().unwrap() = Some(server);
                true
            }
            Err(e) => {
                warn!("TcpCommunicator: server start failed: {}", e);
                false
            }
        }
    }

    async fn start_client(&self, config: &TcpConnectionConfig) -> bool {
        let session = TcpSession::new("main_client", config.clone());

        let stats = Arc::clone(&self.stats);
        let callbacks = Arc::clone(&self.callbacks);
        let optimizer = self.optimizer.clone();
        session.set_message_callback(Arc::new(move |raw| {
            let message = Self::deserialize_envelope(&optimizer, &raw);
            stats.lock().unwrap().record_received();
            let callback = callbacks.lock().unwrap().message.clone();
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                    stats.lock().unwrap().messages_error += 1;
                }
            }
        }));

        let connected = ConnectedFlag {
            connected: Arc::clone(&self.connected),
            callbacks: Arc::clone(&self.callbacks),
        };
        session.set_connection_status_callback(Arc::new(move |is_connected| {
            connected.set(is_connected);
        }));

        let stats = Arc::clone(&self.stats);
        session.set_error_callback(Arc::new(move |error| {
            warn!("TcpCommunicator: session error: {}", error);
            stats.lock().unwrap().messages_error += 1;
        }));

        let ok = session.connect().await;
        if ok {
            *self.session.lock().unwrap() = Some(session);
        }
        ok
    }

    async fn start_batcher(&self, config: &TcpConnectionConfig) {
        if !config.enable_message_batching || !self.batching_enabled.load(Ordering::SeqCst) {
            return;
        }
        // Batching rides the client session queue; server sends are
        // routed per client and stay direct.
        if config.is_server {
            return;
        }

        let batcher = MessageBatcher::new(MessageBatcherConfig {
            max_batch_size: config.max_batch_size,
            batch_timeout: config.batch_timeout,
            enable_destination_batching: true,
            ..Default::default()
        });

        let session_slot = Arc::clone(&self.session);
        batcher.set_batch_ready_callback(Arc::new(move |batch| {
            let session = session_slot.lock().unwrap().clone();
            let Some(session) = session else {
                return Err(String::from("no session"));
            };
            for message in &batch.messages {
                let Some(wire) = message.payload.as_str() else {
                    continue;
                };
                if !session.send_message(wire.to_owned()) {
                    return Err(String::from("session rejected batched message"));
                }
            }
            Ok(())
        }));

        batcher.set_batch_processed_callback(Arc::new(|batch_id, success, error| {
            if !success {
                warn!("TcpCommunicator: batch {} failed: {}", batch_id, error);
            }
        }));

        batcher.start().await;
        *self.batcher.lock().unwrap() = Some(batcher);
    }

    /// Routes one serialized envelope outward. Returns the acceptance /
    /// delivery flag for the chosen path.
    async fn route_outbound(&self, message: &CommunicationMessage, wire: String, direct: bool) -> bool {
        let server = self.server.lock().unwrap().clone();
        if let Some(server) = server {
            return if message.device_id.is_empty() {
                server.send_to_all_clients(&wire).await
            } else {
                server.send_to_client(&message.device_id, &wire).await
            };
        }

        let session = self.session.lock().unwrap().clone();
        let Some(session) = session else {
            return false;
        };

        if direct {
            return session.send_message_sync(&wire).await;
        }

        let batcher = self.batcher.lock().unwrap().clone();
        if let Some(batcher) = batcher {
            let batch_message = Message::new(
                message.message_id.clone(),
                message.command.clone(),
                message.device_id.clone(),
                Value::String(wire),
            )
            .priority(message.priority);
            return batcher.add_message(batch_message).is_ok();
        }

        session.send_message(wire)
    }

    async fn send_internal(&self, mut message: CommunicationMessage, direct: bool) -> CommunicationResponse {
        message.ensure_id();

        if !self.is_connected() {
            let response = CommunicationResponse::failure(message.message_id.clone(), "Not connected");
            self.stats.lock().unwrap().record_response(&response);
            return response;
        }

        let started = Instant::now();
        let wire = match self.serialize_envelope(&message) {
            Ok(wire) => wire,
            Err(e) => {
                let response = CommunicationResponse::failure(message.message_id.clone(), e.to_string());
                self.stats.lock().unwrap().record_response(&response);
                return response;
            }
        };

        let accepted = self.route_outbound(&message, wire, direct).await;
        let elapsed = started.elapsed();

        let response = if accepted {
            let mut response = CommunicationResponse::success(message.message_id.clone(), elapsed);
            // Sub-millisecond sends still count toward the averages.
            if response.response_time == 0 {
                response.response_time = 1;
            }
            response
        } else {
            CommunicationResponse::failure(message.message_id.clone(), "Failed to send message")
        };

        self.stats.lock().unwrap().record_response(&response);
        response
    }
}

/// Shared view the session status callback writes through; the session
/// never holds the façade itself.
struct ConnectedFlag {
    connected: Arc<AtomicBool>,
    callbacks: Arc<Mutex<UserCallbacks>>,
}

impl ConnectedFlag {
    fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let callback = self.callbacks.lock().unwrap().status.clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }
}

#[async_trait]
impl DeviceCommunicator for TcpCommunicator {
    async fn connect(&self, config: &TcpConnectionConfig) -> bool {
        if self.is_connected() {
            return true;
        }
        self.set_tcp_configuration(config.clone());

        let ok = if config.is_server {
            self.start_server(config).await
        } else {
            self.start_client(config).await
        };

        if ok {
            self.start_batcher(config).await;
            self.connected.store(true, Ordering::SeqCst);
            // The client session already reported its status change; the
            // server path owes the caller one.
            if config.is_server {
                let callback = self.callbacks.lock().unwrap().status.clone();
                if let Some(callback) = callback {
                    callback(true);
                }
            }
        }
        ok
    }

    async fn disconnect(&self) {
        let batcher = self.batcher.lock().unwrap().take();
        if let Some(batcher) = batcher {
            batcher.flush_all();
            batcher.stop().await;
        }

        let pool = self.connection_pool.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }

        let server = self.server.lock().unwrap().take();
        if let Some(server) = server {
            server.stop().await;
        }

        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            session.disconnect().await;
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("TcpCommunicator: disconnected");
    }

    fn is_connected(&self) -> bool {
        if self.is_server_mode() {
            self.server
                .lock()
                .unwrap()
                .as_ref()
                .map(|s| s.is_running())
                .unwrap_or(false)
        } else {
            self.session
                .lock()
                .unwrap()
                .as_ref()
                .map(|s| s.is_connected())
                .unwrap_or(false)
        }
    }

    async fn send_message(&self, message: CommunicationMessage) -> CommunicationResponse {
        self.send_internal(message, false).await
    }

    async fn send_message_sync(&self, message: CommunicationMessage) -> CommunicationResponse {
        self.send_internal(message, true).await
    }

    fn set_message_callback(&self, callback: DeviceMessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    fn set_connection_status_callback(&self, callback: ConnectionStatusCallback) {
        self.callbacks.lock().unwrap().status = Some(callback);
    }

    fn statistics(&self) -> CommunicationStats {
        self.stats.lock().unwrap().clone()
    }

    fn reset_statistics(&self) {
        *self.stats.lock().unwrap() = CommunicationStats::default();
    }

    fn supported_protocols(&self) -> Vec<Protocol> {
        vec![Protocol::Tcp]
    }
}
