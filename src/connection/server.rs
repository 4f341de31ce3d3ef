//! Accept loop and client registry for server mode.
//!
//! The server owns one listening socket and a `{client_id → session}`
//! map. Each accepted socket becomes a [`TcpSession`] whose callbacks
//! forward `(client_id, message)` and `(client_id, connected)` events up
//! to the server-level callbacks. Sessions remove themselves from the
//! registry when their status callback reports a disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TcpConnectionConfig;
use crate::connection::session::{SessionMetrics, TcpSession};
use crate::error::{CommError, Result};

/// `(client_id, message)` for inbound traffic.
pub type ServerMessageCallback = Arc<dyn Fn(&str, String) + Send + Sync>;
/// Fired with the client id on connect / disconnect.
pub type ClientEventCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Server-level error reports.
pub type ServerErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct ServerCallbacks {
    client_connected: Option<ClientEventCallback>,
    client_disconnected: Option<ClientEventCallback>,
    message_received: Option<ServerMessageCallback>,
    error: Option<ServerErrorCallback>,
}

struct ServerShared {
    config: TcpConnectionConfig,
    clients: Mutex<HashMap<String, Arc<TcpSession>>>,
    callbacks: Mutex<ServerCallbacks>,
    running: AtomicBool,
}

impl ServerShared {
    fn remove_client(&self, client_id: &str) {
        let removed = self.clients.lock().unwrap().remove(client_id).is_some();
        if removed {
            debug!("TcpServer: client {} removed", client_id);
            let callback = self.callbacks.lock().unwrap().client_disconnected.clone();
            if let Some(callback) = callback {
                callback(client_id);
            }
        }
    }
}

/// Multi-client TCP server.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    accept_worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<Notify>,
    bound_port: AtomicU16,
}

impl TcpServer {
    pub fn new(config: TcpConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(ServerShared {
                config,
                clients: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(ServerCallbacks::default()),
                running: AtomicBool::new(false),
            }),
            accept_worker: Mutex::new(None),
            stop: Arc::new(Notify::new()),
            bound_port: AtomicU16::new(0),
        })
    }

    pub fn set_client_connected_callback(&self, callback: ClientEventCallback) {
        self.shared.callbacks.lock().unwrap().client_connected = Some(callback);
    }

    pub fn set_client_disconnected_callback(&self, callback: ClientEventCallback) {
        self.shared.callbacks.lock().unwrap().client_disconnected = Some(callback);
    }

    pub fn set_message_received_callback(&self, callback: ServerMessageCallback) {
        self.shared.callbacks.lock().unwrap().message_received = Some(callback);
    }

    pub fn set_error_callback(&self, callback: ServerErrorCallback) {
        self.shared.callbacks.lock().unwrap().error = Some(callback);
    }

    /// Binds the listener and starts the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match self.bind_listener() {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local = listener
            .local_addr()
            .map_err(|e| CommError::Internal(e.to_string()))?;
        self.bound_port.store(local.port(), Ordering::SeqCst);
        info!("TcpServer: listening on {}", local);

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                handle_new_connection(&shared, stream, peer).await;
                            }
                            Err(e) => {
                                warn!("TcpServer: accept failed: {}", e);
                                let callback = shared.callbacks.lock().unwrap().error.clone();
                                if let Some(callback) = callback {
                                    callback(format!("accept failed: {}", e));
                                }
                            }
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            debug!("TcpServer: accept loop stopped");
        });
        *self.accept_worker.lock().unwrap() = Some(worker);

        Ok(())
    }

    /// Stops accepting, then terminates every client session.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        let worker = self.accept_worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let sessions: Vec<Arc<TcpSession>> = {
            let mut clients = self.shared.clients.lock().unwrap();
            clients.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.disconnect().await;
        }
        info!("TcpServer: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The actual listening port — useful when the config asked for
    /// port 0.
    pub fn local_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.shared.clients.lock().unwrap().keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    /// Sends one framed message to one client.
    pub async fn send_to_client(&self, client_id: &str, message: &str) -> bool {
        let session = {
            let clients = self.shared.clients.lock().unwrap();
            clients.get(client_id).cloned()
        };
        match session {
            Some(session) => session.send_message_sync(message).await,
            None => false,
        }
    }

    /// Sends one framed message to every connected client. Returns
    /// `true` when every delivery succeeded.
    pub async fn send_to_all_clients(&self, message: &str) -> bool {
        let sessions: Vec<Arc<TcpSession>> = {
            let clients = self.shared.clients.lock().unwrap();
            clients.values().cloned().collect()
        };
        let sends = sessions
            .iter()
            .map(|session| session.send_message_sync(message));
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    /// Forcibly terminates one client session.
    pub async fn disconnect_client(&self, client_id: &str) {
        let session = {
            let mut clients = self.shared.clients.lock().unwrap();
            clients.remove(client_id)
        };
        if let Some(session) = session {
            session.disconnect().await;
            let callback = self.shared.callbacks.lock().unwrap().client_disconnected.clone();
            if let Some(callback) = callback {
                callback(client_id);
            }
        }
    }

    /// Field-wise sum of every live session's metrics.
    pub fn aggregated_metrics(&self) -> SessionMetrics {
        let clients = self.shared.clients.lock().unwrap();
        let mut aggregate = SessionMetrics::default();
        for session in clients.values() {
            aggregate.merge(&session.metrics());
        }
        aggregate
    }

    fn bind_listener(&self) -> Result<TcpListener> {
        let address = format!(
            "{}:{}",
            self.shared.config.bind_interface, self.shared.config.server_port
        );

        // The reuse-address option has to be set before bind, which
        // means building the socket by hand.
        if let Ok(parsed) = address.parse::<SocketAddr>() {
            let domain = Domain::for_address(parsed);
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
                .map_err(CommError::from)?;
            socket
                .set_reuse_address(self.shared.config.reuse_address)
                .map_err(CommError::from)?;
            socket.set_nonblocking(true).map_err(CommError::from)?;
            socket.bind(&parsed.into()).map_err(CommError::from)?;
            socket.listen(1024).map_err(CommError::from)?;
            let listener: std::net::TcpListener = socket.into();
            return TcpListener::from_std(listener).map_err(CommError::from);
        }

        // Hostname interfaces fall back to the resolver-backed bind.
        let std_listener = std::net::TcpListener::bind(&address).map_err(CommError::from)?;
        std_listener.set_nonblocking(true).map_err(CommError::from)?;
        TcpListener::from_std(std_listener).map_err(CommError::from)
    }
}

async fn handle_new_connection(
    shared: &Arc<ServerShared>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    if shared.clients.lock().unwrap().len() >= shared.config.max_connections {
        warn!("TcpServer: rejecting {} — connection limit reached", peer);
        return;
    }

    let client_id = format!("client_{}", Uuid::new_v4().simple());
    let session = TcpSession::new(client_id.clone(), shared.config.clone());

    // Sessions hold only weak links back to the server so a session
    // callback can never keep the registry alive.
    let weak: Weak<ServerShared> = Arc::downgrade(shared);
    {
        let weak = weak.clone();
        let client_id = client_id.clone();
        session.set_message_callback(Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                let callback = shared.callbacks.lock().unwrap().message_received.clone();
                if let Some(callback) = callback {
                    callback(&client_id, message);
                }
            }
        }));
    }
    {
        let client_id = client_id.clone();
        session.set_connection_status_callback(Arc::new(move |connected| {
            if !connected {
                if let Some(shared) = weak.upgrade() {
                    shared.remove_client(&client_id);
                }
            }
        }));
    }
    {
        let client_id = client_id.clone();
        let weak: Weak<ServerShared> = Arc::downgrade(shared);
        session.set_error_callback(Arc::new(move |error| {
            if let Some(shared) = weak.upgrade() {
                let callback = shared.callbacks.lock().unwrap().error.clone();
                if let Some(callback) = callback {
                    callback(format!("client {}: {}", client_id, error));
                }
            }
        }));
    }

    // Register before the workers start so a disconnect racing the
    // accept path always finds its registry entry.
    shared
        .clients
        .lock()
        .unwrap()
        .insert(client_id.clone(), Arc::clone(&session));
    session.adopt_stream(stream).await;
    info!("TcpServer: client {} connected from {}", client_id, peer);

    let callback = shared.callbacks.lock().unwrap().client_connected.clone();
    if let Some(callback) = callback {
        callback(&client_id);
    }
}
