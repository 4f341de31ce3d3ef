//! Transport layer: pooled connections, per-socket sessions and the
//! server accept loop.

pub(crate) mod framing;
pub mod pool;
pub mod server;
pub mod session;
pub mod tcp;

pub use pool::{Connection, ConnectionFactory, ConnectionPool, PooledConnectionHandle};
pub use server::TcpServer;
pub use session::{TcpSession, TcpSessionState};
pub use tcp::{TcpConnection, TcpConnectionFactory};
