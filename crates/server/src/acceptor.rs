//! TCP bind and accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};

use crate::http;
use crate::registry::Server;
use crate::ServerError;

/// Binds the configured endpoint and accepts connections until shutdown.
///
/// Bind/listen failures are returned to the caller, which decides whether
/// to exit. Each accepted socket gets its own HTTP session task. Transient
/// accept errors re-arm the loop; non-recoverable ones stop it.
pub async fn run(server: Arc<Server>) -> Result<(), ServerError> {
    let listener = bind(&server)?;
    let local_addr = listener.local_addr()?;
    server.set_local_addr(local_addr);
    tracing::info!(addr = %local_addr, "listening");

    loop {
        tokio::select! {
            _ = server.cancel_token().cancelled() => {
                tracing::info!("acceptor shutting down");
                return Ok(());
            }

            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "accepted connection");
                    let server = Arc::clone(&server);
                    tokio::spawn(http::run(stream, remote, server));
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("accept error, re-arming: {e}");
                }
                Err(e) => {
                    tracing::error!("accept loop stopping: {e}");
                    return Err(e.into());
                }
            }
        }
    }
}

fn bind(server: &Server) -> Result<TcpListener, ServerError> {
    let listener_config = &server.config().listener;
    let addr: SocketAddr = format!(
        "{}:{}",
        listener_config.interface, listener_config.port
    )
    .parse()
    .map_err(|_| ServerError::BadInterface(listener_config.interface.clone()))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(listener_config.max_queued_connections)?)
}

/// Per-connection failures that must not bring the accept loop down.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
