//! Authoritative server for a small real-time multiplayer game.
//!
//! Clients connect over TCP, upgrade to WebSocket, and exchange JSON
//! packages to join a named game, update their player, and leave. The
//! server validates every package, tracks per-game state (two teams of
//! players plus rays), and broadcasts state changes to every participant.
//!
//! Module map:
//! - [`acceptor`] — TCP bind + accept loop
//! - [`http`] — plain-HTTP front end and WebSocket upgrade
//! - [`session`] — per-connection pumps, ordered write queue, dispatch
//! - [`registry`] — the process-wide session/game registry
//! - [`game`] — per-game membership, state and package handling
//! - [`config`] / [`logging`] — configuration file and tracing setup

pub mod acceptor;
pub mod config;
pub mod game;
pub mod http;
pub mod logging;
pub mod registry;
pub mod session;

/// Errors produced by the server runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listener interface {0:?}")]
    BadInterface(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
