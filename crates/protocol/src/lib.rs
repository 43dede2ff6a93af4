//! Wire protocol for the lasertag server.
//!
//! Clients exchange one JSON value per WebSocket text frame (a *package*).
//! This crate is pure: it parses and validates inbound packages, builds
//! outbound ones, and defines the wire value types. It never touches
//! sessions, games, or sockets.

pub mod outbound;
pub mod package;
pub mod types;

pub use package::{parse, verify, ClientPackage, Package, ParseError, VerifyError};
pub use types::{Color, PlayerState, Point, RayState, StateSnapshot};
