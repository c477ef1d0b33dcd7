#![allow(missing_docs)]

//! The lodestar federation engine.
//!
//! Everything here hangs off [`Server`]: the signing-key store, server
//! discovery, the outbound federation client, the room DAG processor and
//! transaction ingress. The HTTP transport itself is not part of this
//! crate; a transport calls [`Server`] methods with already-parsed typed
//! bodies and renders the returned values.

pub use lodestar_core as core;

#[macro_use]
extern crate tracing;

pub mod config;
mod error;
pub mod event;
pub mod federation;
pub mod logging;
pub mod room;
pub mod sending;
mod server;
pub mod server_key;
pub mod storage;
pub mod transaction;
pub mod user;

pub use self::config::ServerConfig;
pub use self::error::{AppError, AppResult};
pub use self::server::Server;

pub use lodestar_core::MatrixError;
