#![allow(missing_docs)]

//! Protocol-level types and algorithms for the lodestar federation core.
//!
//! This crate is pure: it performs no I/O. Everything that talks to the
//! network or to storage lives in `lodestar-server` and calls into the
//! functions defined here.

pub mod error;
pub mod events;
pub mod federation;
pub mod identifiers;
pub mod power_levels;
pub mod presence;
pub mod room_version;
pub mod sending;
pub mod serde;
pub mod signatures;
pub mod state;
mod time;
pub mod to_device;

#[macro_use]
extern crate tracing;

pub use self::error::{ErrorKind, MatrixError};
pub use self::identifiers::*;
pub use self::room_version::{RoomVersionId, RoomVersionRules};
pub use self::time::UnixMillis;

pub type MatrixResult<T> = Result<T, MatrixError>;
