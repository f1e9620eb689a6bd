//! Warren REQ/REP protocol layer.
//!
//! Internal crate: use `warren` for the public API.
//!
//! - Connection manager handle and socket factory (`manager`)
//! - Single-task driver with the reconnect state machine (`driver`)
//! - Socket base protocol: readiness and deferred operations (`base`)
//! - REQ and REP protocol state (`req`, `rep`)
//! - Application-facing handles (`socket`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::future_not_send)]

mod base;
mod command;
mod driver;
mod rep;
mod req;
mod timer;

pub mod manager;
pub mod socket;

pub use manager::{wait_for_event, ConnectionManager, ConnectionState};
pub use socket::{RepSocket, ReplyHandle, ReqSocket, Request, Socket};
