//! # Warren
//!
//! Reliable REQ/REP messaging on top of a message broker.
//!
//! ## Architecture
//!
//! - **`warren-core`**: Options, errors, payload codec, lifecycle events,
//!   the abstract broker client traits and an in-process broker
//! - **`warren-rr`**: Connection manager, reconnect state machine and the
//!   REQ/REP socket protocols
//! - **`warren`**: Public API surface (this crate)
//!
//! A [`ConnectionManager`] owns one broker connection and one shared
//! channel. Sockets created from it are multiplexed over that channel and
//! keep working across connection and channel failures: operations issued
//! while the link is down are replayed in order once it is back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use warren::prelude::*;
//! use serde_json::json;
//!
//! # async fn example() -> warren::Result<()> {
//! let broker = MemoryBroker::new();
//! let manager = ConnectionManager::new(MemoryTransport::new(broker), ConnectionOptions::default())?;
//!
//! let rep = manager.rep_socket(SocketOptions::default());
//! rep.connect("jobs")?;
//! compio::runtime::spawn(async move {
//!     while let Some(request) = rep.recv().await {
//!         let _ = request.reply(json!({"reply": "wooo"}));
//!     }
//! })
//! .detach();
//!
//! let req = manager.req_socket(SocketOptions::default());
//! req.connect("jobs")?;
//! let reply = req.request(json!({"foo": "bar"})).await?;
//! assert_eq!(reply, json!({"reply": "wooo"}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Failures
//!
//! Errors that do not belong to a single call are delivered as events on
//! [`ConnectionManager::monitor`] and on each socket's `events()` stream.
//! The reconnect budget is configured through [`BackoffOptions`]; once it
//! is spent the manager enters [`ConnectionState::Failed`] until
//! [`ConnectionManager::connect`] is called again.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use bytes::Bytes;
pub use serde_json::Value;

pub use warren_core::address::Address;
pub use warren_core::codec::Payload;
pub use warren_core::error::{Result, WarrenError};
pub use warren_core::memory::{MemoryBroker, MemoryTransport};
pub use warren_core::monitor::{ErrorScope, ManagerEvent, ManagerMonitor, SocketEvent, SocketMonitor};
pub use warren_core::options::{BackoffOptions, ConnectionOptions, SocketOptions};
pub use warren_core::socket_type::SocketType;
pub use warren_core::transport;

pub use warren_rr::{
    wait_for_event, ConnectionManager, ConnectionState, RepSocket, ReplyHandle, ReqSocket,
    Request, Socket,
};

/// Development helpers (tracing setup).
pub mod dev_tracing;

/// Convenient imports.
///
/// ```rust
/// use warren::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BackoffOptions, ConnectionManager, ConnectionOptions, ConnectionState, ManagerEvent,
        MemoryBroker, MemoryTransport, Payload, RepSocket, ReplyHandle, ReqSocket, Request,
        Result, Socket, SocketEvent, SocketOptions, SocketType, WarrenError,
    };
}
