//! Warren Core
//!
//! Transport-agnostic building blocks for broker-backed request/reply:
//! - Error types (`error`)
//! - Connection, backoff and socket options (`options`, `reconnect`)
//! - Broker address parsing (`address`)
//! - Socket kinds (`socket_type`)
//! - Payload encoding and the error reply contract (`codec`)
//! - Lifecycle events (`monitor`)
//! - Abstract broker client traits (`transport`)
//! - In-process broker for tests and demos (`memory`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod address;
pub mod codec;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod options;
pub mod reconnect;
pub mod socket_type;
pub mod transport;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::codec::{decode_reply, encode_error_reply, pack, parse, Payload};
    pub use crate::error::{Result, WarrenError};
    pub use crate::memory::{MemoryBroker, MemoryTransport};
    pub use crate::monitor::{ErrorScope, ManagerEvent, ManagerMonitor, SocketEvent, SocketMonitor};
    pub use crate::options::{BackoffOptions, ConnectionOptions, SocketOptions};
    pub use crate::reconnect::ReconnectState;
    pub use crate::socket_type::SocketType;
    pub use crate::transport::{Channel, Connection, Transport};
}
