//! Lifecycle event monitoring.
//!
//! Connection managers and sockets publish what happens to them on bounded
//! monitor channels. Monitors are optional: when nobody drains a monitor
//! its backlog fills and further events are dropped.

use crate::error::WarrenError;
use std::fmt;
use tracing::trace;

/// Number of undrained events a monitor holds before dropping new ones.
pub const EVENT_BACKLOG: usize = 1024;

/// Which transport object an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorScope {
    /// The broker connection itself
    Connection,
    /// The shared channel on top of it
    Channel,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

/// Connection manager lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Transport connection opened
    Connected,

    /// Shared channel opened and usable
    Ready,

    /// A retry cycle has begun; the channel and all broker-side state are gone
    Disconnected { scope: ErrorScope, reason: String },

    /// Error surfaced to the application (initial connect failure,
    /// invalid socket type, or terminal reconnect exhaustion)
    Error(WarrenError),

    /// Transport connection closed
    Closed,

    /// Shared channel closed by the transport
    ChannelClosed,

    /// Broker applied flow control to the connection
    Blocked(String),

    /// Broker lifted flow control
    Unblocked,
}

impl fmt::Display for ManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected { scope, reason } => {
                write!(f, "Disconnected ({scope}): {reason}")
            }
            Self::Error(err) => write!(f, "Error: {err}"),
            Self::Closed => write!(f, "Closed"),
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::Blocked(reason) => write!(f, "Blocked: {reason}"),
            Self::Unblocked => write!(f, "Unblocked"),
        }
    }
}

/// Socket lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Socket is bound to a usable channel and has replayed deferred work
    Ready,

    /// Socket lost its channel and is buffering operations again
    NotReady,

    /// Queue declared (and, for REP, consumed)
    Connected(String),

    /// Terminal error forwarded from the connection manager, or a failed
    /// socket operation
    Error(WarrenError),

    /// An inbound payload could not be deserialized
    ParseError(String),

    /// A REP handler replied with an error
    ApplicationError(String),

    /// Channel write buffer drained
    Drain,

    /// Channel has data to read
    Readable,

    /// Socket closed
    Closed,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::NotReady => write!(f, "Not ready"),
            Self::Connected(queue) => write!(f, "Connected to {queue}"),
            Self::Error(err) => write!(f, "Error: {err}"),
            Self::ParseError(reason) => write!(f, "Parse error: {reason}"),
            Self::ApplicationError(msg) => write!(f, "Application error: {msg}"),
            Self::Drain => write!(f, "Drain"),
            Self::Readable => write!(f, "Readable"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Handle for receiving manager events.
pub type ManagerMonitor = flume::Receiver<ManagerEvent>;

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sending half of a monitor channel.
///
/// Emitting never blocks: a full backlog drops the event.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: flume::Sender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: fmt::Debug> EventSink<E> {
    /// Publish an event.
    pub fn emit(&self, event: E) {
        if let Err(err) = self.tx.try_send(event) {
            trace!(event = ?err.into_inner(), "monitor backlog full or closed, dropping event");
        }
    }
}

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor<E>() -> (EventSink<E>, flume::Receiver<E>) {
    let (tx, rx) = flume::bounded(EVENT_BACKLOG);
    (EventSink { tx }, rx)
}
