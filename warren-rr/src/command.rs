//! Commands sent from application handles to the manager's driver task.

use crate::base::SocketId;
use crate::req::{OutboundRequest, ReplySender};
use crate::socket::Request;
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use warren_core::error::WarrenError;
use warren_core::monitor::{EventSink, SocketEvent};
use warren_core::options::SocketOptions;
use warren_core::transport::ChannelId;

pub(crate) enum Command {
    /// Open the transport connection (no-op unless disconnected or failed)
    Connect,
    /// Register a new socket
    Open(OpenSocket),
    /// Connect a socket to a queue
    SocketConnect { socket: SocketId, queue: String },
    /// Publish a request from a REQ socket
    Send {
        socket: SocketId,
        request: OutboundRequest,
        reply_tx: ReplySender,
    },
    /// Publish a reply and acknowledge the request it answers
    Reply(ReplyCommand),
    /// Close one socket
    CloseSocket {
        socket: SocketId,
        ack: Option<flume::Sender<()>>,
    },
    /// Surface an error on the manager's event stream
    Report(WarrenError),
    /// Close the connection and stop the driver
    Shutdown { ack: flume::Sender<()> },
}

pub(crate) struct OpenSocket {
    pub(crate) id: SocketId,
    pub(crate) options: SocketOptions,
    pub(crate) events: EventSink<SocketEvent>,
    pub(crate) ready: Arc<AtomicBool>,
    pub(crate) role: OpenRole,
}

pub(crate) enum OpenRole {
    Request,
    Reply {
        requests: flume::Sender<Request>,
        commands: flume::WeakSender<Command>,
    },
}

/// A reply on its way back to a requester.
#[derive(Debug, Clone)]
pub(crate) struct ReplyCommand {
    pub(crate) reply_to: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) body: Bytes,
    /// Channel and tag of the request delivery to acknowledge
    pub(crate) channel: ChannelId,
    pub(crate) delivery_tag: u64,
    pub(crate) persistent: bool,
    pub(crate) expiration: Option<Duration>,
}
