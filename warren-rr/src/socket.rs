//! Application-facing socket handles.
//!
//! Handles are thin: every operation becomes a command for the manager's
//! driver, which owns the socket's actual state. Operations never fail
//! because the broker is unavailable; they are buffered until it is back.

use crate::base::{SocketCore, SocketId};
use crate::command::{Command, ReplyCommand};
use crate::req::OutboundRequest;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use warren_core::codec::{self, Payload};
use warren_core::error::{Result, WarrenError};
use warren_core::monitor::{EventSink, SocketEvent, SocketMonitor};
use warren_core::socket_type::SocketType;
use warren_core::transport::{ChannelId, Delivery};

fn close_socket(commands: &flume::Sender<Command>, socket: SocketId) -> Option<flume::Receiver<()>> {
    let (ack, done) = flume::bounded(1);
    commands
        .send(Command::CloseSocket {
            socket,
            ack: Some(ack),
        })
        .ok()
        .map(|()| done)
}

/// REQ socket handle (client role).
///
/// Requests are spread round-robin over every connected destination and
/// matched to their replies by correlation id.
///
/// # Example
///
/// ```rust,no_run
/// # use warren_rr::ReqSocket;
/// # async fn example(req: ReqSocket) -> warren_core::error::Result<()> {
/// use serde_json::json;
///
/// req.connect("jobs")?;
/// let reply = req.request(json!({"foo": "bar"})).await?;
/// # Ok(())
/// # }
/// ```
pub struct ReqSocket {
    id: SocketId,
    commands: flume::Sender<Command>,
    monitor: SocketMonitor,
    ready: Arc<AtomicBool>,
    nonce: u64,
    seq: AtomicU64,
}

impl ReqSocket {
    pub(crate) fn new(
        id: SocketId,
        commands: flume::Sender<Command>,
        monitor: SocketMonitor,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            commands,
            monitor,
            ready,
            nonce: rand::random(),
            seq: AtomicU64::new(0),
        }
    }

    /// Add a destination queue to the rotation.
    ///
    /// Connecting the same destination twice is harmless.
    pub fn connect(&self, queue: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::SocketConnect {
                socket: self.id,
                queue: queue.into(),
            })
            .map_err(|_| WarrenError::ManagerClosed)
    }

    /// Send a request. The returned handle resolves with the reply.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be encoded or the manager is closed.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<ReplyHandle> {
        let body = codec::pack(&payload.into())?;
        let correlation_id = self.next_correlation_id();
        let (reply_tx, reply_rx) = flume::bounded(1);

        trace!("[REQ] socket {} queueing {}", self.id, correlation_id);
        self.commands
            .send(Command::Send {
                socket: self.id,
                request: OutboundRequest {
                    correlation_id: correlation_id.clone(),
                    body,
                },
                reply_tx,
            })
            .map_err(|_| WarrenError::ManagerClosed)?;

        Ok(ReplyHandle {
            correlation_id,
            rx: reply_rx,
        })
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, payload: impl Into<Payload>) -> Result<Value> {
        self.send(payload)?.wait().await
    }

    /// Socket lifecycle events.
    pub fn events(&self) -> &SocketMonitor {
        &self.monitor
    }

    /// Whether the socket is bound to a live channel.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Close the socket. Pending requests fail with `SocketClosed`; the
    /// manager's shared channel stays open.
    pub async fn close(&self) {
        if let Some(done) = close_socket(&self.commands, self.id) {
            let _ = done.recv_async().await;
        }
    }

    fn next_correlation_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{}", self.nonce, seq)
    }
}

impl Drop for ReqSocket {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CloseSocket {
            socket: self.id,
            ack: None,
        });
    }
}

impl fmt::Debug for ReqSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqSocket")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Resolves with the reply to one request.
#[derive(Debug)]
pub struct ReplyHandle {
    correlation_id: String,
    rx: flume::Receiver<Result<Value>>,
}

impl ReplyHandle {
    /// Correlation id the request was sent with.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply.
    ///
    /// Tagged error replies resolve to `WarrenError::Application`. Without a
    /// configured request timeout this waits as long as it takes.
    pub async fn wait(self) -> Result<Value> {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(WarrenError::ManagerClosed))
    }
}

/// REP socket handle (server role).
///
/// # Example
///
/// ```rust,no_run
/// # use warren_rr::RepSocket;
/// # async fn example(rep: RepSocket) -> warren_core::error::Result<()> {
/// use serde_json::json;
///
/// rep.connect("jobs")?;
/// while let Some(request) = rep.recv().await {
///     request.reply(json!({"ok": true}))?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct RepSocket {
    id: SocketId,
    commands: flume::Sender<Command>,
    monitor: SocketMonitor,
    requests: flume::Receiver<Request>,
    ready: Arc<AtomicBool>,
}

impl RepSocket {
    pub(crate) fn new(
        id: SocketId,
        commands: flume::Sender<Command>,
        monitor: SocketMonitor,
        requests: flume::Receiver<Request>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            commands,
            monitor,
            requests,
            ready,
        }
    }

    /// Start consuming a source queue. Consuming the same queue twice is a
    /// no-op.
    pub fn connect(&self, queue: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::SocketConnect {
                socket: self.id,
                queue: queue.into(),
            })
            .map_err(|_| WarrenError::ManagerClosed)
    }

    /// Receive the next request. `None` once the socket is closed.
    pub async fn recv(&self) -> Option<Request> {
        self.requests.recv_async().await.ok()
    }

    /// Socket lifecycle events.
    pub fn events(&self) -> &SocketMonitor {
        &self.monitor
    }

    /// Whether the socket is bound to a live channel.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Close the socket and cancel its consumers.
    pub async fn close(&self) {
        if let Some(done) = close_socket(&self.commands, self.id) {
            let _ = done.recv_async().await;
        }
    }
}

impl Drop for RepSocket {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CloseSocket {
            socket: self.id,
            ack: None,
        });
    }
}

impl fmt::Debug for RepSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepSocket")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// An inbound request awaiting its reply.
///
/// Replying consumes the request. The broker message is acknowledged only
/// after the reply is published; a request dropped without a reply stays
/// unacknowledged and is redelivered once its channel goes away.
pub struct Request {
    body: Value,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
    channel: ChannelId,
    delivery_tag: u64,
    persistent: bool,
    expiration: Option<Duration>,
    events: EventSink<SocketEvent>,
    commands: flume::Sender<Command>,
}

impl Request {
    pub(crate) fn new(
        body: Value,
        delivery: &Delivery,
        core: &SocketCore,
        commands: flume::Sender<Command>,
    ) -> Self {
        Self {
            body,
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            redelivered: delivery.redelivered,
            channel: delivery.channel,
            delivery_tag: delivery.delivery_tag,
            persistent: core.options.persistent,
            expiration: core.options.expiration,
            events: core.events.clone(),
            commands,
        }
    }

    /// Request payload.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Correlation id the requester attached.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Queue the reply goes to.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Whether the broker delivered this request before.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Reply with data.
    pub fn reply(self, payload: impl Into<Payload>) -> Result<()> {
        let body = codec::pack(&payload.into())?;
        self.dispatch(body)
    }

    /// Reply with an error. The requester's wait resolves to
    /// `WarrenError::Application(message)`.
    pub fn reply_err(self, message: impl AsRef<str>) -> Result<()> {
        let message = message.as_ref();
        self.events
            .emit(SocketEvent::ApplicationError(message.to_string()));
        self.dispatch(codec::encode_error_reply(message))
    }

    /// Reply with the outcome of a handler.
    pub fn respond<T, E>(self, result: std::result::Result<T, E>) -> Result<()>
    where
        T: Into<Payload>,
        E: fmt::Display,
    {
        match result {
            Ok(payload) => self.reply(payload),
            Err(e) => self.reply_err(e.to_string()),
        }
    }

    fn dispatch(self, body: Bytes) -> Result<()> {
        let reply = ReplyCommand {
            reply_to: self.reply_to,
            correlation_id: self.correlation_id,
            body,
            channel: self.channel,
            delivery_tag: self.delivery_tag,
            persistent: self.persistent,
            expiration: self.expiration,
        };
        self.commands
            .send(Command::Reply(reply))
            .map_err(|_| WarrenError::ManagerClosed)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("body", &self.body)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Either socket kind, as returned by the manager's factory.
#[derive(Debug)]
pub enum Socket {
    Request(ReqSocket),
    Reply(RepSocket),
}

impl Socket {
    /// Socket kind.
    pub fn kind(&self) -> SocketType {
        match self {
            Self::Request(_) => SocketType::Request,
            Self::Reply(_) => SocketType::Reply,
        }
    }

    /// Connect to a queue (destination for REQ, source for REP).
    pub fn connect(&self, queue: impl Into<String>) -> Result<()> {
        match self {
            Self::Request(s) => s.connect(queue),
            Self::Reply(s) => s.connect(queue),
        }
    }

    /// Socket lifecycle events.
    pub fn events(&self) -> &SocketMonitor {
        match self {
            Self::Request(s) => s.events(),
            Self::Reply(s) => s.events(),
        }
    }

    /// Whether the socket is bound to a live channel.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Request(s) => s.is_ready(),
            Self::Reply(s) => s.is_ready(),
        }
    }

    /// Close the socket.
    pub async fn close(&self) {
        match self {
            Self::Request(s) => s.close().await,
            Self::Reply(s) => s.close().await,
        }
    }

    /// The REQ socket, if this is one.
    pub fn into_req(self) -> Option<ReqSocket> {
        match self {
            Self::Request(s) => Some(s),
            Self::Reply(_) => None,
        }
    }

    /// The REP socket, if this is one.
    pub fn into_rep(self) -> Option<RepSocket> {
        match self {
            Self::Reply(s) => Some(s),
            Self::Request(_) => None,
        }
    }
}
