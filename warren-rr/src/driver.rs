//! Connection manager driver task.
//!
//! One driver runs per connection manager. It owns the transport
//! connection, the shared channel and the broker-side state of every socket
//! created from the manager, and multiplexes three sources:
//!
//! - commands from application handles
//! - transport events (deliveries, errors, flow control)
//! - one timer: the reconnect deadline or the earliest request expiry
//!
//! # Reconnection
//!
//! ```text
//! Disconnected → Connecting → Connected ──(error)──→ Reconnecting ─→ Connected
//!                    │                                    │
//!                    └─(fail)→ Disconnected               └─(budget spent)→ Failed
//! ```
//!
//! A connection error always wins: it cancels a pending channel retry and
//! restarts the backoff. A channel error arriving while a retry is already
//! scheduled is ignored, since the retry recreates the channel anyway.

use crate::base::{DeferredOp, SocketCore, SocketId};
use crate::command::{Command, OpenRole, OpenSocket, ReplyCommand};
use crate::manager::ConnectionState;
use crate::rep::RepState;
use crate::req::{OutboundRequest, ReplySender, ReqState};
use crate::timer::DeadlineTimer;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};
use warren_core::address::Address;
use warren_core::error::{Result, WarrenError};
use warren_core::monitor::{ErrorScope, EventSink, ManagerEvent, SocketEvent};
use warren_core::options::ConnectionOptions;
use warren_core::reconnect::ReconnectState;
use warren_core::socket_type::SocketType;
use warren_core::transport::{
    Channel, ChannelId, Connection, ConnectionId, Delivery, MessageProperties, Transport,
    TransportEvent, TransportEventReceiver, TransportEventSender,
};

enum Role {
    Req(ReqState),
    Rep(RepState),
}

/// A socket as the driver sees it.
struct SocketEntry {
    core: SocketCore,
    role: Role,
}

impl SocketEntry {
    /// Bind to a new channel, restore broker-side state, replay deferred work.
    async fn establish(&mut self, channel: &Rc<dyn Channel>) -> Result<()> {
        self.core.bind(channel).await?;
        if let Role::Req(req) = &mut self.role {
            req.establish(&self.core).await?;
        }
        while let Some(op) = self.core.deferred.pop_front() {
            self.apply(op).await?;
        }
        self.core.mark_ready();
        Ok(())
    }

    async fn apply(&mut self, op: DeferredOp) -> Result<()> {
        match (&mut self.role, op) {
            (Role::Req(req), DeferredOp::Connect(queue)) => req.connect(&self.core, &queue).await,
            (Role::Rep(rep), DeferredOp::Connect(queue)) => rep.connect(&self.core, &queue).await,
            (Role::Req(req), DeferredOp::Send(request)) => req.send(&self.core, request).await,
            (Role::Rep(_), DeferredOp::Send(request)) => {
                trace!("[REP] ignoring send of {}", request.correlation_id);
                Ok(())
            }
        }
    }

    async fn connect(&mut self, queue: String) -> Result<()> {
        match &mut self.role {
            Role::Req(req) => req.remember(&queue),
            Role::Rep(rep) => rep.remember(&queue),
        }
        if !self.core.is_live() {
            trace!("[{}] socket {} deferring connect to {}", self.core.kind, self.core.id, queue);
            self.core.deferred.push_back(DeferredOp::Connect(queue));
            return Ok(());
        }
        self.apply(DeferredOp::Connect(queue)).await
    }

    async fn send(&mut self, request: OutboundRequest, reply_tx: ReplySender) -> Result<()> {
        let Role::Req(req) = &mut self.role else {
            let _ = reply_tx.send(Err(WarrenError::InvalidSocketType(
                "REP sockets do not send requests".into(),
            )));
            return Ok(());
        };
        req.register(request.correlation_id.clone(), reply_tx);
        if !self.core.is_live() {
            self.core.deferred.push_back(DeferredOp::Send(request));
            return Ok(());
        }
        req.send(&self.core, request).await
    }

    async fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        match &mut self.role {
            Role::Req(req) => {
                req.handle_reply(&self.core, delivery);
                Ok(())
            }
            Role::Rep(rep) => rep.handle_request(&self.core, delivery).await,
        }
    }

    fn owns_consumer(&self, tag: &str) -> bool {
        match &self.role {
            Role::Req(req) => req.owns_consumer(tag),
            Role::Rep(rep) => rep.owns_consumer(tag),
        }
    }

    fn on_disconnect(&mut self) {
        self.core.mark_not_ready();
        match &mut self.role {
            Role::Req(req) => req.on_disconnect(&mut self.core),
            Role::Rep(rep) => rep.on_disconnect(&mut self.core),
        }
    }

    fn fail_requests(&mut self, err: &WarrenError) {
        if let Role::Req(req) = &mut self.role {
            req.fail_all(&mut self.core, err);
        }
    }

    async fn close(&mut self) -> Result<()> {
        match &mut self.role {
            Role::Req(req) => req.close(&self.core).await,
            Role::Rep(rep) => rep.close(&self.core).await,
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        match (&self.role, self.core.options.request_timeout) {
            (Role::Req(req), Some(timeout)) => req.next_expiry(timeout),
            _ => None,
        }
    }

    fn expire(&mut self, now: Instant) {
        if let (Role::Req(req), Some(timeout)) = (&mut self.role, self.core.options.request_timeout) {
            req.expire(&mut self.core, timeout, now);
        }
    }
}

/// A scheduled reconnect attempt.
#[derive(Debug)]
struct Retry {
    scope: ErrorScope,
    at: Instant,
    last_error: String,
}

enum Wake {
    Command(Command),
    Transport(TransportEvent),
    Timer,
    Detached,
}

pub(crate) struct Driver {
    transport: Box<dyn Transport>,
    options: ConnectionOptions,
    address: Address,
    state: Arc<Mutex<ConnectionState>>,
    events: EventSink<ManagerEvent>,
    transport_tx: TransportEventSender,
    timer: DeadlineTimer,
    connection: Option<Box<dyn Connection>>,
    channel: Option<Rc<dyn Channel>>,
    reconnect: ReconnectState,
    retry: Option<Retry>,
    terminal: Option<WarrenError>,
    /// Keyed by creation order
    sockets: BTreeMap<SocketId, SocketEntry>,
    /// Replies that arrived while no channel was open
    deferred_replies: VecDeque<ReplyCommand>,
}

impl Driver {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
        address: Address,
        state: Arc<Mutex<ConnectionState>>,
        events: EventSink<ManagerEvent>,
        transport_tx: TransportEventSender,
        timer: DeadlineTimer,
    ) -> Self {
        let reconnect = ReconnectState::new(options.backoff);
        Self {
            transport,
            options,
            address,
            state,
            events,
            transport_tx,
            timer,
            connection: None,
            channel: None,
            reconnect,
            retry: None,
            terminal: None,
            sockets: BTreeMap::new(),
            deferred_replies: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, commands: flume::Receiver<Command>, transport_rx: TransportEventReceiver) {
        use futures::select;

        loop {
            self.timer.set(self.next_deadline());
            let wake = select! {
                cmd = commands.recv_async().fuse() => match cmd {
                    Ok(cmd) => Wake::Command(cmd),
                    Err(_) => Wake::Detached,
                },
                event = transport_rx.recv_async().fuse() => match event {
                    Ok(event) => Wake::Transport(event),
                    Err(_) => Wake::Detached,
                },
                () = self.timer.fired().fuse() => Wake::Timer,
            };

            match wake {
                Wake::Command(cmd) => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Wake::Transport(event) => self.handle_transport_event(event).await,
                Wake::Timer => {
                    self.timer.reset();
                    self.on_timer().await;
                }
                Wake::Detached => {
                    debug!("[MANAGER] every handle dropped, shutting down");
                    self.shutdown().await;
                    break;
                }
            }
        }
        trace!("[MANAGER] driver stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!("[MANAGER] {} -> {}", *current, state);
            *current = state;
        }
    }

    fn is_current_connection(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id() == id)
    }

    fn is_current_channel(&self, id: ChannelId) -> bool {
        self.channel.as_ref().is_some_and(|c| c.id() == id)
    }

    /// Returns `false` once the driver should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => self.connect().await,
            Command::Open(open) => self.open_socket(open).await,
            Command::SocketConnect { socket, queue } => {
                let result = match self.sockets.get_mut(&socket) {
                    Some(entry) => entry.connect(queue).await,
                    None => {
                        debug!("[MANAGER] connect on unknown socket {}", socket);
                        return true;
                    }
                };
                if let Err(e) = result {
                    self.on_failure(e);
                }
            }
            Command::Send {
                socket,
                request,
                reply_tx,
            } => self.send(socket, request, reply_tx).await,
            Command::Reply(reply) => self.reply(reply).await,
            Command::CloseSocket { socket, ack } => {
                self.close_socket(socket).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Report(err) => {
                warn!("[MANAGER] {}", err);
                self.events.emit(ManagerEvent::Error(err));
            }
            Command::Shutdown { ack } => {
                self.shutdown().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) {
        let state = self.state();
        if !matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
            trace!("[MANAGER] connect ignored while {}", state);
            return;
        }
        self.terminal = None;
        self.reconnect.reset();
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.establish().await {
            warn!("[MANAGER] connect to {} failed: {}", self.address, e);
            self.channel = None;
            self.connection = None;
            self.set_state(ConnectionState::Disconnected);
            self.events.emit(ManagerEvent::Error(e));
        }
    }

    /// Open a connection, then the shared channel.
    async fn establish(&mut self) -> Result<()> {
        let connection = self
            .transport
            .open(&self.address, &self.options, self.transport_tx.clone())
            .await?;
        debug!("[MANAGER] connected to {} ({})", self.address, connection.id());
        self.connection = Some(connection);
        self.set_state(ConnectionState::Connected);
        self.events.emit(ManagerEvent::Connected);
        self.open_channel().await
    }

    /// Open the shared channel and bring every socket back.
    async fn open_channel(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| WarrenError::connection("no open connection"))?;
        let channel = connection.create_channel().await?;
        debug!("[MANAGER] channel {} ready", channel.id());

        self.channel = Some(channel);
        self.set_state(ConnectionState::Connected);
        self.events.emit(ManagerEvent::Ready);

        self.flush_replies().await;
        self.establish_sockets().await;

        // A socket that failed to come back has already scheduled the next
        // attempt; the budget only resets once everything is restored.
        if self.retry.is_none() && self.channel.is_some() {
            self.reconnect.reset();
        }
        Ok(())
    }

    async fn establish_sockets(&mut self) {
        let ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        for id in ids {
            let Some(channel) = self.channel.clone() else {
                return;
            };
            let result = match self.sockets.get_mut(&id) {
                Some(entry) => entry.establish(&channel).await,
                None => continue,
            };
            if let Err(e) = result {
                self.on_failure(e);
                return;
            }
        }
    }

    async fn open_socket(&mut self, open: OpenSocket) {
        let (kind, role) = match open.role {
            OpenRole::Request => (SocketType::Request, Role::Req(ReqState::new())),
            OpenRole::Reply { requests, commands } => {
                (SocketType::Reply, Role::Rep(RepState::new(requests, commands)))
            }
        };
        debug!("[MANAGER] socket {} ({}) opened", open.id, kind);
        let core = SocketCore::new(open.id, kind, open.options, open.events, open.ready);
        if let Some(err) = &self.terminal {
            core.events.emit(SocketEvent::Error(err.clone()));
        }
        self.sockets.insert(open.id, SocketEntry { core, role });

        let Some(channel) = self.channel.clone() else {
            return;
        };
        let result = match self.sockets.get_mut(&open.id) {
            Some(entry) => entry.establish(&channel).await,
            None => return,
        };
        if let Err(e) = result {
            self.on_failure(e);
        }
    }

    async fn send(&mut self, socket: SocketId, request: OutboundRequest, reply_tx: ReplySender) {
        if let Some(err) = &self.terminal {
            let _ = reply_tx.send(Err(err.clone()));
            return;
        }
        let result = match self.sockets.get_mut(&socket) {
            Some(entry) => entry.send(request, reply_tx).await,
            None => {
                let _ = reply_tx.send(Err(WarrenError::SocketClosed));
                return;
            }
        };
        if let Err(e) = result {
            self.on_failure(e);
        }
    }

    async fn reply(&mut self, reply: ReplyCommand) {
        let Some(channel) = self.channel.clone() else {
            if self.terminal.is_none() {
                trace!("[REP] holding reply until a channel is open");
                self.deferred_replies.push_back(reply);
            }
            return;
        };
        if let Err(e) = publish_reply(&channel, reply).await {
            self.on_failure(e);
        }
    }

    async fn flush_replies(&mut self) {
        while let Some(reply) = self.deferred_replies.pop_front() {
            let Some(channel) = self.channel.clone() else {
                self.deferred_replies.push_front(reply);
                return;
            };
            if let Err(e) = publish_reply(&channel, reply).await {
                self.on_failure(e);
                return;
            }
        }
    }

    async fn close_socket(&mut self, socket: SocketId) {
        let Some(mut entry) = self.sockets.remove(&socket) else {
            return;
        };
        debug!("[{}] socket {} closing", entry.core.kind, socket);
        if entry.core.is_live() {
            // A failing channel reports itself through a transport event
            if let Err(e) = entry.close().await {
                debug!("[{}] socket {} cancel failed: {}", entry.core.kind, socket, e);
            }
        }
        entry.fail_requests(&WarrenError::SocketClosed);
        entry.core.mark_closed();
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Delivery(delivery) => self.on_delivery(delivery).await,
            TransportEvent::ConnectionError { connection, reason } => {
                if self.is_current_connection(connection) {
                    self.on_transport_error(ErrorScope::Connection, reason);
                } else {
                    trace!("[MANAGER] stale error from {}: {}", connection, reason);
                }
            }
            TransportEvent::ConnectionClosed { connection } => {
                if self.is_current_connection(connection) {
                    self.events.emit(ManagerEvent::Closed);
                    self.on_transport_error(ErrorScope::Connection, "connection closed".into());
                } else {
                    trace!("[MANAGER] stale close from {}", connection);
                }
            }
            TransportEvent::Blocked { connection, reason } => {
                if self.is_current_connection(connection) {
                    debug!("[MANAGER] blocked: {}", reason);
                    self.events.emit(ManagerEvent::Blocked(reason));
                }
            }
            TransportEvent::Unblocked { connection } => {
                if self.is_current_connection(connection) {
                    self.events.emit(ManagerEvent::Unblocked);
                }
            }
            TransportEvent::ChannelError { channel, reason } => {
                if self.is_current_channel(channel) {
                    self.on_transport_error(ErrorScope::Channel, reason);
                } else {
                    trace!("[MANAGER] stale error from {}: {}", channel, reason);
                }
            }
            TransportEvent::ChannelClosed { channel } => {
                if self.is_current_channel(channel) {
                    self.events.emit(ManagerEvent::ChannelClosed);
                    self.on_transport_error(ErrorScope::Channel, "channel closed".into());
                } else {
                    trace!("[MANAGER] stale close from {}", channel);
                }
            }
            TransportEvent::Drain { channel } => {
                if self.is_current_channel(channel) {
                    for entry in self.sockets.values() {
                        entry.core.events.emit(SocketEvent::Drain);
                    }
                }
            }
            TransportEvent::Readable { channel } => {
                if self.is_current_channel(channel) {
                    for entry in self.sockets.values() {
                        entry.core.events.emit(SocketEvent::Readable);
                    }
                }
            }
        }
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        if !self.is_current_channel(delivery.channel) {
            trace!("[MANAGER] dropping delivery from replaced {}", delivery.channel);
            return;
        }
        let result = match self
            .sockets
            .values_mut()
            .find(|e| e.owns_consumer(&delivery.consumer_tag))
        {
            Some(entry) => entry.deliver(delivery).await,
            None => {
                trace!("[MANAGER] no socket owns consumer {}", delivery.consumer_tag);
                return;
            }
        };
        if let Err(e) = result {
            self.on_failure(e);
        }
    }

    fn on_failure(&mut self, err: WarrenError) {
        let scope = match err {
            WarrenError::Connection(_) => ErrorScope::Connection,
            _ => ErrorScope::Channel,
        };
        self.on_transport_error(scope, err.to_string());
    }

    /// Tear down what the error invalidated and schedule a retry.
    fn on_transport_error(&mut self, scope: ErrorScope, reason: String) {
        if matches!(self.state(), ConnectionState::Closed | ConnectionState::Failed) {
            return;
        }
        match (self.retry.as_ref().map(|r| r.scope), scope) {
            (Some(pending), ErrorScope::Channel) => {
                debug!("[MANAGER] {} retry underway, ignoring channel error: {}", pending, reason);
                return;
            }
            (Some(ErrorScope::Connection), ErrorScope::Connection) => {
                debug!("[MANAGER] connection retry underway, ignoring: {}", reason);
                return;
            }
            (Some(ErrorScope::Channel), ErrorScope::Connection) => {
                debug!("[MANAGER] connection error supersedes channel retry");
                self.retry = None;
                self.reconnect.reset();
            }
            (None, _) => {}
        }

        warn!("[MANAGER] {} error: {}", scope, reason);
        self.channel = None;
        if scope == ErrorScope::Connection {
            self.connection = None;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.events.emit(ManagerEvent::Disconnected {
            scope,
            reason: reason.clone(),
        });
        for entry in self.sockets.values_mut() {
            entry.on_disconnect();
        }
        self.schedule_retry(scope, reason);
    }

    fn schedule_retry(&mut self, scope: ErrorScope, last_error: String) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                debug!(
                    "[MANAGER] {} retry {}/{} in {:?}",
                    scope,
                    self.reconnect.attempt(),
                    self.reconnect.retries(),
                    delay
                );
                self.retry = Some(Retry {
                    scope,
                    at: Instant::now() + delay,
                    last_error,
                });
            }
            None => self.fail_terminal(WarrenError::ReconnectExhausted {
                attempts: self.reconnect.attempt(),
                last_error,
            }),
        }
    }

    async fn attempt_retry(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        trace!("[MANAGER] retrying after: {}", retry.last_error);

        let result = if retry.scope == ErrorScope::Channel && self.connection.is_some() {
            self.open_channel().await
        } else {
            self.connection = None;
            self.establish().await
        };

        if let Err(e) = result {
            warn!("[MANAGER] reconnect attempt failed: {}", e);
            let scope = if retry.scope == ErrorScope::Connection || matches!(e, WarrenError::Connection(_)) {
                ErrorScope::Connection
            } else {
                ErrorScope::Channel
            };
            self.channel = None;
            if scope == ErrorScope::Connection {
                self.connection = None;
            }
            self.set_state(ConnectionState::Reconnecting);
            self.schedule_retry(scope, e.to_string());
        }
    }

    /// Give up: nothing will make progress until `connect` is called again.
    fn fail_terminal(&mut self, err: WarrenError) {
        error!("[MANAGER] giving up: {}", err);
        self.retry = None;
        self.channel = None;
        self.connection = None;
        self.deferred_replies.clear();
        self.terminal = Some(err.clone());
        self.set_state(ConnectionState::Failed);
        self.events.emit(ManagerEvent::Error(err.clone()));
        for entry in self.sockets.values_mut() {
            entry.fail_requests(&err);
            entry.core.events.emit(SocketEvent::Error(err.clone()));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let retry = self.retry.as_ref().map(|r| r.at);
        self.sockets
            .values()
            .filter_map(SocketEntry::next_expiry)
            .chain(retry)
            .min()
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        for entry in self.sockets.values_mut() {
            entry.expire(now);
        }
        if self.retry.as_ref().is_some_and(|r| r.at <= now) {
            self.attempt_retry().await;
        }
    }

    async fn shutdown(&mut self) {
        debug!("[MANAGER] closing connection to {}", self.address);
        self.set_state(ConnectionState::Closed);
        self.retry = None;
        self.deferred_replies.clear();

        let err = WarrenError::ManagerClosed;
        for (_, mut entry) in std::mem::take(&mut self.sockets) {
            entry.fail_requests(&err);
            entry.core.mark_closed();
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!("[MANAGER] channel close failed: {}", e);
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!("[MANAGER] connection close failed: {}", e);
            }
        }
        self.events.emit(ManagerEvent::Closed);
    }
}

/// Publish a reply, then acknowledge the request it answers.
///
/// Requests delivered on an earlier channel are not acknowledged: the
/// broker already put them back when that channel died.
async fn publish_reply(channel: &Rc<dyn Channel>, reply: ReplyCommand) -> Result<()> {
    match &reply.reply_to {
        Some(queue) => {
            let properties = MessageProperties {
                correlation_id: reply.correlation_id.clone(),
                reply_to: None,
                expiration: reply.expiration,
                persistent: reply.persistent,
            };
            channel.publish(queue, reply.body.clone(), properties).await?;
            trace!("[REP] replied to {}", queue);
        }
        None => debug!("[REP] request carried no reply queue, nothing to send"),
    }

    if reply.channel == channel.id() {
        channel.ack(reply.delivery_tag).await
    } else {
        trace!("[REP] request came from replaced {}, not acking", reply.channel);
        Ok(())
    }
}
