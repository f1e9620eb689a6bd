//! Connection manager handle and socket factory.

use crate::command::{Command, OpenRole, OpenSocket};
use crate::driver::Driver;
use crate::socket::{RepSocket, ReqSocket, Socket};
use crate::timer::DeadlineTimer;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use warren_core::address::Address;
use warren_core::error::{Result, WarrenError};
use warren_core::monitor::{create_monitor, ManagerEvent, ManagerMonitor};
use warren_core::options::{ConnectionOptions, SocketOptions};
use warren_core::socket_type::SocketType;
use warren_core::transport::Transport;

/// Connection manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted
    Disconnected,
    /// Initial connection in progress
    Connecting,
    /// Connection and shared channel open
    Connected,
    /// Waiting for (or running) a reconnect attempt
    Reconnecting,
    /// Retry budget spent; waiting for an explicit `connect`
    Failed,
    /// Closed by the application
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Owns one broker connection and one shared channel, and hands out
/// sockets multiplexed over that channel.
///
/// Sockets created from the same manager share its channel. Use separate
/// managers when sockets must not affect each other.
///
/// # Example
///
/// ```rust,no_run
/// use warren_core::memory::{MemoryBroker, MemoryTransport};
/// use warren_core::options::{ConnectionOptions, SocketOptions};
/// use warren_rr::ConnectionManager;
/// use serde_json::json;
///
/// # async fn example() -> warren_core::error::Result<()> {
/// let transport = MemoryTransport::new(MemoryBroker::new());
/// let manager = ConnectionManager::new(transport, ConnectionOptions::default())?;
///
/// let rep = manager.rep_socket(SocketOptions::default());
/// rep.connect("jobs")?;
///
/// let req = manager.req_socket(SocketOptions::default());
/// req.connect("jobs")?;
/// let reply = req.send(json!({"foo": "bar"}))?;
///
/// if let Some(request) = rep.recv().await {
///     request.reply(json!({"reply": "wooo"}))?;
/// }
/// assert_eq!(reply.wait().await?, json!({"reply": "wooo"}));
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    commands: flume::Sender<Command>,
    monitor: ManagerMonitor,
    state: Arc<Mutex<ConnectionState>>,
    next_socket: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager and start connecting.
    ///
    /// Must be called inside a compio runtime: the manager's driver runs as
    /// a task on it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` if the configured address cannot be parsed,
    /// or `Connection` if the driver's timer thread cannot be started.
    /// Connection failures are reported on the [`monitor`](Self::monitor).
    pub fn new<T>(transport: T, options: ConnectionOptions) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let address = Address::parse(&options.address)?.with_heartbeat(options.heartbeat);
        debug!("[MANAGER] creating manager for {}", address);

        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        let (events, monitor) = create_monitor();
        let (commands, command_rx) = flume::unbounded();
        let (transport_tx, transport_rx) = flume::unbounded();
        let timer = DeadlineTimer::spawn(format!("warren-timer-{}", address.host))?;

        let driver = Driver::new(
            Box::new(transport),
            options,
            address,
            state.clone(),
            events,
            transport_tx,
            timer,
        );
        compio::runtime::spawn(driver.run(command_rx, transport_rx)).detach();

        let manager = Self {
            commands,
            monitor,
            state,
            next_socket: AtomicU64::new(0),
        };
        manager.connect()?;
        Ok(manager)
    }

    /// Open the connection again after a failed attempt or a spent retry
    /// budget. Does nothing while connected or reconnecting.
    pub fn connect(&self) -> Result<()> {
        self.submit(Command::Connect)
    }

    /// Create a socket of the given kind.
    pub fn socket(&self, kind: SocketType, options: SocketOptions) -> Socket {
        match kind {
            SocketType::Request => Socket::Request(self.req_socket(options)),
            SocketType::Reply => Socket::Reply(self.rep_socket(options)),
        }
    }

    /// Create a socket from a kind name (`req`, `request`, `rep`, `reply`).
    ///
    /// An unknown name yields `None` and an `InvalidSocketType` error on the
    /// manager's monitor, delivered asynchronously like every other error.
    pub fn socket_named(&self, kind: &str, options: SocketOptions) -> Option<Socket> {
        match kind.parse::<SocketType>() {
            Ok(kind) => Some(self.socket(kind, options)),
            Err(err) => {
                // A closed manager has nobody left to tell
                let _ = self.submit(Command::Report(err));
                None
            }
        }
    }

    /// Create a REQ socket.
    pub fn req_socket(&self, options: SocketOptions) -> ReqSocket {
        let id = self.next_socket_id();
        let (events, monitor) = create_monitor();
        let ready = Arc::new(AtomicBool::new(false));
        let open = OpenSocket {
            id,
            options,
            events,
            ready: ready.clone(),
            role: OpenRole::Request,
        };
        let _ = self.submit(Command::Open(open));
        ReqSocket::new(id, self.commands.clone(), monitor, ready)
    }

    /// Create a REP socket.
    pub fn rep_socket(&self, options: SocketOptions) -> RepSocket {
        let id = self.next_socket_id();
        let (events, monitor) = create_monitor();
        let ready = Arc::new(AtomicBool::new(false));
        let (requests_tx, requests) = flume::unbounded();
        let open = OpenSocket {
            id,
            options,
            events,
            ready: ready.clone(),
            role: OpenRole::Reply {
                requests: requests_tx,
                commands: self.commands.downgrade(),
            },
        };
        let _ = self.submit(Command::Open(open));
        RepSocket::new(id, self.commands.clone(), monitor, requests, ready)
    }

    /// Lifecycle events. Clones share one stream.
    pub fn monitor(&self) -> ManagerMonitor {
        self.monitor.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Close the connection. Pending requests fail with `ManagerClosed` and
    /// no reconnection is attempted afterwards.
    pub async fn close(&self) {
        let (ack, done) = flume::bounded(1);
        if self.submit(Command::Shutdown { ack }).is_ok() {
            let _ = done.recv_async().await;
        }
    }

    fn next_socket_id(&self) -> u64 {
        self.next_socket.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn submit(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| WarrenError::ManagerClosed)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Wait for the next manager event matching `pred`, skipping others.
///
/// Returns `None` if the manager stops before one arrives.
pub async fn wait_for_event<F>(monitor: &ManagerMonitor, mut pred: F) -> Option<ManagerEvent>
where
    F: FnMut(&ManagerEvent) -> bool,
{
    while let Ok(event) = monitor.recv_async().await {
        if pred(&event) {
            return Some(event);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}
