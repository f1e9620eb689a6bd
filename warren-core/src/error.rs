/// Warren Error Types
///
/// One taxonomy for every failure the REQ/REP layer can report. Errors are
/// `Clone` so they can ride on event monitors and reply channels.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Warren operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarrenError {
    /// Connection-scope transport failure (drives reconnection)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-scope transport failure (drives reconnection)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Unsupported socket kind requested from the factory
    #[error("Invalid socket type: {0}")]
    InvalidSocketType(String),

    /// Inbound payload could not be deserialized
    #[error("Parse error: {0}")]
    Parse(String),

    /// Handler-reported failure carried back as a tagged reply
    #[error("Application error: {0}")]
    Application(String),

    /// Reconnect budget consumed; the manager will not retry again
    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Broker address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Request had nowhere to go (empty rotation list)
    #[error("No destination connected")]
    NoDestination,

    /// Pending request exceeded the configured max age
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Socket was closed while the operation was outstanding
    #[error("Socket closed")]
    SocketClosed,

    /// Connection manager was closed or its driver has stopped
    #[error("Connection manager closed")]
    ManagerClosed,
}

/// Result type alias for Warren operations
pub type Result<T> = std::result::Result<T, WarrenError>;

impl WarrenError {
    /// Create a connection-scope error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a channel-scope error
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an application error
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Check if this error came from the transport (and therefore triggers
    /// the reconnect state machine rather than reaching sockets directly)
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Channel(_))
    }

    /// Check if this error ends the manager's useful life
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReconnectExhausted { .. } | Self::ManagerClosed | Self::InvalidAddress(_)
        )
    }

    /// Check if this error is local to a single message
    #[must_use]
    pub const fn is_message_local(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Application(_))
    }
}

impl From<serde_json::Error> for WarrenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
