//! Abstract broker transport binding.
//!
//! The REQ/REP layer never speaks a wire protocol itself. It drives a
//! broker client through these traits and listens to what the client
//! reports on a [`TransportEventSender`].
//!
//! # Contract
//!
//! - All transport callbacks arrive as [`TransportEvent`]s on the sender
//!   passed to [`Transport::open`], tagged with the id of the connection or
//!   channel they concern. Consumers use the ids to ignore events from
//!   objects they have already replaced.
//! - A failed channel operation returns `WarrenError::Channel`; a failed
//!   connection operation returns `WarrenError::Connection`.
//! - Implementations are single-threaded (`?Send`), matching the one-task
//!   driver that owns them.

use crate::address::Address;
use crate::error::Result;
use crate::options::ConnectionOptions;
use bytes::Bytes;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Identifier of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Identifier of a channel, unique across connections of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts
    pub durable: bool,
    /// Owned by the declaring connection only
    pub exclusive: bool,
    /// Deleted once the last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a named, shared work queue.
    pub const fn named(durable: bool) -> Self {
        Self {
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Options for a private, server-named reply queue.
    pub const fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Consumer registration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries stay unacknowledged until `ack` is called
    pub ack_required: bool,
    /// Only this consumer may read the queue
    pub exclusive: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            ack_required: true,
            exclusive: false,
        }
    }
}

/// Message metadata carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Opaque id echoed on the reply
    pub correlation_id: Option<String>,
    /// Queue the reply must be published to
    pub reply_to: Option<String>,
    /// Drop the message if it is not consumed within this time
    pub expiration: Option<Duration>,
    /// Persistent delivery mode
    pub persistent: bool,
}

/// Broker-assigned consumer handle.
pub type ConsumerTag = String;

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel the consumer lives on
    pub channel: ChannelId,
    /// Consumer the message was delivered to
    pub consumer_tag: ConsumerTag,
    /// Tag to acknowledge the message with (channel-local)
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Everything a transport reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Message for one of the channel's consumers
    Delivery(Delivery),
    /// Connection failed; it and its channels are unusable
    ConnectionError {
        connection: ConnectionId,
        reason: String,
    },
    /// Connection closed
    ConnectionClosed { connection: ConnectionId },
    /// Broker applied flow control
    Blocked {
        connection: ConnectionId,
        reason: String,
    },
    /// Broker lifted flow control
    Unblocked { connection: ConnectionId },
    /// Channel failed; it is unusable
    ChannelError { channel: ChannelId, reason: String },
    /// Channel closed
    ChannelClosed { channel: ChannelId },
    /// Channel write buffer drained
    Drain { channel: ChannelId },
    /// Channel has data to read
    Readable { channel: ChannelId },
}

/// Sending half the transport reports events on.
pub type TransportEventSender = flume::Sender<TransportEvent>;

/// Receiving half the connection manager listens on.
pub type TransportEventReceiver = flume::Receiver<TransportEvent>;

/// Broker client entry point.
#[async_trait::async_trait(?Send)]
pub trait Transport {
    /// Open a connection. Events for the connection and every channel
    /// created from it are reported on `events`.
    async fn open(
        &self,
        address: &Address,
        options: &ConnectionOptions,
        events: TransportEventSender,
    ) -> Result<Box<dyn Connection>>;
}

/// An open broker connection.
#[async_trait::async_trait(?Send)]
pub trait Connection {
    /// Connection identifier used on transport events.
    fn id(&self) -> ConnectionId;

    /// Open a new multiplexed channel.
    async fn create_channel(&self) -> Result<Rc<dyn Channel>>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<()>;
}

/// A multiplexed channel.
#[async_trait::async_trait(?Send)]
pub trait Channel {
    /// Channel identifier used on transport events.
    fn id(&self) -> ChannelId;

    /// Declare a queue, returning its resolved name (the broker picks one
    /// when `name` is empty).
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerTag>;

    /// Stop a consumer.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publish a message straight to a queue.
    async fn publish(&self, queue: &str, body: Bytes, properties: MessageProperties) -> Result<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Limit unacknowledged deliveries for consumers started afterwards.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_option_presets() {
        let named = QueueOptions::named(true);
        assert!(named.durable && !named.exclusive && !named.auto_delete);

        let private = QueueOptions::private();
        assert!(!private.durable && private.exclusive && private.auto_delete);
    }

    #[test]
    fn test_consume_defaults_require_ack() {
        let opts = ConsumeOptions::default();
        assert!(opts.ack_required);
        assert!(!opts.exclusive);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ConnectionId(3).to_string(), "conn-3");
        assert_eq!(ChannelId(9).to_string(), "ch-9");
    }
}
