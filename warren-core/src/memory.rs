//! In-process broker for tests and demos.
//!
//! `MemoryBroker` keeps queues, consumers and unacknowledged deliveries in
//! memory and exposes them through the [`Transport`] traits with
//! RabbitMQ-like semantics:
//!
//! - Declaring is idempotent; an empty queue name gets a generated
//!   `amq.gen-N` name.
//! - Exclusive queues belong to the declaring connection and go away with
//!   it. Auto-delete queues go away with their last consumer.
//! - Publishing to a queue that does not exist drops the message.
//! - Consumers of one queue are served round-robin. A consumer started
//!   after `set_prefetch(n)` holds at most `n` unacknowledged deliveries.
//! - Losing a channel (or its connection) puts its unacknowledged messages
//!   back at the head of their queues, flagged as redelivered.
//!
//! It also carries fault injection hooks (fail channels, drop connections,
//! refuse new ones) so the reconnect machinery can be exercised without a
//! real broker.
//!
//! # Usage
//!
//! ```rust
//! use warren_core::memory::{MemoryBroker, MemoryTransport};
//!
//! let broker = MemoryBroker::new();
//! let transport = MemoryTransport::new(broker.clone());
//!
//! // ... hand `transport` to a connection manager ...
//!
//! assert!(!broker.queue_exists("jobs"));
//! ```

use crate::address::Address;
use crate::error::{Result, WarrenError};
use crate::options::ConnectionOptions;
use crate::transport::{
    Channel, ChannelId, Connection, ConnectionId, ConsumeOptions, ConsumerTag, Delivery,
    MessageProperties, QueueOptions, Transport, TransportEvent, TransportEventSender,
};
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    enqueued_at: Instant,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.properties
            .expiration
            .is_some_and(|ttl| now.duration_since(self.enqueued_at) >= ttl)
    }
}

#[derive(Debug)]
struct ConsumerState {
    tag: ConsumerTag,
    channel: ChannelId,
    ack_required: bool,
    exclusive: bool,
    prefetch: Option<u16>,
    in_flight: usize,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        if !self.ack_required {
            return true;
        }
        match self.prefetch {
            Some(limit) => self.in_flight < usize::from(limit),
            None => true,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    owner: Option<ConnectionId>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: ConsumerTag,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    connection: ConnectionId,
    prefetch: Option<u16>,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Debug)]
struct ConnectionState {
    events: TransportEventSender,
    channels: Vec<ChannelId>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    refuse_connections: bool,
    refuse_channels: bool,
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notify(&self, connection: ConnectionId, event: TransportEvent) {
        if let Some(conn) = self.connections.get(&connection) {
            // Receiver gone means nobody is listening anymore
            let _ = conn.events.send(event);
        }
    }

    fn open_channel(&self, channel: ChannelId) -> Result<&ChannelState> {
        self.channels
            .get(&channel)
            .ok_or_else(|| WarrenError::channel(format!("{channel} is closed")))
    }

    /// Hand ready messages to consumers with spare capacity, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues,
            channels,
            connections,
            ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        let now = Instant::now();

        loop {
            while queue.messages.front().is_some_and(|m| m.is_expired(now)) {
                trace!(queue = queue_name, "dropping expired message");
                queue.messages.pop_front();
            }
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                break;
            }

            let len = queue.consumers.len();
            let Some(idx) = (0..len)
                .map(|offset| (queue.cursor + offset) % len)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            queue.cursor = (idx + 1) % len;

            let Some(message) = queue.messages.pop_front() else {
                break;
            };
            let consumer = &mut queue.consumers[idx];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                break;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;

            let delivery = Delivery {
                channel: consumer.channel,
                consumer_tag: consumer.tag.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.ack_required {
                consumer.in_flight += 1;
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }

            if let Some(conn) = connections.get(&channel.connection) {
                let _ = conn.events.send(TransportEvent::Delivery(delivery));
            }
        }
    }

    /// Remove a consumer from its queue, deleting an auto-delete queue left
    /// without consumers. Returns the queue name.
    fn remove_consumer(&mut self, tag: &str) -> Option<String> {
        let queue_name = self
            .queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == tag))
            .map(|(name, _)| name.clone())?;

        let queue = self.queues.get_mut(&queue_name)?;
        queue.consumers.retain(|c| c.tag != tag);
        if queue.cursor >= queue.consumers.len() {
            queue.cursor = 0;
        }
        if queue.options.auto_delete && queue.consumers.is_empty() {
            debug!(queue = %queue_name, "auto-deleting queue");
            self.queues.remove(&queue_name);
        }
        Some(queue_name)
    }

    /// Drop a channel: its consumers go away and its unacknowledged
    /// messages return to the head of their queues.
    fn teardown_channel(&mut self, channel: ChannelId) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };

        let mut unacked: Vec<(u64, Unacked)> = state.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = Vec::new();
        for (_, entry) in unacked {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.push(entry.queue);
            }
        }

        let tags: Vec<ConsumerTag> = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| c.channel == channel)
            .map(|c| c.tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        if let Some(conn) = self.connections.get_mut(&state.connection) {
            conn.channels.retain(|c| *c != channel);
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn teardown_connection(&mut self, connection: ConnectionId) {
        let channels = match self.connections.get(&connection) {
            Some(conn) => conn.channels.clone(),
            None => return,
        };
        for channel in channels {
            self.teardown_channel(channel);
        }
        self.queues
            .retain(|_, q| !(q.options.exclusive && q.owner == Some(connection)));
    }
}

/// Shared in-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn open_connection(&self, events: TransportEventSender) -> Result<ConnectionId> {
        let mut state = self.inner.lock();
        if state.refuse_connections {
            return Err(WarrenError::connection("connection refused"));
        }
        let id = ConnectionId(state.next_id());
        state.connections.insert(
            id,
            ConnectionState {
                events,
                channels: Vec::new(),
            },
        );
        debug!(connection = %id, "memory broker accepted connection");
        Ok(id)
    }

    fn create_channel(&self, connection: ConnectionId) -> Result<ChannelId> {
        let mut state = self.inner.lock();
        if !state.connections.contains_key(&connection) {
            return Err(WarrenError::connection(format!("{connection} is closed")));
        }
        if state.refuse_channels {
            return Err(WarrenError::channel("channel refused"));
        }
        let id = ChannelId(state.next_id());
        state.channels.insert(
            id,
            ChannelState {
                connection,
                prefetch: None,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
            },
        );
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.channels.push(id);
        }
        Ok(id)
    }

    fn declare_queue(&self, channel: ChannelId, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.inner.lock();
        let owner = state.open_channel(channel)?.connection;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(queue) if queue.options.exclusive && queue.owner != Some(owner) => {
                Err(WarrenError::channel(format!(
                    "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                )))
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        options,
                        owner: options.exclusive.then_some(owner),
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                trace!(queue = %name, ?options, "queue declared");
                Ok(name)
            }
        }
    }

    fn consume(&self, channel: ChannelId, queue: &str, options: ConsumeOptions) -> Result<ConsumerTag> {
        let mut state = self.inner.lock();
        let prefetch = state.open_channel(channel)?.prefetch;
        let tag = format!("amq.ctag-{}", state.next_id());

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(WarrenError::channel(format!("NOT_FOUND - no queue '{queue}'")));
        };
        if q.consumers.iter().any(|c| c.exclusive) || (options.exclusive && !q.consumers.is_empty()) {
            return Err(WarrenError::channel(format!(
                "ACCESS_REFUSED - queue '{queue}' has an exclusive consumer"
            )));
        }
        q.consumers.push(ConsumerState {
            tag: tag.clone(),
            channel,
            ack_required: options.ack_required,
            exclusive: options.exclusive,
            prefetch,
            in_flight: 0,
        });
        state.dispatch(queue);
        Ok(tag)
    }

    fn cancel(&self, channel: ChannelId, tag: &str) -> Result<()> {
        let mut state = self.inner.lock();
        state.open_channel(channel)?;
        state.remove_consumer(tag);
        Ok(())
    }

    fn publish_on(&self, channel: ChannelId, queue: &str, body: Bytes, properties: MessageProperties) -> Result<()> {
        let mut state = self.inner.lock();
        state.open_channel(channel)?;
        Self::enqueue(&mut state, queue, body, properties);
        Ok(())
    }

    fn enqueue(state: &mut BrokerState, queue: &str, body: Bytes, properties: MessageProperties) {
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.messages.push_back(StoredMessage {
                    body,
                    properties,
                    enqueued_at: Instant::now(),
                    redelivered: false,
                });
                state.dispatch(queue);
            }
            None => trace!(queue, "unroutable message dropped"),
        }
    }

    fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<()> {
        let mut state = self.inner.lock();
        let entry = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| WarrenError::channel(format!("{channel} is closed")))?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                WarrenError::channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })?;

        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == entry.consumer_tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        state.dispatch(&entry.queue);
        Ok(())
    }

    fn set_prefetch(&self, channel: ChannelId, count: u16) -> Result<()> {
        let mut state = self.inner.lock();
        let ch = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| WarrenError::channel(format!("{channel} is closed")))?;
        ch.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    fn close_channel(&self, channel: ChannelId) {
        let mut state = self.inner.lock();
        let Some(connection) = state.channels.get(&channel).map(|c| c.connection) else {
            return;
        };
        state.teardown_channel(channel);
        state.notify(connection, TransportEvent::ChannelClosed { channel });
    }

    fn close_connection(&self, connection: ConnectionId) {
        let mut state = self.inner.lock();
        state.teardown_connection(connection);
        state.notify(connection, TransportEvent::ConnectionClosed { connection });
        state.connections.remove(&connection);
    }

    // === Fault injection ===

    /// Fail every open channel with a channel-scope error.
    pub fn fail_channels(&self, reason: &str) {
        let mut state = self.inner.lock();
        let channels: Vec<(ChannelId, ConnectionId)> =
            state.channels.iter().map(|(id, c)| (*id, c.connection)).collect();
        for (channel, connection) in channels {
            debug!(%channel, reason, "injecting channel error");
            state.teardown_channel(channel);
            state.notify(
                connection,
                TransportEvent::ChannelError {
                    channel,
                    reason: reason.to_string(),
                },
            );
            state.notify(connection, TransportEvent::ChannelClosed { channel });
        }
    }

    /// Drop every connection with a connection-scope error.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.inner.lock();
        let connections: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for connection in connections {
            debug!(%connection, reason, "injecting connection error");
            state.teardown_connection(connection);
            state.notify(
                connection,
                TransportEvent::ConnectionError {
                    connection,
                    reason: reason.to_string(),
                },
            );
            state.notify(connection, TransportEvent::ConnectionClosed { connection });
            state.connections.remove(&connection);
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse_connections = refuse;
    }

    /// Refuse (or accept again) new channels.
    pub fn set_refuse_channels(&self, refuse: bool) {
        self.inner.lock().refuse_channels = refuse;
    }

    /// Apply flow control to every connection.
    pub fn block(&self, reason: &str) {
        let state = self.inner.lock();
        for connection in state.connections.keys() {
            state.notify(
                *connection,
                TransportEvent::Blocked {
                    connection: *connection,
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Lift flow control on every connection.
    pub fn unblock(&self) {
        let state = self.inner.lock();
        for connection in state.connections.keys() {
            state.notify(*connection, TransportEvent::Unblocked { connection: *connection });
        }
    }

    /// Report a drained write buffer on every channel.
    pub fn emit_drain(&self) {
        let state = self.inner.lock();
        for (channel, ch) in &state.channels {
            state.notify(ch.connection, TransportEvent::Drain { channel: *channel });
        }
    }

    /// Report readable data on every channel.
    pub fn emit_readable(&self) {
        let state = self.inner.lock();
        for (channel, ch) in &state.channels {
            state.notify(ch.connection, TransportEvent::Readable { channel: *channel });
        }
    }

    // === Inspection and out-of-band access ===

    /// Publish a message to a queue without going through a channel.
    pub fn publish(&self, queue: &str, body: impl Into<Bytes>, properties: MessageProperties) {
        let mut state = self.inner.lock();
        Self::enqueue(&mut state, queue, body.into(), properties);
    }

    /// Take the next ready message off a queue (no acknowledgement needed).
    pub fn take_message(&self, queue: &str) -> Option<(Bytes, MessageProperties)> {
        let mut state = self.inner.lock();
        let message = state.queues.get_mut(queue)?.messages.pop_front()?;
        Some((message.body, message.properties))
    }

    /// Whether a queue exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock().queues.contains_key(queue)
    }

    /// Number of ready (not yet delivered) messages in a queue.
    pub fn message_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Number of delivered but unacknowledged messages from a queue.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

/// [`Transport`] backed by a [`MemoryBroker`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    /// Create a transport talking to the given broker.
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    /// The broker behind this transport.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait::async_trait(?Send)]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        address: &Address,
        _options: &ConnectionOptions,
        events: TransportEventSender,
    ) -> Result<Box<dyn Connection>> {
        trace!(%address, "opening memory connection");
        let id = self.broker.open_connection(events)?;
        Ok(Box::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
}

#[async_trait::async_trait(?Send)]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn create_channel(&self) -> Result<Rc<dyn Channel>> {
        let id = self.broker.create_channel(self.id)?;
        Ok(Rc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
}

#[async_trait::async_trait(?Send)]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.broker.declare_queue(self.id, name, options)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerTag> {
        self.broker.consume(self.id, queue, options)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker.cancel(self.id, consumer_tag)
    }

    async fn publish(&self, queue: &str, body: Bytes, properties: MessageProperties) -> Result<()> {
        self.broker.publish_on(self.id, queue, body, properties)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker.ack(self.id, delivery_tag)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.broker.set_prefetch(self.id, count)
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open(broker: &MemoryBroker) -> (ConnectionId, ChannelId, flume::Receiver<TransportEvent>) {
        let (tx, rx) = flume::unbounded();
        let conn = broker.open_connection(tx).unwrap();
        let ch = broker.create_channel(conn).unwrap();
        (conn, ch, rx)
    }

    fn deliveries(rx: &flume::Receiver<TransportEvent>) -> Vec<Delivery> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                TransportEvent::Delivery(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_declare_is_idempotent_and_generates_names() {
        let broker = MemoryBroker::new();
        let (_, ch, _rx) = open(&broker);

        let a = broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        let b = broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        assert_eq!(a, b);

        let generated = broker.declare_queue(ch, "", QueueOptions::private()).unwrap();
        assert!(generated.starts_with("amq.gen-"));
        assert!(broker.queue_exists(&generated));
    }

    #[test]
    fn test_prefetch_bounds_in_flight() {
        let broker = MemoryBroker::new();
        let (_, ch, rx) = open(&broker);
        broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        broker.set_prefetch(ch, 1).unwrap();
        broker.consume(ch, "jobs", ConsumeOptions::default()).unwrap();

        broker.publish("jobs", "1", MessageProperties::default());
        broker.publish("jobs", "2", MessageProperties::default());

        let first = deliveries(&rx);
        assert_eq!(first.len(), 1);
        assert_eq!(broker.message_count("jobs"), 1);

        broker.ack(ch, first[0].delivery_tag).unwrap();
        let second = deliveries(&rx);
        assert_eq!(second.len(), 1);
        assert_eq!(&second[0].body[..], b"2");
    }

    #[test]
    fn test_round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let (_, ch, rx) = open(&broker);
        broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        let a = broker.consume(ch, "jobs", ConsumeOptions::default()).unwrap();
        let b = broker.consume(ch, "jobs", ConsumeOptions::default()).unwrap();

        for i in 0..4 {
            broker.publish("jobs", format!("{i}"), MessageProperties::default());
        }
        let tags: Vec<_> = deliveries(&rx).into_iter().map(|d| d.consumer_tag).collect();
        assert_eq!(tags, vec![a.clone(), b.clone(), a, b]);
    }

    #[test]
    fn test_channel_failure_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (_, ch, rx) = open(&broker);
        broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        broker.consume(ch, "jobs", ConsumeOptions::default()).unwrap();
        broker.publish("jobs", "1", MessageProperties::default());
        assert_eq!(deliveries(&rx).len(), 1);

        broker.fail_channels("boom");

        assert_eq!(broker.message_count("jobs"), 1);
        assert_eq!(broker.consumer_count("jobs"), 0);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events[0], TransportEvent::ChannelError { .. }));
        assert!(matches!(events[1], TransportEvent::ChannelClosed { .. }));
        assert!(broker.publish_on(ch, "jobs", Bytes::new(), MessageProperties::default()).is_err());
    }

    #[test]
    fn test_private_queue_dies_with_its_consumer() {
        let broker = MemoryBroker::new();
        let (_, ch, _rx) = open(&broker);
        let name = broker.declare_queue(ch, "", QueueOptions::private()).unwrap();
        broker
            .consume(ch, &name, ConsumeOptions { ack_required: false, exclusive: true })
            .unwrap();

        broker.fail_channels("boom");
        assert!(!broker.queue_exists(&name));
    }

    #[test]
    fn test_exclusive_queue_locked_to_owner() {
        let broker = MemoryBroker::new();
        let (_, ch1, _rx1) = open(&broker);
        let (_, ch2, _rx2) = open(&broker);
        broker.declare_queue(ch1, "mine", QueueOptions::private()).unwrap();
        let err = broker.declare_queue(ch2, "mine", QueueOptions::private()).unwrap_err();
        assert!(matches!(err, WarrenError::Channel(_)));
    }

    #[test]
    fn test_refused_connections() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let (tx, _rx) = flume::unbounded();
        assert!(matches!(
            broker.open_connection(tx),
            Err(WarrenError::Connection(_))
        ));
    }

    #[test]
    fn test_expired_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let (_, ch, rx) = open(&broker);
        broker.declare_queue(ch, "jobs", QueueOptions::default()).unwrap();
        broker.publish(
            "jobs",
            "stale",
            MessageProperties {
                expiration: Some(Duration::ZERO),
                ..MessageProperties::default()
            },
        );
        broker.consume(ch, "jobs", ConsumeOptions::default()).unwrap();
        assert!(deliveries(&rx).is_empty());
        assert_eq!(broker.message_count("jobs"), 0);
    }

    #[test]
    fn test_unroutable_is_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("nowhere", "x", MessageProperties::default());
        assert!(!broker.queue_exists("nowhere"));
    }
}
