//! REQ socket protocol state.
//!
//! A request socket may only publish once two things hold at the same
//! time: its private reply queue is declared and consumed, and at least one
//! destination queue has been declared. Sends issued before that wait in a
//! dedicated FIFO and are flushed the moment both become true.
//!
//! Outgoing requests are spread round-robin over the connected
//! destinations. Replies are matched to their caller by correlation id;
//! replies nobody waits for are dropped.

use crate::base::{DeferredOp, SocketCore};
use bytes::Bytes;
use hashbrown::HashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use warren_core::codec;
use warren_core::error::{Result, WarrenError};
use warren_core::monitor::SocketEvent;
use warren_core::transport::{ConsumeOptions, ConsumerTag, Delivery, MessageProperties, QueueOptions};

/// Channel a pending request is resolved on.
pub(crate) type ReplySender = flume::Sender<Result<Value>>;

/// A request ready to be published.
#[derive(Debug)]
pub(crate) struct OutboundRequest {
    pub(crate) correlation_id: String,
    pub(crate) body: Bytes,
}

#[derive(Debug)]
struct PendingRequest {
    reply_tx: ReplySender,
    issued_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct ReqState {
    /// Every destination ever requested, in first-request order
    requested: Vec<String>,
    /// Declared destinations on the current channel
    rotation: Vec<String>,
    next: usize,
    reply_queue: Option<String>,
    reply_consumer: Option<ConsumerTag>,
    pending: HashMap<String, PendingRequest>,
    deferred_sends: VecDeque<OutboundRequest>,
}

impl ReqState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn can_send(&self, core: &SocketCore) -> bool {
        core.is_live() && self.reply_queue.is_some() && !self.rotation.is_empty()
    }

    /// Record a destination so it is re-declared after every reconnect.
    pub(crate) fn remember(&mut self, queue: &str) {
        if !self.requested.iter().any(|q| q == queue) {
            self.requested.push(queue.to_string());
        }
    }

    /// Track a request until its reply arrives.
    pub(crate) fn register(&mut self, correlation_id: String, reply_tx: ReplySender) {
        self.pending.insert(
            correlation_id,
            PendingRequest {
                reply_tx,
                issued_at: Instant::now(),
            },
        );
    }

    /// Declare and consume the private reply queue on the bound channel.
    pub(crate) async fn establish(&mut self, core: &SocketCore) -> Result<()> {
        let channel = core.channel()?;
        let queue = channel.declare_queue("", QueueOptions::private()).await?;
        let consumer = channel
            .consume(
                &queue,
                ConsumeOptions {
                    ack_required: false,
                    exclusive: true,
                },
            )
            .await?;
        debug!("[REQ] socket {} reply queue {}", core.id, queue);
        self.reply_queue = Some(queue);
        self.reply_consumer = Some(consumer);
        self.flush(core).await
    }

    /// Declare a destination and add it to the rotation.
    pub(crate) async fn connect(&mut self, core: &SocketCore, queue: &str) -> Result<()> {
        if self.rotation.iter().any(|q| q == queue) {
            return Ok(());
        }
        let channel = core.channel()?;
        let name = channel
            .declare_queue(queue, QueueOptions::named(core.options.durable))
            .await?;
        if !self.rotation.contains(&name) {
            self.rotation.push(name.clone());
        }
        debug!("[REQ] socket {} connected to {}", core.id, name);
        core.events.emit(SocketEvent::Connected(name));
        self.flush(core).await
    }

    /// Publish a request now, or hold it until the socket can send.
    pub(crate) async fn send(&mut self, core: &SocketCore, request: OutboundRequest) -> Result<()> {
        if !self.can_send(core) {
            trace!("[REQ] holding {} until destinations are ready", request.correlation_id);
            self.deferred_sends.push_back(request);
            return Ok(());
        }
        self.publish(core, request).await
    }

    async fn flush(&mut self, core: &SocketCore) -> Result<()> {
        while self.can_send(core) {
            let Some(request) = self.deferred_sends.pop_front() else {
                break;
            };
            self.publish(core, request).await?;
        }
        Ok(())
    }

    async fn publish(&mut self, core: &SocketCore, request: OutboundRequest) -> Result<()> {
        let Some(queue) = self.next_destination() else {
            warn!("[REQ] no destination for {}, dropping", request.correlation_id);
            self.resolve(&request.correlation_id, Err(WarrenError::NoDestination));
            return Ok(());
        };

        let properties = MessageProperties {
            correlation_id: Some(request.correlation_id.clone()),
            reply_to: self.reply_queue.clone(),
            expiration: core.options.expiration,
            persistent: core.options.persistent,
        };
        let channel = match core.channel() {
            Ok(channel) => channel,
            Err(e) => {
                self.deferred_sends.push_front(request);
                return Err(e);
            }
        };
        if let Err(e) = channel.publish(&queue, request.body.clone(), properties).await {
            self.deferred_sends.push_front(request);
            return Err(e);
        }
        trace!("[REQ] sent {} to {}", request.correlation_id, queue);
        Ok(())
    }

    fn next_destination(&mut self) -> Option<String> {
        if self.rotation.is_empty() {
            return None;
        }
        if self.next >= self.rotation.len() {
            self.next = 0;
        }
        let queue = self.rotation[self.next].clone();
        self.next = (self.next + 1) % self.rotation.len();
        Some(queue)
    }

    pub(crate) fn owns_consumer(&self, tag: &str) -> bool {
        self.reply_consumer.as_deref() == Some(tag)
    }

    /// Resolve the pending request a reply belongs to.
    pub(crate) fn handle_reply(&mut self, core: &SocketCore, delivery: Delivery) {
        let result = match codec::parse(&delivery.body) {
            Ok(value) => codec::decode_reply(value),
            Err(e) => {
                warn!("[REQ] socket {} malformed reply: {}", core.id, e);
                core.events.emit(SocketEvent::ParseError(e.to_string()));
                Err(e)
            }
        };

        let Some(correlation_id) = delivery.properties.correlation_id else {
            trace!("[REQ] reply without correlation id, dropping");
            return;
        };
        self.resolve(&correlation_id, result);
    }

    fn resolve(&mut self, correlation_id: &str, result: Result<Value>) {
        match self.pending.remove(correlation_id) {
            // Caller may have stopped waiting
            Some(pending) => {
                let _ = pending.reply_tx.send(result);
            }
            None => trace!("[REQ] no pending request for {}, dropping reply", correlation_id),
        }
    }

    /// Forget everything that lived on the lost channel.
    pub(crate) fn on_disconnect(&mut self, core: &mut SocketCore) {
        self.rotation.clear();
        self.next = 0;
        self.reply_queue = None;
        self.reply_consumer = None;
        core.requeue_connects(&self.requested);
    }

    /// When the oldest pending request runs out of time.
    pub(crate) fn next_expiry(&self, timeout: Duration) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.issued_at + timeout)
            .min()
    }

    /// Fail every pending request older than `timeout`.
    pub(crate) fn expire(&mut self, core: &mut SocketCore, timeout: Duration, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        debug!("[REQ] socket {} timing out {} request(s)", core.id, expired.len());
        for id in &expired {
            self.resolve(id, Err(WarrenError::Timeout(timeout)));
        }
        self.deferred_sends
            .retain(|r| !expired.contains(&r.correlation_id));
        core.deferred.retain(|op| match op {
            DeferredOp::Send(r) => !expired.contains(&r.correlation_id),
            DeferredOp::Connect(_) => true,
        });
    }

    /// Fail every pending and buffered request.
    pub(crate) fn fail_all(&mut self, core: &mut SocketCore, err: &WarrenError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply_tx.send(Err(err.clone()));
        }
        self.deferred_sends.clear();
        core.deferred
            .retain(|op| !matches!(op, DeferredOp::Send(_)));
    }

    /// Stop consuming the reply queue (which then deletes itself).
    pub(crate) async fn close(&mut self, core: &SocketCore) -> Result<()> {
        if let Some(tag) = self.reply_consumer.take() {
            core.channel()?.cancel(&tag).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
