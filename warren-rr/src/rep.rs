//! REP socket protocol state.
//!
//! A reply socket holds at most one consumer per source queue. Connecting a
//! source it already consumes is a no-op. After a reconnect every source is
//! consumed again, since the broker forgets consumers with the channel.

use crate::base::SocketCore;
use crate::command::Command;
use crate::socket::Request;
use hashbrown::HashMap;
use tracing::{debug, trace, warn};
use warren_core::codec;
use warren_core::error::Result;
use warren_core::monitor::SocketEvent;
use warren_core::transport::{ConsumeOptions, ConsumerTag, Delivery, QueueOptions};

pub(crate) struct RepState {
    /// Every source ever connected, in first-connect order
    sources: Vec<String>,
    /// Active consumer per source queue on the current channel
    consumers: HashMap<String, ConsumerTag>,
    requests: flume::Sender<Request>,
    commands: flume::WeakSender<Command>,
}

impl RepState {
    pub(crate) fn new(requests: flume::Sender<Request>, commands: flume::WeakSender<Command>) -> Self {
        Self {
            sources: Vec::new(),
            consumers: HashMap::new(),
            requests,
            commands,
        }
    }

    /// Record a source so it is consumed again after every reconnect.
    pub(crate) fn remember(&mut self, queue: &str) {
        if !self.sources.iter().any(|q| q == queue) {
            self.sources.push(queue.to_string());
        }
    }

    /// Declare a source queue and start consuming it, once.
    pub(crate) async fn connect(&mut self, core: &SocketCore, queue: &str) -> Result<()> {
        if self.consumers.contains_key(queue) {
            trace!("[REP] socket {} already consuming {}", core.id, queue);
            return Ok(());
        }
        let channel = core.channel()?;
        let name = channel
            .declare_queue(queue, QueueOptions::named(core.options.durable))
            .await?;
        core.apply_prefetch(&channel).await?;
        let tag = channel.consume(&name, ConsumeOptions::default()).await?;
        debug!("[REP] socket {} consuming {} as {}", core.id, name, tag);
        self.consumers.insert(queue.to_string(), tag);
        core.events.emit(SocketEvent::Connected(name));
        Ok(())
    }

    pub(crate) fn owns_consumer(&self, tag: &str) -> bool {
        self.consumers.values().any(|t| t == tag)
    }

    /// Hand an inbound request to the application.
    ///
    /// Malformed bodies never reach the application: they are reported and
    /// acknowledged so the broker does not redeliver them.
    pub(crate) async fn handle_request(&mut self, core: &SocketCore, delivery: Delivery) -> Result<()> {
        let body = match codec::parse(&delivery.body) {
            Ok(body) => body,
            Err(e) => {
                warn!("[REP] socket {} discarding malformed request: {}", core.id, e);
                core.events.emit(SocketEvent::ParseError(e.to_string()));
                return core.channel()?.ack(delivery.delivery_tag).await;
            }
        };

        let Some(commands) = self.commands.upgrade() else {
            trace!("[REP] manager gone, leaving request unacked");
            return Ok(());
        };
        let request = Request::new(body, &delivery, core, commands);
        if self.requests.send(request).is_err() {
            debug!("[REP] socket {} handle dropped, leaving request unacked", core.id);
        }
        Ok(())
    }

    /// Forget every consumer that lived on the lost channel.
    pub(crate) fn on_disconnect(&mut self, core: &mut SocketCore) {
        self.consumers.clear();
        core.requeue_connects(&self.sources);
    }

    /// Cancel every consumer of this socket.
    pub(crate) async fn close(&mut self, core: &SocketCore) -> Result<()> {
        if self.consumers.is_empty() {
            return Ok(());
        }
        let channel = core.channel()?;
        for (_, tag) in self.consumers.drain() {
            channel.cancel(&tag).await?;
        }
        Ok(())
    }
}
