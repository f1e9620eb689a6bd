//! Socket base protocol shared by REQ and REP sockets.
//!
//! `SocketCore` holds everything both roles need while the driver owns
//! them: the readiness state machine, a weak handle to the manager's shared
//! channel, the FIFO buffer of operations requested before the socket was
//! ready, and the socket's event sink.
//!
//! # State Machine
//!
//! ```text
//! NotReady → (channel ready) → Establishing → (replay done) → Ready
//!     ↑                                                          │
//!     └──────────────────── (disconnect) ────────────────────────┘
//! ```

use crate::req::OutboundRequest;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;
use warren_core::error::{Result, WarrenError};
use warren_core::monitor::{EventSink, SocketEvent};
use warren_core::options::SocketOptions;
use warren_core::socket_type::SocketType;
use warren_core::transport::Channel;

/// Identifier the manager assigns to each socket it creates.
pub type SocketId = u64;

/// Socket readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No usable channel; operations are buffered
    NotReady,
    /// Channel bound, broker-side state and deferred work being replayed
    Establishing,
    /// Operations execute immediately
    Ready,
}

/// An operation requested before the socket was ready.
#[derive(Debug)]
pub(crate) enum DeferredOp {
    Connect(String),
    Send(OutboundRequest),
}

pub(crate) struct SocketCore {
    pub(crate) id: SocketId,
    pub(crate) kind: SocketType,
    pub(crate) options: SocketOptions,
    pub(crate) readiness: Readiness,
    channel: Option<Weak<dyn Channel>>,
    pub(crate) deferred: VecDeque<DeferredOp>,
    pub(crate) events: EventSink<SocketEvent>,
    ready_flag: Arc<AtomicBool>,
}

impl SocketCore {
    pub(crate) fn new(
        id: SocketId,
        kind: SocketType,
        options: SocketOptions,
        events: EventSink<SocketEvent>,
        ready_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            kind,
            options,
            readiness: Readiness::NotReady,
            channel: None,
            deferred: VecDeque::new(),
            events,
            ready_flag,
        }
    }

    /// The bound channel, if it is still alive.
    pub(crate) fn channel(&self) -> Result<Rc<dyn Channel>> {
        self.channel
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| WarrenError::channel("socket has no usable channel"))
    }

    /// Bind to a freshly opened channel and start re-establishing.
    pub(crate) async fn bind(&mut self, channel: &Rc<dyn Channel>) -> Result<()> {
        self.channel = Some(Rc::downgrade(channel));
        self.readiness = Readiness::Establishing;
        if self.options.prefetch.is_some() {
            self.apply_prefetch(channel).await?;
        }
        trace!("[{}] socket {} bound to {}", self.kind, self.id, channel.id());
        Ok(())
    }

    /// Set this socket's prefetch on the shared channel (0 when unset).
    ///
    /// The channel setting applies to consumers started after it, so it is
    /// re-applied before each consume.
    pub(crate) async fn apply_prefetch(&self, channel: &Rc<dyn Channel>) -> Result<()> {
        channel.set_prefetch(self.options.prefetch.unwrap_or(0)).await
    }

    pub(crate) fn mark_ready(&mut self) {
        self.readiness = Readiness::Ready;
        self.ready_flag.store(true, Ordering::Release);
        self.events.emit(SocketEvent::Ready);
    }

    /// Drop the channel and go back to buffering.
    pub(crate) fn mark_not_ready(&mut self) {
        let was = self.readiness;
        self.readiness = Readiness::NotReady;
        self.channel = None;
        self.ready_flag.store(false, Ordering::Release);
        if was != Readiness::NotReady {
            self.events.emit(SocketEvent::NotReady);
        }
    }

    /// Detach for good.
    pub(crate) fn mark_closed(&mut self) {
        self.readiness = Readiness::NotReady;
        self.channel = None;
        self.deferred.clear();
        self.ready_flag.store(false, Ordering::Release);
        self.events.emit(SocketEvent::Closed);
    }

    /// Whether operations can run right now instead of being buffered.
    pub(crate) fn is_live(&self) -> bool {
        self.readiness != Readiness::NotReady
    }

    /// Rebuild the deferred buffer after a disconnect: connects for every
    /// remembered queue first, then whatever else was waiting, in order.
    pub(crate) fn requeue_connects(&mut self, queues: &[String]) {
        let rest: Vec<DeferredOp> = self
            .deferred
            .drain(..)
            .filter(|op| !matches!(op, DeferredOp::Connect(_)))
            .collect();
        self.deferred
            .extend(queues.iter().cloned().map(DeferredOp::Connect));
        self.deferred.extend(rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use warren_core::monitor::create_monitor;

    fn core() -> (SocketCore, flume::Receiver<SocketEvent>, Arc<AtomicBool>) {
        let (sink, monitor) = create_monitor();
        let flag = Arc::new(AtomicBool::new(false));
        let core = SocketCore::new(1, SocketType::Request, SocketOptions::default(), sink, flag.clone());
        (core, monitor, flag)
    }

    #[test]
    fn test_requeue_keeps_sends_in_order() {
        let (mut core, _monitor, _flag) = core();
        core.deferred.push_back(DeferredOp::Send(OutboundRequest {
            correlation_id: "a".into(),
            body: Bytes::from_static(b"1"),
        }));
        core.deferred.push_back(DeferredOp::Connect("q2".into()));
        core.deferred.push_back(DeferredOp::Send(OutboundRequest {
            correlation_id: "b".into(),
            body: Bytes::from_static(b"2"),
        }));

        core.requeue_connects(&["q1".to_string(), "q2".to_string()]);

        let order: Vec<String> = core
            .deferred
            .iter()
            .map(|op| match op {
                DeferredOp::Connect(q) => format!("connect {q}"),
                DeferredOp::Send(r) => format!("send {}", r.correlation_id),
            })
            .collect();
        assert_eq!(order, vec!["connect q1", "connect q2", "send a", "send b"]);
    }

    #[test]
    fn test_not_ready_only_reported_once() {
        let (mut core, monitor, flag) = core();
        core.mark_not_ready();
        assert!(monitor.try_recv().is_err());

        core.readiness = Readiness::Establishing;
        core.mark_ready();
        assert!(flag.load(Ordering::Acquire));
        core.mark_not_ready();
        core.mark_not_ready();

        let events: Vec<_> = monitor.try_iter().collect();
        assert_eq!(events, vec![SocketEvent::Ready, SocketEvent::NotReady]);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_unbound_channel_is_channel_error() {
        let (core, _monitor, _flag) = core();
        assert!(matches!(core.channel(), Err(WarrenError::Channel(_))));
    }
}
