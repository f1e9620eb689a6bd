//! Deadline timer for the driver loop.
//!
//! The deadline is kept by a helper thread that sleeps until it passes and
//! then signals the driver over a flume channel, so the driver wakes on time
//! no matter which compio timers the application has pending.

use std::thread;
use std::time::Instant;
use tracing::trace;
use warren_core::error::{Result, WarrenError};

pub(crate) struct DeadlineTimer {
    arm: flume::Sender<Option<Instant>>,
    fired: flume::Receiver<()>,
    /// Deadline the thread is currently waiting for
    armed: Option<Instant>,
}

impl DeadlineTimer {
    pub(crate) fn spawn(name: String) -> Result<Self> {
        let (arm, arm_rx) = flume::unbounded();
        let (fired_tx, fired) = flume::bounded(1);
        thread::Builder::new()
            .name(name)
            .spawn(move || timer_thread(&arm_rx, &fired_tx))
            .map_err(|e| WarrenError::connection(format!("failed to start timer thread: {e}")))?;
        Ok(Self {
            arm,
            fired,
            armed: None,
        })
    }

    /// Wait for `deadline`, replacing any earlier one. `None` disarms.
    pub(crate) fn set(&mut self, deadline: Option<Instant>) {
        if self.armed == deadline {
            return;
        }
        self.armed = deadline;
        // Thread only exits once this sender is gone
        let _ = self.arm.send(deadline);
    }

    /// Resolves when the armed deadline passes. Must be followed by `reset`.
    pub(crate) async fn fired(&self) {
        if self.fired.recv_async().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }

    /// Forget the armed deadline after a wake, so the next `set` re-arms.
    pub(crate) fn reset(&mut self) {
        self.armed = None;
    }
}

fn timer_thread(arm: &flume::Receiver<Option<Instant>>, fired: &flume::Sender<()>) {
    let mut deadline: Option<Instant> = None;
    loop {
        let next = match deadline {
            None => arm.recv().map_err(|_| ()),
            Some(at) => match arm.recv_deadline(at) {
                Ok(next) => Ok(next),
                Err(flume::RecvTimeoutError::Timeout) => {
                    deadline = None;
                    // Full means a wake is already queued
                    let _ = fired.try_send(());
                    continue;
                }
                Err(flume::RecvTimeoutError::Disconnected) => Err(()),
            },
        };
        match next {
            Ok(next) => deadline = next,
            Err(()) => break,
        }
    }
    trace!("[MANAGER] timer thread stopped");
}
