//! Shared helpers for the REQ/REP integration tests.

#![allow(dead_code)]

use futures::future::Either;
use std::future::Future;
use std::time::Duration;
use warren_core::memory::{MemoryBroker, MemoryTransport};
use warren_core::monitor::{SocketEvent, SocketMonitor};
use warren_core::options::{BackoffOptions, ConnectionOptions};
use warren_rr::{ConnectionManager, RepSocket};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(3);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fires once `after` has elapsed, timed on a helper thread.
fn alarm(after: Duration) -> flume::Receiver<()> {
    let (tx, rx) = flume::bounded(1);
    std::thread::spawn(move || {
        std::thread::sleep(after);
        let _ = tx.send(());
    });
    rx
}

/// Suspend the current task for `after`.
pub async fn pause(after: Duration) {
    let _ = alarm(after).recv_async().await;
}

/// Run `fut` for at most `limit`; `None` if it did not finish.
pub async fn race<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    let expired = alarm(limit).into_recv_async();
    futures::pin_mut!(fut, expired);
    match futures::future::select(fut, expired).await {
        Either::Left((out, _)) => Some(out),
        Either::Right(_) => None,
    }
}

/// Fail the test instead of hanging.
pub async fn within<F: Future>(fut: F) -> F::Output {
    race(TEST_TIMEOUT, fut).await.expect("timed out")
}

/// Poll until `cond` holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            pause(Duration::from_millis(5)).await;
        }
    })
    .await;
}

pub fn fast_backoff() -> BackoffOptions {
    BackoffOptions::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(20))
}

pub fn manager_with(broker: &MemoryBroker, backoff: BackoffOptions) -> ConnectionManager {
    let options = ConnectionOptions::new().with_backoff(backoff);
    ConnectionManager::new(MemoryTransport::new(broker.clone()), options).unwrap()
}

pub fn manager(broker: &MemoryBroker) -> ConnectionManager {
    manager_with(broker, fast_backoff())
}

/// Wait for the next socket event matching `pred`.
pub async fn socket_event<F>(events: &SocketMonitor, mut pred: F) -> SocketEvent
where
    F: FnMut(&SocketEvent) -> bool,
{
    within(async {
        loop {
            let event = events.recv_async().await.expect("socket monitor closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
}

/// Answer every request with `{"echo": <body>}`.
pub fn spawn_echo(rep: RepSocket) {
    compio::runtime::spawn(async move {
        while let Some(request) = rep.recv().await {
            let body = request.body().clone();
            let _ = request.reply(serde_json::json!({ "echo": body }));
        }
    })
    .detach();
}
