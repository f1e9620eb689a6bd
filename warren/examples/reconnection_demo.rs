//! Transparent reconnection across broker faults.
//!
//! A REQ socket keeps sending while the in-process broker kills its channel
//! and then its connection. Requests issued during each outage are buffered
//! and delivered once the manager has reconnected.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=debug cargo run --example reconnection_demo
//! ```

use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use warren::prelude::*;

const REQUESTS: u32 = 6;

#[compio::main]
async fn main() -> Result<()> {
    warren::dev_tracing::init_tracing();

    let broker = MemoryBroker::new();
    let backoff = BackoffOptions::default()
        .with_retries(10)
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2));
    let options = ConnectionOptions::default().with_backoff(backoff);
    let manager = ConnectionManager::new(MemoryTransport::new(broker.clone()), options)?;

    let monitor = manager.monitor();
    compio::runtime::spawn(async move {
        while let Ok(event) = monitor.recv_async().await {
            match event {
                ManagerEvent::Disconnected { .. } | ManagerEvent::Error(_) => warn!("{}", event),
                _ => info!("{}", event),
            }
        }
    })
    .detach();

    let rep = manager.rep_socket(SocketOptions::default().with_prefetch(1));
    rep.connect("counter")?;
    compio::runtime::spawn(async move {
        while let Some(request) = rep.recv().await {
            let n = request.body().as_u64().unwrap_or_default();
            let _ = request.reply(json!(n * 2));
        }
    })
    .detach();

    let req = manager.req_socket(SocketOptions::default());
    req.connect("counter")?;

    for i in 0..REQUESTS {
        match i {
            2 => {
                info!("Injecting channel failure");
                broker.fail_channels("PRECONDITION_FAILED - simulated");
            }
            4 => {
                info!("Injecting connection loss");
                broker.drop_connections("ECONNRESET - simulated");
            }
            _ => {}
        }

        let reply = req.request(json!(i)).await?;
        info!("Request {} -> {} (state: {})", i, reply, manager.state());
        compio::time::sleep(Duration::from_millis(50)).await;
    }

    manager.close().await;
    info!("Done ({} requests)", REQUESTS);
    Ok(())
}
