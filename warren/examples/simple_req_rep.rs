//! Simple REQ/REP round trip over the in-process broker
//!
//! Run this example:
//! ```bash
//! RUST_LOG=info cargo run --example simple_req_rep
//! ```

use serde_json::json;
use tracing::{error, info};
use warren::prelude::*;

#[compio::main]
async fn main() -> Result<()> {
    warren::dev_tracing::init_tracing();
    info!("=== Warren REQ ↔ REP Simple Test ===");

    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(
        MemoryTransport::new(broker.clone()),
        ConnectionOptions::default(),
    )?;

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("greetings")?;
    compio::runtime::spawn(async move {
        while let Some(request) = rep.recv().await {
            info!("[REP] Received request: {}", request.body());
            let name = request.body()["name"].as_str().map(str::to_owned);
            let result = match name {
                Some(name) => Ok(json!({ "greeting": format!("hello, {name}") })),
                None => Err("missing name"),
            };
            if let Err(e) = request.respond(result) {
                error!("[REP] Failed to reply: {}", e);
            }
        }
    })
    .detach();

    let req = manager.req_socket(SocketOptions::default());
    req.connect("greetings")?;

    info!("[REQ] Sending request");
    let reply = req.request(json!({ "name": "warren" })).await?;
    info!("[REQ] Received reply: {}", reply);

    info!("[REQ] Sending a request the handler rejects");
    match req.request(json!({})).await {
        Ok(reply) => info!("[REQ] Unexpected reply: {}", reply),
        Err(e) => info!("[REQ] Received error reply: {}", e),
    }

    manager.close().await;
    info!("Done");
    Ok(())
}
