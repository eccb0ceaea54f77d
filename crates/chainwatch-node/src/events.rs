//! ZeroMQ fan-out of tracker events.
//!
//! Downstream consumers subscribe to the `block` and `transaction` topics
//! on the bound PUB socket. Delivery is at-most-once: a consumer that is
//! not connected (or too slow) misses messages, and reconciles through
//! the operator RPC if it cares.

use chainwatch_tracker::TrackerEvent;
use tokio::sync::broadcast;

/// Spawns the bridge from the tracker's broadcast channel to a ZeroMQ PUB
/// socket bound at `endpoint`.
pub fn spawn_publisher(endpoint: String, mut events: broadcast::Receiver<TrackerEvent>) {
    let (frames_tx, frames_rx) = std::sync::mpsc::channel::<(&'static str, String)>();

    // Serialization happens on the async side; the socket lives on its
    // own thread since ZeroMQ sockets are not async-aware.
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TrackerEvent::Block(header)) => {
                    let Ok(json) = serde_json::to_string(&header) else {
                        continue;
                    };
                    if frames_tx.send(("block", json)).is_err() {
                        break;
                    }
                }
                Ok(TrackerEvent::Transaction(details)) => {
                    let Ok(json) = serde_json::to_string(&details) else {
                        continue;
                    };
                    if frames_tx.send(("transaction", json)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event publisher lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    std::thread::Builder::new()
        .name("zmq-publisher".into())
        .spawn(move || {
            let ctx = zmq::Context::new();
            let socket = match ctx.socket(zmq::PUB) {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::error!("Failed to create event publisher socket: {err}");
                    return;
                }
            };
            if let Err(err) = socket.bind(&endpoint) {
                tracing::error!(endpoint, "Failed to bind event publisher: {err}");
                return;
            }
            tracing::info!(endpoint, "Publishing tracker events");

            while let Ok((topic, json)) = frames_rx.recv() {
                if let Err(err) = socket.send_multipart([topic.as_bytes(), json.as_bytes()], 0) {
                    tracing::warn!("Failed to publish event: {err}");
                }
            }
        })
        .expect("Failed to spawn event publisher thread");
}
