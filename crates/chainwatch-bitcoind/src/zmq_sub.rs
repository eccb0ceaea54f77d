//! ZeroMQ subscription bridge.
//!
//! ZeroMQ sockets are not async; each subscription runs on a dedicated
//! thread polling with a receive timeout and forwards decoded
//! notifications into a tokio channel. A failed socket is torn down and
//! reconnected after a fixed delay. The thread exits once the receiving
//! half of the channel is dropped.

use bitcoin::BlockHash;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

const RECV_TIMEOUT_MS: i32 = 1_000;
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Daemon publisher topics the tracker subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZmqTopic {
    /// New best-block hashes.
    HashBlock,
    /// Raw mempool transactions.
    RawTx,
}

impl ZmqTopic {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            ZmqTopic::HashBlock => b"hashblock",
            ZmqTopic::RawTx => b"rawtx",
        }
    }
}

/// A decoded notification from the daemon's publishers.
#[derive(Debug, Clone)]
pub enum ZmqNotification {
    BlockHash(BlockHash),
    RawTransaction(Vec<u8>),
}

/// Spawns a subscription to one topic on the given endpoint, returning the
/// channel the notifications arrive on.
pub fn subscribe(endpoint: String, topic: ZmqTopic) -> mpsc::UnboundedReceiver<ZmqNotification> {
    let (sender, receiver) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name(format!("zmq-{}", String::from_utf8_lossy(topic.as_bytes())))
        .spawn(move || loop {
            match run_socket(&endpoint, topic, &sender) {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(endpoint, "ZMQ subscription failed: {err}");
                }
            }
            if sender.is_closed() {
                break;
            }
            std::thread::sleep(RECONNECT_DELAY);
        })
        .expect("Failed to spawn ZMQ subscription thread");

    receiver
}

/// Runs a single socket session. Returns `Ok(())` on clean shutdown
/// (receiver dropped), `Err` on any socket failure, triggering a
/// reconnect in the caller.
fn run_socket(
    endpoint: &str,
    topic: ZmqTopic,
    sender: &mpsc::UnboundedSender<ZmqNotification>,
) -> Result<(), zmq::Error> {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::SUB)?;
    socket.set_subscribe(topic.as_bytes())?;
    socket.set_rcvtimeo(RECV_TIMEOUT_MS)?;
    socket.connect(endpoint)?;

    tracing::info!(endpoint, topic = ?topic, "Listening for daemon notifications");

    loop {
        let frames = match socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => {
                if sender.is_closed() {
                    return Ok(());
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        let Some(notification) = decode_frames(topic, &frames) else {
            tracing::debug!(frames = frames.len(), "Ignoring malformed ZMQ message");
            continue;
        };

        if sender.send(notification).is_err() {
            return Ok(());
        }
    }
}

/// Decodes a `[topic, payload, sequence]` multipart message.
fn decode_frames(topic: ZmqTopic, frames: &[Vec<u8>]) -> Option<ZmqNotification> {
    if frames.len() < 2 || frames[0] != topic.as_bytes() {
        return None;
    }
    let payload = &frames[1];

    match topic {
        ZmqTopic::HashBlock => {
            // The daemon publishes hashes in display byte order.
            let hash = BlockHash::from_str(&hex::encode(payload)).ok()?;
            Some(ZmqNotification::BlockHash(hash))
        }
        ZmqTopic::RawTx => Some(ZmqNotification::RawTransaction(payload.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hashblock_frames() {
        let hash: BlockHash =
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
                .parse()
                .unwrap();
        let frames = vec![
            b"hashblock".to_vec(),
            hex::decode("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
                .unwrap(),
            vec![0, 0, 0, 0],
        ];
        match decode_frames(ZmqTopic::HashBlock, &frames) {
            Some(ZmqNotification::BlockHash(decoded)) => assert_eq!(decoded, hash),
            other => panic!("Unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn rejects_foreign_topics() {
        let frames = vec![b"hashtx".to_vec(), vec![0u8; 32]];
        assert!(decode_frames(ZmqTopic::HashBlock, &frames).is_none());
    }
}
