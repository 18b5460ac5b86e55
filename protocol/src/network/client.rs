//! One-shot status query against a running node.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::matrix::{now_millis, MatrixSnapshot};
use crate::network::gossip::normalize_address;
use crate::network::message::{Handshake, Message};
use crate::network::node::{NodeError, NodeResult};

/// Connects to `address`, handshakes on `network_id`, sends `GET_STATUS` and
/// returns the snapshot from the first `STATUS_UPDATE`.
///
/// An `ERROR` reply (for example a network mismatch) becomes
/// [`NodeError::Remote`]. The whole exchange is bounded by `limit`.
pub async fn query_status(
    address: &str,
    network_id: &str,
    limit: Duration,
) -> NodeResult<MatrixSnapshot> {
    let url = normalize_address(address)
        .ok_or_else(|| NodeError::InvalidAddress(address.to_string()))?;

    tokio::time::timeout(limit, exchange(&url, network_id))
        .await
        .map_err(|_| NodeError::Timeout)?
}

async fn exchange(url: &str, network_id: &str) -> NodeResult<MatrixSnapshot> {
    let (ws, _response) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    let handshake = Message::Handshake(Handshake {
        node_id: format!("status-{}", uuid::Uuid::new_v4()),
        network_id: network_id.to_string(),
        address: None,
        timestamp: now_millis(),
    });
    sink.send(WsMessage::Text(handshake.encode()?.into())).await?;
    sink.send(WsMessage::Text(Message::GetStatus.encode()?.into()))
        .await?;

    while let Some(frame) = stream.next().await {
        let text = match frame? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match Message::decode(text.as_str())? {
            Message::StatusUpdate(snapshot) => {
                let _ = sink.close().await;
                return Ok(snapshot);
            }
            Message::Error(payload) => return Err(NodeError::Remote(payload.message)),
            other => debug!(kind = other.kind(), "ignoring message while waiting for status"),
        }
    }
    Err(NodeError::ConnectionClosed)
}
