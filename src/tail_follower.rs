//! WebSocket `eth_subscribe("newHeads")` tail-follower that feeds the
//! Height Oracle's `set_chain_head` (spec.md §4.2, §6 "Upstream" split).
//!
//! Grounded on the teacher's `BlockListener` in `listener.rs`: same
//! connect/subscribe/reconnect shape over `tokio-tungstenite`, rewired to
//! push into the Height Oracle instead of `Storage::upsert_block`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::error::{IndexerError, Result};
use crate::height_oracle::HeightOracle;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct SubscribeRequest {
    jsonrpc: &'static str,
    method: &'static str,
    params: (String,),
    id: u64,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEvent {
    params: Option<SubscriptionParams>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    result: serde_json::Value,
}

/// Published to any in-process subscriber (tests, or a future UI layer) on
/// every new head observed, independent of the Height Oracle's own atomic
/// state (SPEC_FULL.md §4 AMBIENT clarification).
#[derive(Debug, Clone, Copy)]
pub struct NewHead {
    pub number: u64,
}

pub struct TailFollower {
    ws_url: String,
    height_oracle: Arc<HeightOracle>,
    head_tx: broadcast::Sender<NewHead>,
    cmd_tx: mpsc::Sender<Command>,
}

impl TailFollower {
    pub fn new(ws_url: impl Into<String>, height_oracle: Arc<HeightOracle>, cmd_tx: mpsc::Sender<Command>) -> Self {
        let (head_tx, _) = broadcast::channel(64);
        Self { ws_url: ws_url.into(), height_oracle, head_tx, cmd_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewHead> {
        self.head_tx.subscribe()
    }

    /// Reconnects indefinitely until `shutdown` fires; a dropped connection
    /// is not fatal to the pipeline, only to head-tracking freshness, which
    /// the Fetcher's own range jobs and the Self-Healer's upstream check
    /// tolerate.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.listen_once(&mut shutdown).await {
                Ok(()) => info!("tail follower connection closed cleanly"),
                Err(e) => warn!(error = %e, "tail follower connection failed, reconnecting"),
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            }
        }
    }

    async fn listen_once(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await.map_err(IndexerError::WebSocket)?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeRequest { jsonrpc: "2.0", method: "eth_subscribe", params: ("newHeads".to_string(),), id: 1 };
        write.send(Message::Text(serde_json::to_string(&subscribe)?)).await.map_err(IndexerError::WebSocket)?;
        info!(url = %self.ws_url, "tail follower subscribed to newHeads");

        loop {
            let msg = tokio::select! {
                m = read.next() => m,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return Ok(()); }
                    continue;
                }
            };

            match msg {
                Some(Ok(Message::Text(text))) => self.handle_message(&text),
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await.map_err(IndexerError::WebSocket)?;
                }
                Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(IndexerError::WebSocket(e)),
                None => return Ok(()),
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let Ok(event) = serde_json::from_str::<SubscriptionEvent>(text) else {
            debug!(text, "tail follower received unparseable frame");
            return;
        };
        let Some(params) = event.params else { return };
        let Some(number) = params
            .result
            .get("number")
            .and_then(|n| n.as_str())
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        else {
            return;
        };

        self.height_oracle.set_chain_head(number);
        // Non-blocking: a full command queue must never stall head-tracking
        // (spec.md §5 deadlock-avoidance rules).
        let _ = self.cmd_tx.try_send(Command::UpdateChainHeight(number));
        let _ = self.head_tx.send(NewHead { number });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_message_updates_height_oracle_on_valid_frame() {
        let oracle = Arc::new(HeightOracle::new(5, false));
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let follower = TailFollower::new("ws://example.invalid", Arc::clone(&oracle), cmd_tx);
        let mut sub = follower.subscribe();

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0x1", "result": { "number": "0x64" } }
        })
        .to_string();

        follower.handle_message(&frame);
        assert_eq!(oracle.snapshot().chain_head, 100);
        assert_eq!(sub.try_recv().unwrap().number, 100);
        match cmd_rx.recv().await.unwrap() {
            Command::UpdateChainHeight(h) => assert_eq!(h, 100),
            other => panic!("expected UpdateChainHeight, got {other:?}"),
        }
    }

    #[test]
    fn handle_message_ignores_malformed_frame() {
        let oracle = Arc::new(HeightOracle::new(5, false));
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let follower = TailFollower::new("ws://example.invalid", Arc::clone(&oracle), cmd_tx);
        follower.handle_message("not json at all");
        assert_eq!(oracle.snapshot().chain_head, 0);
    }
}
