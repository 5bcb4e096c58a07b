//! Outbound heartbeat stream to one manager.
//!
//! Keeps a WebSocket open to the peer's `/heartbeats/{token}` endpoint,
//! where the token identifies the *sender*, and emits an empty frame per
//! beat. Connection errors are logged and followed by a reconnect delay;
//! the stream itself never gives up.

use std::time::Duration;

use futures::SinkExt;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

const BEAT_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// A reconnecting beat emitter towards one manager address.
#[derive(Debug, Clone)]
pub struct Heart {
    manager_address: String,
    token: Uuid,
    beat_interval: Duration,
    reconnect_interval: Duration,
}

impl Heart {
    /// `manager_address` is `host:port` of the receiving manager.
    pub fn new(manager_address: impl Into<String>, token: Uuid) -> Self {
        Self {
            manager_address: manager_address.into(),
            token,
            beat_interval: BEAT_INTERVAL,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, beat: Duration, reconnect: Duration) -> Self {
        self.beat_interval = beat;
        self.reconnect_interval = reconnect;
        self
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/heartbeats/{}", self.manager_address, self.token)
    }

    fn label(&self) -> String {
        format!("heart#{}", self.token)
    }

    /// Beat until `predicate` turns false, then exit cleanly. The predicate
    /// is polled once per beat and once per reconnect attempt.
    pub async fn beat_until<P: Fn() -> bool>(&self, predicate: P) {
        let url = self.ws_url();
        while predicate() {
            match connect_async(&url).await {
                Ok((mut socket, _)) => {
                    info!("{} connection established to {}", self.label(), self.manager_address);
                    loop {
                        if !predicate() {
                            let _ = socket.close(None).await;
                            debug!("{} retired", self.label());
                            return;
                        }
                        tokio::time::sleep(self.beat_interval).await;
                        if let Err(error) = socket.send(Message::Text("".into())).await {
                            warn!("{} connection closed: {}", self.label(), error);
                            break;
                        }
                    }
                }
                Err(error) => {
                    warn!("{} connection refused by {}: {}", self.label(), self.manager_address, error);
                }
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
        debug!("{} retired", self.label());
    }

    /// Beat for the lifetime of the process.
    pub async fn beat_forever(&self) {
        self.beat_until(|| true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_the_senders_token() {
        let token = Uuid::new_v4();
        let heart = Heart::new("192.168.1.20:8000", token);
        assert_eq!(
            heart.ws_url(),
            format!("ws://192.168.1.20:8000/heartbeats/{token}")
        );
    }

    #[tokio::test]
    async fn beat_until_exits_when_predicate_is_false() {
        let heart = Heart::new("127.0.0.1:1", Uuid::new_v4())
            .with_intervals(Duration::from_millis(1), Duration::from_millis(1));
        // No server is listening; the loop must still exit promptly.
        tokio::time::timeout(Duration::from_secs(1), heart.beat_until(|| false))
            .await
            .expect("beat_until did not exit");
    }
}
