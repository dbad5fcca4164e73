use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::AppState;

/// Frame pushed to the waiting page.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Text { html: String },
}

struct Subscriber {
    connection_id: u64,
    tx: mpsc::UnboundedSender<LiveMessage>,
}

/// Push channel from running jobs to the operator's browser tab.
///
/// Keyed by the live-session id embedded in the waiting page. A session has at
/// most one subscriber; a newer connection replaces the older one. Messages
/// published while nobody is connected are dropped.
#[derive(Clone, Default)]
pub struct LiveChannel {
    subscribers: Arc<DashMap<String, Subscriber>>,
    next_connection: Arc<AtomicU64>,
}

pub struct Subscription {
    pub connection_id: u64,
    pub rx: mpsc::UnboundedReceiver<LiveMessage>,
}

impl LiveChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        if self
            .subscribers
            .insert(session_id.to_string(), Subscriber { connection_id, tx })
            .is_some()
        {
            debug!(session = %session_id, "replaced live channel subscriber");
        }
        Subscription { connection_id, rx }
    }

    /// Remove the subscriber, unless another connection already replaced it.
    pub fn unsubscribe(&self, session_id: &str, connection_id: u64) {
        self.subscribers
            .remove_if(session_id, |_, sub| sub.connection_id == connection_id);
    }

    /// Returns whether a connected subscriber accepted the message.
    pub fn publish(&self, session_id: &str, html: impl Into<String>) -> bool {
        let Some(subscriber) = self.subscribers.get(session_id) else {
            debug!(session = %session_id, "no live subscriber; message dropped");
            return false;
        };
        subscriber
            .tx
            .send(LiveMessage::Text { html: html.into() })
            .is_ok()
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.subscribers.contains_key(session_id)
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let channel = state.channel.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, channel))
}

async fn handle_socket(socket: WebSocket, session_id: String, channel: LiveChannel) {
    let Subscription {
        connection_id,
        mut rx,
    } = channel.subscribe(&session_id);
    let (mut sender, mut receiver) = socket.split();

    debug!(session = %session_id, connection_id, "live channel connected");

    let writer_session = session_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(session = %writer_session, "failed to encode live message: {}", e),
            }
        }
    });

    // Inbound frames carry nothing; read only to notice the close.
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    channel.unsubscribe(&session_id, connection_id);
    debug!(session = %session_id, connection_id, "live channel disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let channel = LiveChannel::new();
        assert!(!channel.publish("s1", "hello"));
    }

    #[tokio::test]
    async fn subscriber_receives_published_text() {
        let channel = LiveChannel::new();
        let mut sub = channel.subscribe("s1");
        assert!(channel.publish("s1", "hello"));
        assert_eq!(
            sub.rx.recv().await,
            Some(LiveMessage::Text {
                html: "hello".into()
            })
        );
    }

    #[tokio::test]
    async fn sessions_do_not_cross_deliver() {
        let channel = LiveChannel::new();
        let mut a = channel.subscribe("a");
        let mut b = channel.subscribe("b");
        channel.publish("a", "for a");
        assert!(b.rx.try_recv().is_err());
        assert!(a.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn newer_connection_replaces_older() {
        let channel = LiveChannel::new();
        let mut old = channel.subscribe("s1");
        let mut new = channel.subscribe("s1");
        assert!(channel.publish("s1", "latest"));
        assert!(new.rx.try_recv().is_ok());
        // The old sender was dropped with the replaced entry.
        assert!(old.rx.recv().await.is_none());

        // The stale connection closing must not evict the current one.
        channel.unsubscribe("s1", old.connection_id);
        assert!(channel.is_connected("s1"));
        channel.unsubscribe("s1", new.connection_id);
        assert!(!channel.is_connected("s1"));
    }

    #[test]
    fn live_message_wire_format() {
        let json = serde_json::to_value(LiveMessage::Text {
            html: "<b>ok</b>".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "html": "<b>ok</b>"}));
    }
}
