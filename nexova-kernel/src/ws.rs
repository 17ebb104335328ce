/**
 * WEBSOCKET - Transport full-duplex des abonnés du Broadcast Hub
 *
 * Une connexion = un abonné. Les frames sortantes passent par une file bornée
 * (file pleine = échec d'envoi isolé, jamais bloquant). Côté entrant, seuls les
 * Pong (acquittement de vivacité) et Close sont pris en compte.
 */

use crate::http::AppState;
use crate::hub::{BroadcastHub, HubError, SubscriberSink};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub struct WsSubscriber {
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl WsSubscriber {
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self { outbound, closed: AtomicBool::new(false) }
    }

    fn push(&self, message: Message) -> Result<(), HubError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => HubError::Full,
            TrySendError::Closed(_) => HubError::Closed,
        })
    }
}

impl SubscriberSink for WsSubscriber {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.outbound.is_closed()
    }

    fn send(&self, _kind: &str, frame: &str) -> Result<(), HubError> {
        self.push(Message::Text(frame.into()))
    }

    fn ping(&self) -> Result<(), HubError> {
        self.push(Message::Ping(Bytes::new()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.outbound.try_send(Message::Close(None));
        }
    }

    fn label(&self) -> String {
        "websocket".to_string()
    }
}

// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    let hub = app.hub.clone();
    let buffer = app.outbound_buffer;
    ws.on_upgrade(move |socket| serve_socket(socket, hub, buffer))
}

async fn serve_socket(socket: WebSocket, hub: Arc<BroadcastHub>, buffer: usize) {
    let (mut writer, mut reader) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(buffer.max(1));
    let id = hub.join(Arc::new(WsSubscriber::new(tx)));

    let mut write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if writer.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Pong(_))) => hub.acknowledge(id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "websocket read error");
                    break;
                }
            },
            _ = &mut write_task => break,
        }
    }

    hub.leave(id);
    write_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_is_a_send_failure() {
        let (tx, mut rx) = mpsc::channel(1);
        let sub = WsSubscriber::new(tx);

        assert!(sub.send("telemetry_batch", "{}").is_ok());
        assert!(matches!(sub.send("telemetry_batch", "{}"), Err(HubError::Full)));
        assert!(rx.recv().await.is_some());
        assert!(sub.ping().is_ok());
    }

    #[tokio::test]
    async fn test_close_marks_transport_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let sub = WsSubscriber::new(tx);
        assert!(sub.is_open());

        sub.close();
        sub.close();
        assert!(!sub.is_open());
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_closed() {
        let (tx, rx) = mpsc::channel(4);
        let sub = WsSubscriber::new(tx);
        drop(rx);
        assert!(!sub.is_open());
        assert!(matches!(sub.send("x", "{}"), Err(HubError::Closed)));
    }

    mod over_the_wire {
        use super::*;
        use crate::health::HealthTracker;
        use crate::http::{build_router, AppState};
        use crate::hub::{HeartbeatReport, SubscriberId, ENVELOPE_CONNECTED};
        use crate::profiles::ProfileTable;
        use crate::store::JsonStore;
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::Message as ClientMessage;

        async fn serve(hub: Arc<BroadcastHub>) -> String {
            let state = AppState {
                store: Arc::new(JsonStore::in_memory(10, &[])),
                hub,
                health: HealthTracker::new(),
                profiles: Arc::new(ProfileTable::builtin()),
                outbound_buffer: 8,
            };
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, build_router(state)).await.unwrap();
            });
            format!("ws://{addr}/ws")
        }

        async fn eventually(hub: &BroadcastHub, check: impl Fn(&BroadcastHub) -> bool) -> bool {
            for _ in 0..100 {
                if check(hub) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }

        #[tokio::test]
        async fn test_pong_keeps_socket_alive_and_close_leaves() {
            let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
            let url = serve(hub.clone()).await;
            let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            let (mut client_tx, mut client_rx) = client.split();

            let welcome = client_rx.next().await.unwrap().unwrap();
            let envelope: serde_json::Value = serde_json::from_str(welcome.to_text().unwrap()).unwrap();
            assert_eq!(envelope["type"], ENVELOPE_CONNECTED);
            let id: SubscriberId = serde_json::from_value(envelope["payload"]["subscriberId"].clone()).unwrap();
            assert!(hub.contains(id));

            // lire le flux fait partir les Pong automatiques du client
            let (frames_tx, mut frames) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(Ok(message)) = client_rx.next().await {
                    if frames_tx.send(message).is_err() {
                        break;
                    }
                }
            });

            assert_eq!(hub.heartbeat_round(), HeartbeatReport { pinged: 1, dropped: 0 });
            assert!(matches!(frames.recv().await, Some(ClientMessage::Ping(_))));
            assert!(eventually(&hub, |hub| hub.is_alive(id)).await);

            assert_eq!(hub.heartbeat_round(), HeartbeatReport { pinged: 1, dropped: 0 });
            assert!(hub.contains(id));

            client_tx.send(ClientMessage::Close(None)).await.unwrap();
            assert!(eventually(&hub, |hub| hub.len() == 0).await);
        }

        #[tokio::test]
        async fn test_dropped_connection_leaves() {
            let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
            let url = serve(hub.clone()).await;
            let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            assert!(eventually(&hub, |hub| hub.len() == 1).await);

            drop(client);
            assert!(eventually(&hub, |hub| hub.len() == 0).await);
        }
    }
}
