use crate::config::{RelayConfig, MAX_FRAME_BYTES};
use aam_client::{ConnectionError, ConnectionManager, ConnectionState};
use aam_core::envelope::{self, Envelope};
use aam_core::AgentEvent;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 256;

struct Client {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1001,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

/// Relay state: browser-side clients and the upstream gateway connection.
///
/// Handlers receive it as `Arc<RelaySession>`; nothing lives in globals.
pub struct RelaySession {
    config: RelayConfig,
    started_at: Instant,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    upstream: ConnectionManager,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RelaySession {
    pub fn new(config: RelayConfig) -> Result<Arc<Self>, ConnectionError> {
        let upstream = ConnectionManager::new(config.gateway.clone())?;
        Ok(Arc::new(Self {
            config,
            started_at: Instant::now(),
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            upstream,
            forwarder: Mutex::new(None),
        }))
    }

    pub fn upstream(&self) -> &ConnectionManager {
        &self.upstream
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Connects upstream and relays every accepted upstream frame to all
    /// clients. Calling it again restarts forwarding.
    pub fn start(self: &Arc<Self>) {
        let mut frames = self.upstream.subscribe();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let frame = match frames.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "upstream_lagged", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if frame.envelope.is(envelope::RAW) {
                    debug!(event = "upstream_raw_skipped", seq = frame.seq);
                    continue;
                }
                let Some(session) = session.upgrade() else {
                    return;
                };
                session.broadcast(&frame.envelope.to_text()).await;
            }
        });
        if let Some(previous) = self.swap_forwarder(Some(task)) {
            previous.abort();
        }
        self.upstream.connect();
        info!(event = "relay_start", gateway = %self.config.gateway.url);
    }

    /// Disconnects upstream and closes every client.
    pub async fn stop(&self) {
        if let Some(task) = self.swap_forwarder(None) {
            task.abort();
        }
        self.upstream.disconnect();
        let clients: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close("relay_stopping").await;
        }
        info!(event = "relay_stop", clients = clients.len());
    }

    /// Sends `event` to every connected client and returns how many there
    /// were.
    pub async fn publish(&self, event: &AgentEvent) -> usize {
        let text = Envelope::agent_event(event).to_text();
        self.broadcast(&text).await
    }

    pub fn upstream_state(&self) -> ConnectionState {
        self.upstream.state()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn swap_forwarder(&self, next: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut slot = self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, next)
    }

    async fn broadcast(&self, text: &str) -> usize {
        let clients: Vec<_> = self.clients.read().await.values().cloned().collect();
        for client in &clients {
            if !client.send_text(text).await {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(client, "send_error").await;
            }
        }
        clients.len()
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id);
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        if self.clients.write().await.remove(&client.conn_id).is_none() {
            return;
        }
        client.close(reason).await;
        info!(event = "client_disconnected", conn_id = %client.conn_id, reason = reason);
    }

    fn start_ping(self: &Arc<Self>, client: Arc<Client>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        let session = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    session.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        }))
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !closing => {}
                    _ => return,
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            sender: tx,
        });
        self.register_client(client.clone()).await;
        let ping = self.start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(event = "message_invalid", conn_id = %client.conn_id, error = "binary frame is not utf-8");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if text.len() > MAX_FRAME_BYTES {
                warn!(event = "message_too_large", conn_id = %client.conn_id, size = text.len());
                continue;
            }
            if self.config.debug {
                debug!(event = "message_received", conn_id = %client.conn_id, raw = %text);
            }
            if let Err(err) = serde_json::from_str::<Value>(&text) {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                continue;
            }
            self.upstream.send(text);
        }

        if let Some(ping) = ping {
            ping.abort();
        }
        self.remove_client(&client, "disconnect").await;
        drop(client);
        let _ = write_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_client::{ClientConfig, MockConfig};

    fn config() -> RelayConfig {
        RelayConfig {
            gateway: ClientConfig {
                mock: Some(MockConfig {
                    frames: Vec::new(),
                    interval: Duration::from_millis(10),
                    repeat: false,
                }),
                ..ClientConfig::default()
            },
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn conn_ids_are_sequential() {
        let session = RelaySession::new(config()).expect("session");
        assert_eq!(session.next_conn_id(), "conn-1");
        assert_eq!(session.next_conn_id(), "conn-2");
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_clients_and_drops_dead_ones() {
        let session = RelaySession::new(config()).expect("session");
        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (dead_tx, dead_rx) = mpsc::channel(4);
        drop(dead_rx);
        session
            .register_client(Arc::new(Client {
                conn_id: "conn-live".to_string(),
                sender: live_tx,
            }))
            .await;
        session
            .register_client(Arc::new(Client {
                conn_id: "conn-dead".to_string(),
                sender: dead_tx,
            }))
            .await;

        assert_eq!(session.broadcast("hello").await, 2);
        match live_rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text, "hello"),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(session.client_count().await, 1);
    }

    #[tokio::test]
    async fn start_and_stop_drive_upstream() {
        let session = RelaySession::new(config()).expect("session");
        session.start();
        let mut status = session.upstream().watch_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.borrow_and_update().state != ConnectionState::Connected {
                status.changed().await.expect("status");
            }
        })
        .await
        .expect("connected");

        let (tx, mut rx) = mpsc::channel(4);
        session
            .register_client(Arc::new(Client {
                conn_id: "conn-x".to_string(),
                sender: tx,
            }))
            .await;
        session.stop().await;
        assert_eq!(session.upstream_state(), ConnectionState::Disconnected);
        assert_eq!(session.client_count().await, 0);
        assert!(matches!(rx.recv().await, Some(Message::Close(_))));
    }
}
