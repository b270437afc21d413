use crate::config::MockConfig;
use crate::error::ConnectionError;
use crate::machine::SocketId;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(String),
    Close,
}

/// Callbacks from a socket task. Every call carries the socket id it was
/// spawned with so the receiver can discard callbacks from old sockets.
pub trait SocketEvents: Send + Sync + 'static {
    fn opened(&self, socket: SocketId);
    fn message(&self, socket: SocketId, text: String);
    fn failed(&self, socket: SocketId, error: ConnectionError);
    fn closed(&self, socket: SocketId, reason: Option<String>);
}

pub type SocketSender = mpsc::UnboundedSender<SocketCommand>;

/// Checks that `raw` is a `ws://` or `wss://` URL.
pub fn parse_ws_url(raw: &str) -> Result<Url, ConnectionError> {
    let url = Url::parse(raw).map_err(|err| ConnectionError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConnectionError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

pub fn spawn_ws(
    runtime: &Handle,
    url: String,
    socket: SocketId,
    events: Arc<dyn SocketEvents>,
) -> SocketSender {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(async move {
        let reason = run_ws(&url, socket, events.as_ref(), rx).await;
        events.closed(socket, reason);
    });
    tx
}

async fn run_ws(
    url: &str,
    socket: SocketId,
    events: &dyn SocketEvents,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) -> Option<String> {
    let url = match parse_ws_url(url) {
        Ok(url) => url,
        Err(err) => {
            events.failed(socket, err);
            return Some("invalid url".to_string());
        }
    };
    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(value) => value,
        Err(err) => {
            events.failed(socket, ConnectionError::Transport(err.to_string()));
            return Some("connect failed".to_string());
        }
    };
    info!(event = "socket_open", socket, url = %url);
    events.opened(socket);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.message(socket, text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => events.message(socket, text),
                    Err(_) => debug!(event = "socket_binary_dropped", socket),
                },
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|frame| frame.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    events.failed(socket, ConnectionError::Transport(err.to_string()));
                    return Some("transport error".to_string());
                }
                None => return None,
            },
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        events.failed(socket, ConnectionError::Transport(err.to_string()));
                        return Some("send failed".to_string());
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let _ = sink.close().await;
                    return Some("closed by client".to_string());
                }
            },
        }
    }
}

/// Replays `mock.frames` as if a server had sent them. Outbound frames are
/// accepted and discarded.
pub fn spawn_mock(
    runtime: &Handle,
    mock: MockConfig,
    socket: SocketId,
    events: Arc<dyn SocketEvents>,
) -> SocketSender {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(async move {
        let reason = run_mock(mock, socket, events.as_ref(), rx).await;
        events.closed(socket, reason);
    });
    tx
}

async fn run_mock(
    mock: MockConfig,
    socket: SocketId,
    events: &dyn SocketEvents,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) -> Option<String> {
    info!(event = "mock_open", socket, frames = mock.frames.len());
    events.opened(socket);

    let mut next = 0usize;
    let mut ticker = tokio::time::interval(mock.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let exhausted = next >= mock.frames.len() && !mock.repeat;
        tokio::select! {
            _ = ticker.tick(), if !exhausted && !mock.frames.is_empty() => {
                if next >= mock.frames.len() {
                    next = 0;
                }
                events.message(socket, mock.frames[next].clone());
                next += 1;
            }
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    debug!(event = "mock_send_discarded", socket, size = text.len());
                }
                Some(SocketCommand::Close) | None => return Some("closed by client".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }
    }

    impl SocketEvents for Recorder {
        fn opened(&self, socket: SocketId) {
            self.push(format!("open:{socket}"));
        }
        fn message(&self, socket: SocketId, text: String) {
            self.push(format!("message:{socket}:{text}"));
        }
        fn failed(&self, socket: SocketId, error: ConnectionError) {
            self.push(format!("failed:{socket}:{error}"));
        }
        fn closed(&self, socket: SocketId, _reason: Option<String>) {
            self.push(format!("closed:{socket}"));
        }
    }

    #[test]
    fn parse_ws_url_requires_websocket_scheme() {
        assert!(parse_ws_url("ws://127.0.0.1:18789").is_ok());
        assert!(parse_ws_url("wss://gateway.example/ws").is_ok());
        assert!(matches!(
            parse_ws_url("http://127.0.0.1:18789"),
            Err(ConnectionError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_ws_url("not a url"),
            Err(ConnectionError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_url_reports_failure_then_close() {
        let recorder = Arc::new(Recorder::default());
        let _tx = spawn_ws(
            &Handle::current(),
            "http://nope".to_string(),
            7,
            recorder.clone(),
        );
        for _ in 0..50 {
            if recorder.calls().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = recorder.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("failed:7:invalid url"));
        assert_eq!(calls[1], "closed:7");
    }

    #[tokio::test(start_paused = true)]
    async fn mock_replays_frames_in_order_then_idles() {
        let recorder = Arc::new(Recorder::default());
        let mock = MockConfig {
            frames: vec!["one".to_string(), "two".to_string()],
            interval: Duration::from_millis(50),
            repeat: false,
        };
        let tx = spawn_mock(&Handle::current(), mock, 3, recorder.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            recorder.calls(),
            vec!["open:3", "message:3:one", "message:3:two"]
        );

        tx.send(SocketCommand::Send("ignored".to_string()))
            .expect("send");
        tx.send(SocketCommand::Close).expect("close");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.calls().last().map(String::as_str), Some("closed:3"));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_repeat_wraps_around() {
        let recorder = Arc::new(Recorder::default());
        let mock = MockConfig {
            frames: vec!["a".to_string(), "b".to_string()],
            interval: Duration::from_millis(100),
            repeat: true,
        };
        let tx = spawn_mock(&Handle::current(), mock, 1, recorder.clone());
        tokio::time::sleep(Duration::from_millis(350)).await;
        drop(tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let messages: Vec<_> = recorder
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("message"))
            .collect();
        assert_eq!(
            messages,
            vec!["message:1:a", "message:1:b", "message:1:a", "message:1:b"]
        );
    }
}
