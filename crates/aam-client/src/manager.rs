use crate::config::ClientConfig;
use crate::error::ConnectionError;
use crate::machine::{
    Action, ConnectionMachine, ConnectionState, ConnectionStatus, OutboundMessage, SocketId,
    TimerKind,
};
use crate::socket::{spawn_mock, spawn_ws, SocketCommand, SocketEvents, SocketSender};
use aam_core::envelope::LoggedFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::warn;

const FRAME_CHANNEL_CAPACITY: usize = 256;

struct Core {
    machine: ConnectionMachine,
    sockets: HashMap<SocketId, SocketSender>,
    timer: Option<JoinHandle<()>>,
    /// Bumped per scheduled timer; a timer task that lost a race with
    /// `abort` sees a newer generation and does nothing.
    timer_generation: u64,
}

struct Shared {
    config: ClientConfig,
    runtime: Handle,
    core: Mutex<Core>,
    frames: broadcast::Sender<LoggedFrame>,
    status: watch::Sender<ConnectionStatus>,
}

/// Owns one logical connection to `config.url` and keeps it alive.
///
/// Cloning is cheap; all clones drive the same connection. Every operation
/// returns immediately and reports failure through [`state`](Self::state)
/// and [`last_error`](Self::last_error) rather than a `Result`.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// Socket callbacks route back here. Weak so that socket tasks outliving
/// every manager handle do not keep it alive.
struct Callbacks {
    shared: Weak<Shared>,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime; socket and timer tasks are
    /// spawned onto it.
    pub fn new(config: ClientConfig) -> Result<Self, ConnectionError> {
        let runtime = Handle::try_current()
            .map_err(|err| ConnectionError::Transport(format!("no tokio runtime: {err}")))?;
        let machine = ConnectionMachine::new(&config);
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(machine.status());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                core: Mutex::new(Core {
                    machine,
                    sockets: HashMap::new(),
                    timer: None,
                    timer_generation: 0,
                }),
                frames,
                status,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn connect(&self) {
        self.shared.dispatch(|core| core.machine.connect());
    }

    pub fn disconnect(&self) {
        self.shared.dispatch(|core| core.machine.disconnect());
    }

    pub fn reconnect(&self) {
        self.shared.dispatch(|core| core.machine.reconnect());
    }

    pub fn send(&self, message: impl Into<OutboundMessage>) {
        let message = message.into();
        self.shared.dispatch(move |core| core.machine.send(message));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().machine.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().machine.status()
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.lock().machine.last_error().cloned()
    }

    pub fn attempts(&self) -> u32 {
        self.shared.lock().machine.attempts()
    }

    /// Snapshot of the event log, oldest first.
    pub fn events(&self) -> Vec<LoggedFrame> {
        self.shared.lock().machine.events()
    }

    pub fn clear_events(&self) {
        self.shared.lock().machine.clear_events();
    }

    /// Frames accepted from now on. A receiver that falls more than the
    /// channel capacity behind sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<LoggedFrame> {
        self.shared.frames.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch<F>(self: &Arc<Self>, step: F)
    where
        F: FnOnce(&mut Core) -> Vec<Action>,
    {
        let mut core = self.lock();
        let actions = step(&mut core);
        for action in actions {
            self.execute(&mut core, action);
        }
        // Published under the core lock so the watch value follows the
        // same order as the state changes.
        let status = core.machine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn execute(self: &Arc<Self>, core: &mut Core, action: Action) {
        match action {
            Action::Open { socket } => {
                let events: Arc<dyn SocketEvents> = Arc::new(Callbacks {
                    shared: Arc::downgrade(self),
                });
                let sender = match &self.config.mock {
                    Some(mock) => spawn_mock(&self.runtime, mock.clone(), socket, events),
                    None => spawn_ws(&self.runtime, self.config.url.clone(), socket, events),
                };
                core.sockets.insert(socket, sender);
            }
            Action::Close { socket } => {
                if let Some(sender) = core.sockets.remove(&socket) {
                    let _ = sender.send(SocketCommand::Close);
                }
            }
            Action::Transmit { socket, text } => {
                let delivered = core
                    .sockets
                    .get(&socket)
                    .map(|sender| sender.send(SocketCommand::Send(text)).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    warn!(event = "send_dropped", socket, reason = "socket task gone");
                }
            }
            Action::ScheduleTimer { kind, delay } => {
                if let Some(previous) = core.timer.take() {
                    previous.abort();
                }
                core.timer_generation += 1;
                let generation = core.timer_generation;
                let shared = Arc::downgrade(self);
                core.timer = Some(self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = shared.upgrade() {
                        shared.fire_timer(kind, generation);
                    }
                }));
            }
            Action::CancelTimer => {
                core.timer_generation += 1;
                if let Some(timer) = core.timer.take() {
                    timer.abort();
                }
            }
            Action::Deliver(frame) => {
                // No receivers is not an error; the log still holds the frame.
                let _ = self.frames.send(frame);
            }
        }
    }

    fn fire_timer(self: &Arc<Self>, kind: TimerKind, generation: u64) {
        self.dispatch(|core| {
            if core.timer_generation != generation {
                return Vec::new();
            }
            core.timer = None;
            core.machine.on_timer(kind)
        });
    }
}

impl SocketEvents for Callbacks {
    fn opened(&self, socket: SocketId) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(|core| core.machine.on_open(socket));
        }
    }

    fn message(&self, socket: SocketId, text: String) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(|core| core.machine.on_message(socket, &text));
        }
    }

    fn failed(&self, socket: SocketId, error: ConnectionError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(|core| core.machine.on_error(socket, error));
        }
    }

    fn closed(&self, socket: SocketId, reason: Option<String>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(|core| {
                core.sockets.remove(&socket);
                core.machine.on_close(socket, reason.as_deref())
            });
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for (_, sender) in self.sockets.drain() {
            let _ = sender.send(SocketCommand::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use aam_core::backoff::BackoffPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn mock_config(frames: Vec<String>) -> ClientConfig {
        ClientConfig {
            mock: Some(MockConfig {
                frames,
                interval: Duration::from_millis(10),
                repeat: false,
            }),
            ..ClientConfig::default()
        }
    }

    async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
        let mut status = manager.watch_status();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status.borrow_and_update().state == want {
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("state reached");
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        assert!(matches!(
            ConnectionManager::new(ClientConfig::default()),
            Err(ConnectionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn mock_mode_delivers_frames_to_subscribers_and_log() {
        let frames = vec![
            json!({"type": "heartbeat", "payload": {"n": 1}}).to_string(),
            json!({"type": "bogus", "payload": {}}).to_string(),
            "plain text".to_string(),
        ];
        let manager = ConnectionManager::new(mock_config(frames)).expect("manager");
        let mut rx = manager.subscribe();
        manager.connect();
        wait_for_state(&manager, ConnectionState::Connected).await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first frame")
            .expect("recv");
        assert_eq!(first.envelope.kind, "heartbeat");
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("second frame")
            .expect("recv");
        assert_eq!(second.envelope.kind, "raw");

        assert_eq!(manager.events().len(), 2);
        manager.clear_events();
        assert!(manager.events().is_empty());
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_schedules_reconnect_and_hits_ceiling() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let config = ClientConfig {
            url: format!("ws://{addr}"),
            backoff: BackoffPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: Some(2),
                ..BackoffPolicy::default()
            },
            ..ClientConfig::default()
        };
        let manager = ConnectionManager::new(config).expect("manager");
        let mut status = manager.watch_status();
        manager.connect();

        let terminal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(err) = status.borrow_and_update().last_error.clone() {
                    if err.is_terminal() {
                        return err;
                    }
                }
                status.changed().await.expect("status sender alive");
            }
        })
        .await
        .expect("terminal error");
        assert_eq!(terminal, ConnectionError::MaxAttemptsReached { attempts: 2 });
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn published_status_matches_state_after_racing_calls() {
        let manager = ConnectionManager::new(mock_config(Vec::new())).expect("manager");
        let status = manager.watch_status();
        for _ in 0..200 {
            let opener = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect() })
            };
            let closer = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.disconnect() })
            };
            opener.await.expect("connect task");
            closer.await.expect("disconnect task");
            // A late open from the socket task may still land; once it has,
            // the published value must agree with the machine.
            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    let published = status.borrow().clone();
                    if published == manager.status() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("published status caught up");
        }
        manager.disconnect();
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let manager = ConnectionManager::new(mock_config(Vec::new())).expect("manager");
        manager.send(json!({"type": "ping"}));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.last_error().is_none());
    }

    #[tokio::test]
    async fn reconnect_restarts_a_fresh_session() {
        let frames = vec![json!({"type": "heartbeat", "payload": {}}).to_string()];
        let manager = ConnectionManager::new(mock_config(frames)).expect("manager");
        let mut rx = manager.subscribe();
        manager.connect();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame")
            .expect("recv");
        assert_eq!(manager.events().len(), 1);

        manager.reconnect();
        assert!(manager.events().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        wait_for_state(&manager, ConnectionState::Connected).await;
        manager.disconnect();
    }
}
