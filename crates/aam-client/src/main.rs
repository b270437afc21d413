use aam_client::config::{
    resolve_bool, resolve_optional, resolve_parsed, resolve_string, DEFAULT_MOCK_INTERVAL,
    DEFAULT_URL,
};
use aam_client::{
    ActivitySnapshot, ActivityTracker, ClientConfig, ConnectionManager, ConnectionState,
    ConnectionStatus, MockConfig,
};
use aam_core::backoff::{BackoffPolicy, DEFAULT_DECAY, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use aam_core::event_log::{DEFAULT_FEED_WINDOW, DEFAULT_MAX_EVENTS};
use aam_core::{ActivityStore, AgentEvent};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Terminal,
};
use std::{io, path::Path, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AGENT_COLUMNS: [&str; 6] = ["AGENT", "STATUS", "MODEL", "TOOLS", "TOKENS", "LAST"];

#[derive(Parser, Debug)]
#[command(name = "aam-watch", about = "Watch agent activity from a gateway or relay")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long)]
    reconnect_interval_ms: Option<u64>,
    #[arg(long)]
    max_reconnect_interval_ms: Option<u64>,
    #[arg(long)]
    reconnect_decay: Option<f64>,
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,
    #[arg(long)]
    max_events: Option<usize>,
    #[arg(long)]
    auto_reconnect: Option<bool>,
    #[arg(long, default_value_t = DEFAULT_FEED_WINDOW)]
    feed_window: usize,
    /// Replay events instead of connecting.
    #[arg(long, default_value_t = false)]
    mock: bool,
    /// JSON array of agent events to replay; implies --mock.
    #[arg(long, default_value = "")]
    mock_file: String,
    #[arg(long, default_value_t = DEFAULT_MOCK_INTERVAL.as_millis() as u64)]
    mock_interval_ms: u64,
    /// Print a table on every change instead of drawing the dashboard.
    #[arg(long, default_value_t = false)]
    plain: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct WatchView {
    url: String,
    status: ConnectionStatus,
    snapshot: ActivitySnapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);
    let config = load_config(&args)?;
    let mock = config.mock.is_some();

    let manager = ConnectionManager::new(config)?;
    let (mut snapshots, tracker) = ActivityTracker::spawn(&manager, args.feed_window);
    let mut status = manager.watch_status();
    info!(event = "watch_start", url = %manager.config().url, mock, plain = args.plain);
    manager.connect();

    let mut view = WatchView {
        url: manager.config().url.clone(),
        status: manager.status(),
        snapshot: ActivitySnapshot::default(),
    };
    let outcome = if args.plain {
        run_plain(&mut view, &mut snapshots, &mut status).await
    } else {
        run_dashboard(&manager, &mut view, &mut snapshots, &mut status).await
    };

    manager.disconnect();
    tracker.abort();
    outcome
}

async fn run_plain(
    view: &mut WatchView,
    snapshots: &mut tokio::sync::watch::Receiver<ActivitySnapshot>,
    status: &mut tokio::sync::watch::Receiver<ConnectionStatus>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.snapshot = snapshots.borrow_and_update().clone();
                println!("{}", render_table(&view.snapshot.store));
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.status = status.borrow_and_update().clone();
                println!("# {}", status_line(&view.url, &view.status));
                if let Some(err) = terminal_error(&view.status) {
                    return Err(err);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn run_dashboard(
    manager: &ConnectionManager,
    view: &mut WatchView,
    snapshots: &mut tokio::sync::watch::Receiver<ActivitySnapshot>,
    status: &mut tokio::sync::watch::Receiver<ConnectionStatus>,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let outcome = dashboard_loop(&mut terminal, manager, view, snapshots, status).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    outcome
}

async fn dashboard_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    manager: &ConnectionManager,
    view: &mut WatchView,
    snapshots: &mut tokio::sync::watch::Receiver<ActivitySnapshot>,
    status: &mut tokio::sync::watch::Receiver<ConnectionStatus>,
) -> anyhow::Result<()> {
    let mut events = EventStream::new();
    loop {
        terminal.draw(|frame| render_ui(frame, view))?;
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.snapshot = snapshots.borrow_and_update().clone();
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                view.status = status.borrow_and_update().clone();
                if let Some(err) = terminal_error(&view.status) {
                    return Err(err);
                }
            }
            maybe_event = events.next() => {
                if let Some(Ok(Event::Key(key))) = maybe_event {
                    if key.kind == KeyEventKind::Press && handle_key(key, manager) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Returns true when the dashboard should exit.
fn handle_key(key: KeyEvent, manager: &ConnectionManager) -> bool {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => true,
        KeyCode::Char('r') => {
            manager.reconnect();
            false
        }
        KeyCode::Char('d') => {
            if manager.state() == ConnectionState::Disconnected {
                manager.connect();
            } else {
                manager.disconnect();
            }
            false
        }
        _ => false,
    }
}

fn terminal_error(status: &ConnectionStatus) -> Option<anyhow::Error> {
    status
        .last_error
        .as_ref()
        .filter(|err| err.is_terminal())
        .map(|err| {
            warn!(event = "watch_giving_up", error = %err);
            anyhow::Error::new(err.clone())
        })
}

fn render_ui(frame: &mut ratatui::Frame, view: &WatchView) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(10),
        ])
        .split(frame.size());

    let store = &view.snapshot.store;
    let tokens = store.total_token_usage();
    let header = Paragraph::new(vec![
        Line::from(Span::styled(
            status_line(&view.url, &view.status),
            Style::default().fg(state_color(view.status.state)),
        )),
        Line::from(format!(
            "agents {}  live {}  tokens {}   [r]econnect [d]isconnect [q]uit",
            store.len(),
            store.active_count(),
            tokens.total_tokens
        )),
    ])
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, layout[0]);

    let rows = agent_rows(store)
        .into_iter()
        .map(|cells| Row::new(cells.into_iter().map(Cell::from)));
    let table = Table::new(
        rows,
        [
            Constraint::Percentage(22),
            Constraint::Length(8),
            Constraint::Percentage(22),
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(
        Row::new(AGENT_COLUMNS).style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title("Agents"));
    frame.render_widget(table, layout[1]);

    let feed: Vec<ListItem> = view
        .snapshot
        .feed
        .iter()
        .rev()
        .map(|event| {
            ListItem::new(format!(
                "{} {:<14} {}",
                clock(event.timestamp),
                event.kind().as_str(),
                event.agent_id
            ))
        })
        .collect();
    frame.render_widget(
        List::new(feed).block(Block::default().borders(Borders::ALL).title("Recent events")),
        layout[2],
    );
}

fn state_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Connecting => Color::Yellow,
        ConnectionState::Disconnected => Color::Gray,
        ConnectionState::Error => Color::Red,
    }
}

fn status_line(url: &str, status: &ConnectionStatus) -> String {
    let mut line = format!("{} {}", status.state, url);
    if status.attempts > 0 {
        line.push_str(&format!(" (retry {})", status.attempts));
    }
    if let Some(err) = &status.last_error {
        line.push_str(&format!(" - {err}"));
    }
    line
}

fn agent_rows(store: &ActivityStore) -> Vec<[String; 6]> {
    store
        .sorted()
        .iter()
        .map(|activity| {
            let tools = match activity.last_tool().and_then(|call| call.tool_name.as_deref()) {
                Some(name) => format!("{} ({})", activity.tools_used.len(), name),
                None => activity.tools_used.len().to_string(),
            };
            [
                activity.agent_id.clone(),
                activity.status.to_string(),
                activity.current_model.clone().unwrap_or_else(|| "-".to_string()),
                tools,
                activity.token_usage.total_tokens.to_string(),
                clock(activity.last_activity),
            ]
        })
        .collect()
}

fn render_table(store: &ActivityStore) -> String {
    let rows = agent_rows(store);
    let mut widths = AGENT_COLUMNS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }
    let format_row = |cells: [&str; 6]| {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let mut lines = vec![format_row(AGENT_COLUMNS)];
    for row in &rows {
        lines.push(format_row(row.each_ref().map(String::as_str)));
    }
    lines.join("\n")
}

fn clock(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let url = resolve_string(&args.url, "AAM_URL", DEFAULT_URL);
    let backoff = BackoffPolicy {
        initial_delay: Duration::from_millis(resolve_parsed(
            args.reconnect_interval_ms,
            "AAM_RECONNECT_INTERVAL_MS",
            DEFAULT_INITIAL_DELAY.as_millis() as u64,
        )),
        decay: resolve_parsed(args.reconnect_decay, "AAM_RECONNECT_DECAY", DEFAULT_DECAY),
        max_delay: Duration::from_millis(resolve_parsed(
            args.max_reconnect_interval_ms,
            "AAM_MAX_RECONNECT_INTERVAL_MS",
            DEFAULT_MAX_DELAY.as_millis() as u64,
        )),
        max_attempts: resolve_optional(args.max_reconnect_attempts, "AAM_MAX_RECONNECT_ATTEMPTS"),
    };
    let interval = Duration::from_millis(args.mock_interval_ms);
    let mock = if !args.mock_file.trim().is_empty() {
        Some(load_mock_file(Path::new(&args.mock_file), interval)?)
    } else if resolve_bool(args.mock.then_some(true), "AAM_MOCK_MODE", false) {
        Some(MockConfig {
            interval,
            ..MockConfig::demo()
        })
    } else {
        None
    };
    Ok(ClientConfig {
        url,
        backoff,
        max_events: resolve_parsed(args.max_events, "AAM_MAX_EVENTS", DEFAULT_MAX_EVENTS),
        auto_reconnect: resolve_bool(args.auto_reconnect, "AAM_AUTO_RECONNECT", true),
        mock,
        ..ClientConfig::default()
    })
}

fn load_mock_file(path: &Path, interval: Duration) -> anyhow::Result<MockConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading mock file {}", path.display()))?;
    let events: Vec<AgentEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing mock file {}", path.display()))?;
    Ok(MockConfig::from_events(&events, interval))
}

/// Logs go to stderr in plain mode; the dashboard owns the terminal, so
/// there they are discarded unless AAM_LOG_STDERR is set.
fn init_logging(args: &Args) {
    let level = if args.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("AAM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let to_stderr = args.plain || resolve_bool(None, "AAM_LOG_STDERR", false);
    if to_stderr {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::sink)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_client::ConnectionError;
    use aam_core::event::{AgentStarted, EventPayload, ToolCalled};
    use ratatui::backend::TestBackend;

    fn store() -> ActivityStore {
        let events = [
            AgentEvent::new(
                "alpha",
                1_000,
                EventPayload::AgentStarted(AgentStarted {
                    model: Some("gpt-4".to_string()),
                    metadata: None,
                }),
            ),
            AgentEvent::new(
                "alpha",
                2_000,
                EventPayload::ToolCalled(ToolCalled {
                    tool_name: Some("read".to_string()),
                    duration: None,
                    tool_input: None,
                }),
            ),
            AgentEvent::new(
                "b",
                500,
                EventPayload::AgentStarted(AgentStarted::default()),
            ),
        ];
        ActivityStore::new().fold_batch(events.iter())
    }

    #[test]
    fn table_lists_most_recent_agents_first() {
        let table = render_table(&store());
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("AGENT"));
        assert!(lines[1].starts_with("alpha"));
        assert!(lines[1].contains("gpt-4"));
        assert!(lines[1].contains("1 (read)"));
        assert!(lines[1].ends_with("00:00:02"));
        assert!(lines[2].starts_with("b "));
        assert!(lines[2].contains(" - "));
    }

    #[test]
    fn empty_store_renders_header_only() {
        assert_eq!(
            render_table(&ActivityStore::new()),
            "AGENT  STATUS  MODEL  TOOLS  TOKENS  LAST"
        );
    }

    #[test]
    fn status_line_reports_retries_and_errors() {
        let status = ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_error: Some(ConnectionError::MaxAttemptsReached { attempts: 3 }),
            attempts: 3,
        };
        assert_eq!(
            status_line("ws://x", &status),
            "disconnected ws://x (retry 3) - max reconnect attempts reached (3)"
        );
        assert!(terminal_error(&status).is_some());
    }

    #[test]
    fn dashboard_draws_without_a_real_terminal() {
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).expect("terminal");
        let view = WatchView {
            url: DEFAULT_URL.to_string(),
            status: ConnectionStatus {
                state: ConnectionState::Connected,
                last_error: None,
                attempts: 0,
            },
            snapshot: ActivitySnapshot {
                store: store(),
                feed: Vec::new(),
            },
        };
        terminal
            .draw(|frame| render_ui(frame, &view))
            .expect("draw");
    }

    #[test]
    fn mock_file_loads_agent_events() {
        let path = std::env::temp_dir().join(format!("aam-watch-mock-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"type":"agent_started","agentId":"a1","timestamp":1,"data":{"model":"m"}}]"#,
        )
        .expect("write");
        let mock = load_mock_file(&path, Duration::from_millis(5)).expect("mock");
        let _ = std::fs::remove_file(&path);
        assert_eq!(mock.frames.len(), 1);
        assert_eq!(mock.interval, Duration::from_millis(5));
    }
}
