use aam_client::config::{
    parse_bool_flag, resolve_bool, resolve_optional, resolve_parsed, resolve_string, DEFAULT_URL,
};
use aam_client::ClientConfig;
use aam_core::backoff::{BackoffPolicy, DEFAULT_DECAY, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:3001";
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub addr: String,
    /// Upstream gateway connection.
    pub gateway: ClientConfig,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub debug: bool,
    pub log_dir: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_RELAY_ADDR.to_string(),
            gateway: ClientConfig::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            debug: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "aam-relay")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub gateway_url: String,
    #[arg(long)]
    pub reconnect_interval_ms: Option<u64>,
    #[arg(long)]
    pub max_reconnect_interval_ms: Option<u64>,
    #[arg(long)]
    pub reconnect_decay: Option<f64>,
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,
    #[arg(long)]
    pub max_events: Option<usize>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config(args: &Args) -> RelayConfig {
    let gateway = ClientConfig {
        url: resolve_string(
            &args.gateway_url,
            "AAM_GATEWAY_URL",
            &resolve_string("", "AAM_URL", DEFAULT_URL),
        ),
        backoff: BackoffPolicy {
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
            max_attempts: resolve_optional(
                args.max_reconnect_attempts,
                "AAM_MAX_RECONNECT_ATTEMPTS",
            ),
        },
        max_events: resolve_parsed(
            args.max_events,
            "AAM_MAX_EVENTS",
            aam_core::event_log::DEFAULT_MAX_EVENTS,
        ),
        auto_reconnect: resolve_bool(None, "AAM_AUTO_RECONNECT", true),
        ..ClientConfig::default()
    };
    RelayConfig {
        addr: resolve_string(&args.addr, "AAM_RELAY_ADDR", DEFAULT_RELAY_ADDR),
        gateway,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug: args.debug || env_true("AAM_RELAY_DEBUG"),
        log_dir: resolve_string(&args.log_dir, "AAM_LOG_DIR", ""),
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}
