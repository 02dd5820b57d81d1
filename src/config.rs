use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Process configuration read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_password: String,
    pub sqlite_path: String,
    pub binance_base: String,
    pub binance_ws_url: String,
    pub dashboard_addr: SocketAddr,
    pub http_timeout: Duration,
    pub monitor_interval: Duration,
    pub breaker_interval: Duration,
    pub discovery_poll: Duration,
    /// Deadline for the stream's TCP/TLS/WebSocket handshake.
    pub ws_connect_timeout: Duration,
    pub ws_reconnect_delay: Duration,
    pub discovery_concurrency: usize,
    pub discovery_cache_ttl: Duration,
    /// Deadline for one whole discovery cycle.
    pub discovery_timeout: Duration,
    pub event_channel_cap: usize,
    pub push_buffer: usize,
}

fn parse_from<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset or blank keys take
    /// their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string_var = |key: &str, default: &str| {
            get(key).filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
        };
        let secs = |key: &'static str, default: u64| parse_from(key, get(key), default).map(Duration::from_secs);

        let app_password = get("APP_PASSWORD")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("APP_PASSWORD"))?;

        Ok(Self {
            app_password,
            sqlite_path: string_var("SQLITE_PATH", "squeezefx.sqlite"),
            binance_base: string_var("BINANCE_BASE", "https://api.binance.com"),
            binance_ws_url: string_var("BINANCE_WS_URL", "wss://stream.binance.com:9443/ws"),
            dashboard_addr: parse_from("DASHBOARD_ADDR", get("DASHBOARD_ADDR"), SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            http_timeout: secs("HTTP_TIMEOUT_SECS", 10)?,
            monitor_interval: Duration::from_millis(parse_from("MONITOR_INTERVAL_MS", get("MONITOR_INTERVAL_MS"), 2_000)?),
            breaker_interval: secs("BREAKER_INTERVAL_SECS", 15)?,
            discovery_poll: secs("DISCOVERY_POLL_SECS", 60)?,
            ws_connect_timeout: secs("WS_CONNECT_TIMEOUT_SECS", 10)?,
            ws_reconnect_delay: secs("WS_RECONNECT_SECS", 5)?,
            discovery_concurrency: parse_from("DISCOVERY_CONCURRENCY", get("DISCOVERY_CONCURRENCY"), 8)?,
            discovery_cache_ttl: secs("DISCOVERY_CACHE_TTL_SECS", 3_600)?,
            discovery_timeout: secs("DISCOVERY_TIMEOUT_SECS", 300)?,
            event_channel_cap: parse_from("EVENT_CHANNEL_CAP", get("EVENT_CHANNEL_CAP"), 4_096)?,
            push_buffer: parse_from("PUSH_BUFFER", get("PUSH_BUFFER"), 1_024)?,
        })
    }
}
