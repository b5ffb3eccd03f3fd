use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, loaded from the environment with per-key defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub auth_token_ttl_seconds: u64,
    pub login_rate_window_seconds: u64,
    pub login_rate_limit_max: usize,
    pub ws_queue_limit_messages: usize,
    pub ws_queue_limit_bytes: usize,
    pub match_queue_timeout_seconds: u64,
    pub session_tick_interval_ms: u64,
    pub session_max_ticks: usize,
    pub ops_token: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parse_or("SERVER_PORT", 8080),
            database_url: env_or("DATABASE_URL", "sqlite://data/match_server.db"),
            auth_token_ttl_seconds: parse_or("AUTH_TOKEN_TTL_SECONDS", 3600),
            login_rate_window_seconds: parse_or("LOGIN_RATE_LIMIT_WINDOW", 60),
            login_rate_limit_max: parse_or("LOGIN_RATE_LIMIT_MAX", 5),
            ws_queue_limit_messages: parse_or("WS_QUEUE_LIMIT_MESSAGES", 8),
            ws_queue_limit_bytes: parse_or("WS_QUEUE_LIMIT_BYTES", 65536),
            match_queue_timeout_seconds: parse_or("MATCH_QUEUE_TIMEOUT_SECONDS", 10),
            session_tick_interval_ms: parse_or("SESSION_TICK_INTERVAL_MS", 100),
            session_max_ticks: parse_or("SESSION_MAX_TICKS", 5),
            ops_token: env_or("OPS_TOKEN", ""),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.session_tick_interval_ms)
    }

    pub fn default_queue_timeout(&self) -> Duration {
        Duration::from_secs(self.match_queue_timeout_seconds)
    }
}
