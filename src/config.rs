// src/config.rs
//! Service configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MOCK_LATENCY_MS: u64 = 2000;
pub const DEFAULT_SESSION_IDLE_TTL_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub inference_url: Option<String>,
    pub inference_api_key: Option<String>,
    pub inference_timeout: Duration,
    pub mock_latency: Duration,
    pub session_idle_ttl: Duration,
    pub static_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Optional:
    /// - `BIND_ADDR`: default `0.0.0.0:8080`
    /// - `REDIS_URL`: records kept in memory when absent
    /// - `INFERENCE_URL`: mock classifier when absent
    /// - `INFERENCE_API_KEY`
    /// - `INFERENCE_TIMEOUT_SECS`: default 30
    /// - `MOCK_INFERENCE_LATENCY_MS`: default 2000
    /// - `SESSION_IDLE_TTL_SECS`: default 3600
    /// - `STATIC_DIR`: built dashboard to serve at `/`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parse_u64 = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            redis_url: non_empty("REDIS_URL"),
            inference_url: non_empty("INFERENCE_URL"),
            inference_api_key: non_empty("INFERENCE_API_KEY"),
            inference_timeout: Duration::from_secs(parse_u64(
                "INFERENCE_TIMEOUT_SECS",
                DEFAULT_INFERENCE_TIMEOUT_SECS,
            )),
            mock_latency: Duration::from_millis(parse_u64(
                "MOCK_INFERENCE_LATENCY_MS",
                DEFAULT_MOCK_LATENCY_MS,
            )),
            session_idle_ttl: Duration::from_secs(parse_u64(
                "SESSION_IDLE_TTL_SECS",
                DEFAULT_SESSION_IDLE_TTL_SECS,
            )),
            static_dir: non_empty("STATIC_DIR").map(PathBuf::from),
        }
    }
}
