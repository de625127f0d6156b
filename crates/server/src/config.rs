// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development, mirroring the deployment story: one process, env-configured,
// no config files.

use std::net::SocketAddr;
use std::time::Duration;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `atelier_server=debug`).
    pub log_filter: String,
    /// Debounce window for `auto`-mode analysis triggers.
    pub debounce_window: Duration,
    /// Ceiling on concurrently running analysis jobs.
    pub max_running_jobs: usize,
    /// Per-job timeout for the external analysis engine call.
    pub engine_timeout: Duration,
    /// Cap on each workspace's change-history log.
    pub max_history_entries: usize,
    /// Development credential table, `token=user:role` comma-separated.
    /// Production deployments inject a real `IdentityVerifier` instead.
    pub auth_tokens: Option<String>,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ATELIER_HOST` | `0.0.0.0` |
    /// | `ATELIER_PORT` | `8080` |
    /// | `ATELIER_LOG_FILTER` | `info` |
    /// | `ATELIER_DEBOUNCE_MS` | `2000` |
    /// | `ATELIER_MAX_RUNNING_JOBS` | `3` |
    /// | `ATELIER_ENGINE_TIMEOUT_SECS` | `180` |
    /// | `ATELIER_MAX_HISTORY_ENTRIES` | `200` |
    /// | `ATELIER_AUTH_TOKENS` | *(none; dev verifier accepts `dev-<user>`)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("ATELIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("ATELIER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("ATELIER_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let debounce_window = Duration::from_millis(
            env("ATELIER_DEBOUNCE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(2_000),
        );

        let max_running_jobs =
            env("ATELIER_MAX_RUNNING_JOBS").ok().and_then(|v| v.parse().ok()).unwrap_or(3);

        let engine_timeout = Duration::from_secs(
            env("ATELIER_ENGINE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(180),
        );

        let max_history_entries =
            env("ATELIER_MAX_HISTORY_ENTRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(200);

        let auth_tokens = env("ATELIER_AUTH_TOKENS").ok();

        Self {
            listen_addr,
            log_filter,
            debounce_window,
            max_running_jobs,
            engine_timeout,
            max_history_entries,
            auth_tokens,
        }
    }
}
