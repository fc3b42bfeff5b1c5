//! Environment-only configuration surface. No file parsing, no hot reload —
//! both are explicit non-goals; this mirrors the teacher's `Config::from_env()`
//! call site in `main.rs`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Aggressive,
    Balanced,
    Eco,
}

impl SyncMode {
    fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "aggressive" => SyncMode::Aggressive,
            "eco" => SyncMode::Eco,
            _ => SyncMode::Balanced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_urls: Vec<String>,
    pub database_url: String,
    pub chain_id: i64,

    pub fetcher_results_size: usize,
    pub fetcher_concurrency: usize,
    pub force_rps: bool,
    pub sync_mode: SyncMode,
    pub always_active: bool,
    pub demo_mode: bool,
    pub continuous_mode: bool,

    pub rpc_timeout: Duration,
    pub dispatch_reply_timeout: Duration,
    pub writer_shutdown_timeout: Duration,

    pub drift_tolerance: u64,
    pub strict_height_check: bool,

    pub sequencer_buffer_limit: usize,
    pub stall_watchdog_idle_secs: u64,
    pub stall_watchdog_dead_secs: u64,
    pub max_gap_fill_attempts: u32,

    pub async_writer_queue_capacity: usize,

    pub watched_tokens: Vec<alloy::primitives::Address>,

    pub checkpoint_dir: String,
    pub demo_leap_threshold: u64,
}

impl Config {
    /// Loads configuration from the process environment. `.env` (if present)
    /// is merged in first via `dotenvy`, matching the teacher's dependency
    /// list — this is still "env vars only", not a bespoke file format.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let rpc_urls = std::env::var("RPC_URLS")
            .or_else(|_| std::env::var("RPC_URL"))
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let lab_mode = rpc_urls.iter().any(|u| {
            let u = u.to_ascii_lowercase();
            u.contains("localhost") || u.contains("127.0.0.1") || u.contains("anvil")
        });

        Self {
            rpc_urls,
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/indexer".to_string()),
            chain_id: std::env::var("CHAIN_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(1),

            fetcher_results_size: env_usize("FETCHER_RESULTS_SIZE", 15_000),
            fetcher_concurrency: env_usize("FETCHER_CONCURRENCY", 8),
            force_rps: env_bool("FORCE_RPS", false),
            sync_mode: std::env::var("SYNC_MODE")
                .map(|v| SyncMode::from_env_str(&v))
                .unwrap_or(if lab_mode { SyncMode::Aggressive } else { SyncMode::Balanced }),
            always_active: env_bool("ALWAYS_ACTIVE", lab_mode),
            demo_mode: env_bool("DEMO_MODE", false),
            continuous_mode: env_bool("CONTINUOUS_MODE", true),

            rpc_timeout: Duration::from_secs(10),
            dispatch_reply_timeout: Duration::from_secs(5),
            writer_shutdown_timeout: Duration::from_secs(30),

            drift_tolerance: 5,
            strict_height_check: env_bool("STRICT_HEIGHT_CHECK", false),

            sequencer_buffer_limit: if lab_mode { 50_000 } else { 1_000 },
            stall_watchdog_idle_secs: 30,
            stall_watchdog_dead_secs: 60,
            max_gap_fill_attempts: 3,

            async_writer_queue_capacity: env_usize("ASYNC_WRITER_QUEUE_CAPACITY", 1_000),

            watched_tokens: Vec::new(),

            checkpoint_dir: std::env::var("CHECKPOINT_DIR").unwrap_or_else(|_| "data/checkpoints".to_string()),
            demo_leap_threshold: env_usize("DEMO_LEAP_THRESHOLD", 1_000) as u64,
        }
    }

    pub fn is_lab_mode(&self) -> bool {
        self.rpc_urls.iter().any(|u| {
            let u = u.to_ascii_lowercase();
            u.contains("localhost") || u.contains("127.0.0.1") || u.contains("anvil")
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_parses_case_insensitively() {
        assert_eq!(SyncMode::from_env_str("Aggressive"), SyncMode::Aggressive);
        assert_eq!(SyncMode::from_env_str("ECO"), SyncMode::Eco);
        assert_eq!(SyncMode::from_env_str("garbage"), SyncMode::Balanced);
    }
}
