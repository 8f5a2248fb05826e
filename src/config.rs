use crate::error::{MirrorError, Result};

pub const ESI_BASE_URL: &str = "https://esi.evetech.net/latest";

/// Minimum interval between two order refreshes for the same filter (seconds).
/// Callers can override per query; a threshold <= 0 forces a refetch.
pub const DEFAULT_UPDATE_THRESHOLD_SECS: i64 = 1200;

/// Fallback response-cache TTL when the caller gives no threshold and the
/// remote response carries no Expires hint (seconds).
pub const DEFAULT_CACHE_TTL_SECS: i64 = 1200;

/// History is refreshed when the newest stored day is older than this.
/// ESI publishes one row per day, so two days of slack avoids refetching
/// around the daily update boundary.
pub const HISTORY_UPDATE_THRESHOLD_SECS: i64 = 2 * 24 * 3600;

/// ESI recalculates history at 11:05 UTC. History dates are stored as
/// midnight-UTC epoch + this offset so same-day rows compare correctly
/// against freshness thresholds.
pub const HISTORY_DATE_OFFSET_SECS: i64 = 39_900;

/// A full order snapshot for a location/region has well over this many rows.
/// Fewer rows at the newest retrieve_time means the previous fetch was
/// interrupted, so the snapshot is treated as stale regardless of age.
pub const MIN_FRESH_ORDER_ROWS: i64 = 1000;

/// Maximum in-flight ESI requests per fan-out (pages or history types).
pub const DEFAULT_FETCH_CONCURRENCY: usize = 32;

/// Per-request HTTP timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub esi_base_url: String,
    pub db_path: String,
    pub log_level: String,
    /// Cap on concurrent page/type fetches (FETCH_CONCURRENCY).
    pub fetch_concurrency: usize,
    /// Bearer token for authenticated endpoints such as structure markets
    /// (ESI_TOKEN). Never part of any cache key.
    pub esi_token: Option<String>,
    /// ESI asks every consumer to identify itself (USER_AGENT).
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let fetch_concurrency = std::env::var("FETCH_CONCURRENCY")
            .unwrap_or_else(|_| DEFAULT_FETCH_CONCURRENCY.to_string())
            .parse::<usize>()
            .map_err(|_| {
                MirrorError::Config("FETCH_CONCURRENCY must be a positive integer".to_string())
            })?;
        if fetch_concurrency == 0 {
            return Err(MirrorError::Config(
                "FETCH_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            esi_base_url: std::env::var("ESI_BASE_URL")
                .unwrap_or_else(|_| ESI_BASE_URL.to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "market.db".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            fetch_concurrency,
            esi_token: std::env::var("ESI_TOKEN").ok().filter(|t| !t.is_empty()),
            user_agent: std::env::var("USER_AGENT")
                .unwrap_or_else(|_| "esi-market-mirror/0.1".to_string()),
        })
    }
}
