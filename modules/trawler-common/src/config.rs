use std::collections::HashMap;
use std::env;

/// Framework configuration loaded from `TRAWLER_*` environment variables.
///
/// Every key has a default, so `Config::from_env()` never fails; spiders may
/// override the per-crawl keys through `SpiderOverrides`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds to sleep before each fetch.
    pub request_delay: f64,
    /// Default per-request timeout in seconds.
    pub request_timeout: f64,
    /// Downloader semaphore size (concurrent fetches per engine).
    pub concurrency_per_spider: usize,
    /// Upper bound on per-request fetch attempts.
    pub max_retries: u32,
    /// Headers merged under request headers.
    pub default_headers: HashMap<String, String>,
    /// Registered name of the duplicate filter implementation.
    pub duplicate_filter_impl: String,
    /// Registered name of the scheduler container implementation.
    pub scheduler_container_impl: String,
    /// Registered name of the fetcher implementation.
    pub fetcher_impl: String,
    /// Size of the sync-offload worker pool.
    pub worker_pool_size: usize,
    /// Number of worker loops per engine.
    pub worker_loops: usize,
    /// Number of pipeline drain loops per engine.
    pub pipeline_workers: usize,
    /// Response statuses that produce no response (distinct from a drop).
    pub ignored_statuses: Vec<u16>,
    /// Widens the quiescence grace window for shared-queue crawls.
    pub distributed_mode: bool,
    /// Pipeline stages run in parallel instead of chained.
    pub pipeline_parallel: bool,
    /// Optional connectivity probe checked before starting.
    pub healthcheck_url: Option<String>,

    // Logging
    pub log_level: String,
    pub log_path: String,
    pub log_to_file: bool,

    // Shared backend
    pub redis_url: String,
    pub redis_prefix: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            request_delay: env_parsed("TRAWLER_REQUEST_DELAY", 0.0),
            request_timeout: env_parsed("TRAWLER_REQUEST_TIMEOUT", 10.0),
            concurrency_per_spider: env_parsed("TRAWLER_CONCURRENCY_PER_SPIDER", 100),
            max_retries: env_parsed("TRAWLER_MAX_RETRIES", 3),
            default_headers: default_headers(),
            duplicate_filter_impl: env_string("TRAWLER_DUPLICATE_FILTER_IMPL", "memory"),
            scheduler_container_impl: env_string("TRAWLER_SCHEDULER_CONTAINER_IMPL", "memory"),
            fetcher_impl: env_string("TRAWLER_FETCHER_IMPL", "http"),
            worker_pool_size: env_parsed("TRAWLER_WORKER_POOL_SIZE", 50),
            worker_loops: env_parsed("TRAWLER_WORKER_LOOPS", 3),
            pipeline_workers: env_parsed("TRAWLER_PIPELINE_WORKERS", 2),
            ignored_statuses: env::var("TRAWLER_IGNORED_STATUSES")
                .ok()
                .map(|v| parse_status_list(&v))
                .unwrap_or_else(default_ignored_statuses),
            distributed_mode: env_bool("TRAWLER_DISTRIBUTED_MODE", false),
            pipeline_parallel: env_bool("TRAWLER_PIPELINE_PARALLEL", false),
            healthcheck_url: env::var("TRAWLER_HEALTHCHECK_URL").ok().filter(|v| !v.is_empty()),
            log_level: env_string("TRAWLER_LOG_LEVEL", "info"),
            log_path: env_string("TRAWLER_LOG_PATH", ".logs/trawler.log"),
            log_to_file: env_bool("TRAWLER_LOG_TO_FILE", false),
            redis_url: env_string("TRAWLER_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_prefix: env_string("TRAWLER_REDIS_PREFIX", "trawler"),
        }
    }

    /// Log the effective crawl settings at startup.
    pub fn log_summary(&self) {
        tracing::info!(
            concurrency = self.concurrency_per_spider,
            max_retries = self.max_retries,
            request_timeout = self.request_timeout,
            request_delay = self.request_delay,
            worker_loops = self.worker_loops,
            filter = %self.duplicate_filter_impl,
            container = %self.scheduler_container_impl,
            fetcher = %self.fetcher_impl,
            distributed = self.distributed_mode,
            "Configuration loaded"
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_delay: 0.0,
            request_timeout: 10.0,
            concurrency_per_spider: 100,
            max_retries: 3,
            default_headers: default_headers(),
            duplicate_filter_impl: "memory".to_string(),
            scheduler_container_impl: "memory".to_string(),
            fetcher_impl: "http".to_string(),
            worker_pool_size: 50,
            worker_loops: 3,
            pipeline_workers: 2,
            ignored_statuses: default_ignored_statuses(),
            distributed_mode: false,
            pipeline_parallel: false,
            healthcheck_url: None,
            log_level: "info".to_string(),
            log_path: ".logs/trawler.log".to_string(),
            log_to_file: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_prefix: "trawler".to_string(),
        }
    }
}

fn default_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Accept".to_string(), "*/*".to_string());
    headers.insert("Accept-Encoding".to_string(), "gzip, deflate".to_string());
    headers.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());
    headers.insert(
        "User-Agent".to_string(),
        format!("trawler/{}", env!("CARGO_PKG_VERSION")),
    );
    headers
}

fn default_ignored_statuses() -> Vec<u16> {
    vec![401, 403, 404, 405, 500, 502, 504]
}

/// Parse a comma-separated status list, skipping anything non-numeric.
pub fn parse_status_list(raw: &str) -> Vec<u16> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<u16>().ok())
        .collect()
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.request_timeout, 10.0);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.concurrency_per_spider, 100);
        assert_eq!(config.worker_loops, 3);
        assert_eq!(config.ignored_statuses, vec![401, 403, 404, 405, 500, 502, 504]);
        assert!(!config.distributed_mode);
        assert!(!config.pipeline_parallel);
        assert!(config.healthcheck_url.is_none());
    }

    #[test]
    fn default_headers_carry_a_user_agent() {
        let config = Config::default();
        assert!(config.default_headers.contains_key("User-Agent"));
        assert!(config.default_headers.contains_key("Accept"));
    }

    #[test]
    fn status_list_parsing_skips_junk() {
        assert_eq!(parse_status_list("401, 404,junk,500"), vec![401, 404, 500]);
        assert!(parse_status_list("").is_empty());
    }
}
