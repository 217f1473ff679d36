//! Environment-driven configuration.
//!
//! All knobs are read from `SAFEFETCH_*` variables. Values are trimmed; empty means unset and
//! unparsable values fall back to the default.

use serde::Serialize;

pub const DEFAULT_USER_AGENT: &str = concat!("safefetch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_s: u64,
    pub max_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_s: 86_400,
            max_keys: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub max_content_length: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_redirects: 5,
            max_content_length: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SecurityConfig {
    /// Extra hostnames/IP literals to block on top of the built-in table.
    pub blocked_hosts: Vec<String>,
    /// Hostnames that bypass the host/IP checks (exact, case-insensitive).
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskConfig {
    pub default_ttl_ms: u64,
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub page_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 3_600_000,
            poll_interval_ms: 1_000,
            sweep_interval_ms: 60_000,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Config {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    /// Global inline-content character limit; 0 means unlimited.
    pub inline_limit: usize,
    pub security: SecurityConfig,
    pub tasks: TaskConfig,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env(key).and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env(key).map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn env_list(key: &str) -> Vec<String> {
    env(key)
        .map(|s| {
            s.split(',')
                .map(|x| x.trim().to_ascii_lowercase())
                .filter(|x| !x.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            cache: CacheConfig {
                enabled: env_bool("SAFEFETCH_CACHE_ENABLED", d.cache.enabled),
                ttl_s: env_parse("SAFEFETCH_CACHE_TTL_S", d.cache.ttl_s),
                max_keys: env_parse("SAFEFETCH_CACHE_MAX_KEYS", d.cache.max_keys).max(1),
            },
            fetch: FetchConfig {
                timeout_ms: env_parse("SAFEFETCH_FETCH_TIMEOUT_MS", d.fetch.timeout_ms),
                max_redirects: env_parse("SAFEFETCH_MAX_REDIRECTS", d.fetch.max_redirects)
                    .min(20),
                max_content_length: env_parse(
                    "SAFEFETCH_MAX_CONTENT_LENGTH",
                    d.fetch.max_content_length,
                ),
                user_agent: env("SAFEFETCH_USER_AGENT").unwrap_or(d.fetch.user_agent),
            },
            inline_limit: env_parse("SAFEFETCH_MAX_INLINE_CHARS", d.inline_limit),
            security: SecurityConfig {
                blocked_hosts: env_list("SAFEFETCH_BLOCKED_HOSTS"),
                allowed_hosts: env_list("SAFEFETCH_ALLOWED_HOSTS"),
            },
            tasks: TaskConfig {
                default_ttl_ms: env_parse("SAFEFETCH_TASK_TTL_MS", d.tasks.default_ttl_ms),
                poll_interval_ms: env_parse(
                    "SAFEFETCH_TASK_POLL_INTERVAL_MS",
                    d.tasks.poll_interval_ms,
                ),
                sweep_interval_ms: env_parse(
                    "SAFEFETCH_TASK_SWEEP_INTERVAL_MS",
                    d.tasks.sweep_interval_ms,
                )
                .max(100),
                page_size: env_parse("SAFEFETCH_TASK_PAGE_SIZE", d.tasks.page_size).clamp(1, 500),
            },
        }
    }
}
