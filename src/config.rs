use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub max_lifetime_seconds: u64,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shard count for per-bid-chain mutexes.
    pub chain_lock_shards: usize,
    /// Shard count for per-(proposal, block) tally mutexes.
    pub tally_lock_shards: usize,
    /// TTL for applied-message outcomes kept in the in-process cache.
    pub applied_ttl_ms: i64,
    /// Hard cap on rows returned by proposal search.
    pub search_page_max: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_lock_shards: 256,
            tally_lock_shards: 128,
            applied_ttl_ms: 5 * 60 * 1000,
            search_page_max: 500,
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: std::env::var("DATABASE_URL").ok(),
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 40),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        engine: EngineConfig {
            chain_lock_shards: env_usize("CHAIN_LOCK_SHARDS", 256).max(1),
            tally_lock_shards: env_usize("TALLY_LOCK_SHARDS", 128).max(1),
            applied_ttl_ms: env_i64("APPLIED_MESSAGE_TTL_MS", 5 * 60 * 1000).max(1000),
            search_page_max: env_usize("PROPOSAL_SEARCH_PAGE_MAX", 500).clamp(1, 10_000),
        },
    };
    Ok(cfg)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
