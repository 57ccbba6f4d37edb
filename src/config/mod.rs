use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 缓存服务器连接与连接池配置
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub key_prefix: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub max_pending_acquires: u32,
    pub acquire_timeout_ms: u64,
    pub retry_count: u32,
    pub initial_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 6379,
            key_prefix: "account-sessions:".to_string(),
            min_connections: 2,
            max_connections: 200,
            max_pending_acquires: 1000,
            acquire_timeout_ms: 1000,
            retry_count: 3,
            initial_backoff_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub store_url: String,
    pub cache: CacheConfig,
    /// 无设备会话的最长存活时间（毫秒），0 表示永不过期
    pub session_token_without_device_ms: u64,
    /// 早于该时间戳的最后访问时间只按近似值展示
    pub earliest_sane_timestamp: i64,
}

/// 读取可选环境变量，缺失或无法解析时使用默认值
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            enabled: env_or("CACHE_ENABLED", defaults.enabled),
            host: env::var("CACHE_HOST").unwrap_or(defaults.host),
            port: env_or("CACHE_PORT", defaults.port),
            key_prefix: env::var("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            min_connections: env_or("CACHE_MIN_CONNECTIONS", defaults.min_connections),
            max_connections: env_or("CACHE_MAX_CONNECTIONS", defaults.max_connections),
            max_pending_acquires: env_or("CACHE_MAX_PENDING", defaults.max_pending_acquires),
            acquire_timeout_ms: env_or("CACHE_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout_ms),
            retry_count: env_or("CACHE_RETRY_COUNT", defaults.retry_count),
            initial_backoff_ms: env_or("CACHE_INITIAL_BACKOFF_MS", defaults.initial_backoff_ms),
        };

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            server_port: env_or("SERVER_PORT", 9000),
            store_url: env::var("STORE_URL")?,
            cache,
            session_token_without_device_ms: env_or(
                "SESSION_TOKEN_WITHOUT_DEVICE_MS",
                2_419_200_000,
            ),
            earliest_sane_timestamp: env_or("EARLIEST_SANE_TIMESTAMP", 1_507_081_020_000),
        })
    }
}
