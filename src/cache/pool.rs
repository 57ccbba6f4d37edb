use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::cache::connection::{CacheConnection, Connector, RedisConnector};
use crate::config::CacheConfig;
use crate::error::CacheError;

/// bb8 连接管理器：带指数退避的建连、借出前检查、失效连接关闭
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    retry_count: u32,
    initial_backoff: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, retry_count: u32, initial_backoff: Duration) -> Self {
        Self {
            connector,
            retry_count,
            initial_backoff,
        }
    }

    /// 第 n 次重试前等待 `initial_backoff * 2^n`
    fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }

    async fn connect_with_retry(&self) -> Result<Box<dyn CacheConnection>, CacheError> {
        let mut retry = 0;
        loop {
            match self.connector.open().await {
                Ok(conn) => return Ok(conn),
                Err(err) if retry >= self.retry_count => {
                    return Err(CacheError::ConnectFailed {
                        attempts: retry + 1,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    retry += 1;
                    let backoff = self.backoff(retry);
                    tracing::warn!(
                        op = "cache.connect.retry",
                        retry,
                        backoff_ms = backoff.as_millis() as u64,
                        err = %err,
                        "cache connection failed, backing off"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = Box<dyn CacheConnection>;
    type Error = CacheError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connect_with_retry().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        if let Err(err) = conn.is_valid().await {
            // 失效连接在丢弃前先正常关闭
            if let Err(destroy_err) = conn.destroy().await {
                tracing::warn!(op = "cache.destroy.error", err = %destroy_err, "failed to close invalid cache connection");
            }
            return Err(err);
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.has_broken()
    }
}

/// 建连失败不会直接抛给调用方，而是汇入这里记录
#[derive(Debug, Clone, Copy)]
struct FactoryErrorSink;

impl bb8::ErrorSink<CacheError> for FactoryErrorSink {
    fn sink(&self, err: CacheError) {
        tracing::error!(op = "cache.factoryCreateError", err = %err, "failed to create cache connection");
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<CacheError>> {
        Box::new(*self)
    }
}

struct PoolInner {
    pool: RwLock<Option<bb8::Pool<ConnectionManager>>>,
    pending: Arc<Semaphore>,
}

/// 缓存连接池，在服务启动时构造一次，按句柄传给需要的组件
#[derive(Clone)]
pub struct CachePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for CachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePool")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CachePool {
    /// 缓存被关闭时返回 `None`，上层据此完全绕过缓存。
    ///
    /// 需要在 tokio 运行时内调用。
    pub fn from_config(config: &CacheConfig) -> Result<Option<Self>, CacheError> {
        if !config.enabled {
            tracing::info!("Cache disabled, sessions are served from the store only");
            return Ok(None);
        }
        let connector = RedisConnector::new(&config.redis_url(), &config.key_prefix)?;
        Ok(Some(Self::with_connector(Arc::new(connector), config)))
    }

    pub fn with_connector(connector: Arc<dyn Connector>, config: &CacheConfig) -> Self {
        let max_size = config.max_connections.max(1);
        let min_idle = (config.min_connections > 0).then(|| config.min_connections.min(max_size));
        let manager = ConnectionManager::new(connector, config.retry_count, config.initial_backoff());
        let pool = bb8::Pool::builder()
            .max_size(max_size)
            .min_idle(min_idle)
            .connection_timeout(config.acquire_timeout())
            .test_on_check_out(true)
            .retry_connection(false)
            .error_sink(Box::new(FactoryErrorSink))
            .build_unchecked(manager);

        Self {
            inner: Arc::new(PoolInner {
                pool: RwLock::new(Some(pool)),
                pending: Arc::new(Semaphore::new(config.max_pending_acquires.max(1) as usize)),
            }),
        }
    }

    /// 借出一个连接。返回的句柄在任何退出路径上被丢弃时都会把连接归还连接池
    pub async fn acquire(&self) -> Result<CacheHandle, CacheError> {
        let pool = self.inner.pool.read().clone().ok_or(CacheError::PoolClosed)?;
        let _pending = self
            .inner
            .pending
            .clone()
            .try_acquire_owned()
            .map_err(|_| CacheError::PoolExhausted)?;
        let conn = pool.get_owned().await?;
        Ok(CacheHandle { conn })
    }

    /// 释放所有空闲连接，借出中的连接在归还时关闭；可重复调用
    pub fn close(&self) {
        if let Some(pool) = self.inner.pool.write().take() {
            let state = pool.state();
            tracing::info!(
                connections = state.connections,
                idle = state.idle_connections,
                "Closing cache pool"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.read().is_none()
    }

    pub fn state(&self) -> Option<bb8::State> {
        self.inner.pool.read().as_ref().map(|pool| pool.state())
    }
}

/// 连接句柄，离开作用域即归还
pub struct CacheHandle {
    conn: bb8::PooledConnection<'static, ConnectionManager>,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle").finish_non_exhaustive()
    }
}

impl Deref for CacheHandle {
    type Target = dyn CacheConnection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for CacheHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{CacheOp, MemoryBackend};
    use bb8::ManageConnection;

    fn test_config() -> CacheConfig {
        CacheConfig {
            min_connections: 0,
            max_connections: 1,
            max_pending_acquires: 10,
            acquire_timeout_ms: 50,
            retry_count: 3,
            initial_backoff_ms: 1,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn disabled_cache_builds_no_pool() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        assert!(CachePool::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let backend = MemoryBackend::new();
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &test_config());

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.set("abc", "{}").await.unwrap();
        }
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(conn.get("abc").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(backend.connects(), 1);
        assert!(backend.count(CacheOp::IsValid) >= 1);
    }

    #[tokio::test]
    async fn connection_failing_validation_is_replaced_on_acquire() {
        let backend = MemoryBackend::new();
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &test_config());

        drop(pool.acquire().await.unwrap());
        assert_eq!(backend.connects(), 1);

        backend.fail_once(CacheOp::IsValid);
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.is_valid().await.is_ok());
        assert_eq!(backend.connects(), 2);
        assert_eq!(backend.destroyed(), 1);
    }

    #[tokio::test]
    async fn connection_returned_mid_transaction_is_discarded() {
        let backend = MemoryBackend::new();
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &test_config());

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.watch("abc").await.unwrap();
        }
        drop(pool.acquire().await.unwrap());
        assert_eq!(backend.connects(), 2);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_busy() {
        let backend = MemoryBackend::new();
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &test_config());

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CacheError::AcquireTimeout));
    }

    #[tokio::test]
    async fn too_many_pending_acquires_fail_fast() {
        let backend = MemoryBackend::new();
        let config = CacheConfig {
            max_pending_acquires: 1,
            acquire_timeout_ms: 1000,
            ..test_config()
        };
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &config);

        let held = pool.acquire().await.unwrap();
        let waiting = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|_| ()) }
        });
        sleep(Duration::from_millis(20)).await;

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CacheError::PoolExhausted));

        drop(held);
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_acquires() {
        let backend = MemoryBackend::new();
        let pool = CachePool::with_connector(Arc::new(backend.connector("p:")), &test_config());

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.state().is_none());
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            CacheError::PoolClosed
        ));
    }

    #[tokio::test]
    async fn connect_retries_with_backoff() {
        let backend = MemoryBackend::new();
        backend.refuse_connects(2);
        let manager = ConnectionManager::new(
            Arc::new(backend.connector("p:")),
            3,
            Duration::from_millis(1),
        );

        assert!(manager.connect().await.is_ok());
        assert_eq!(backend.connects(), 3);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retry_count() {
        let backend = MemoryBackend::new();
        backend.refuse_connects(10);
        let manager = ConnectionManager::new(
            Arc::new(backend.connector("p:")),
            2,
            Duration::from_millis(1),
        );

        match manager.connect().await {
            Err(CacheError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(backend.connects(), 3);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let manager = ConnectionManager::new(
            Arc::new(MemoryBackend::new().connector("p:")),
            3,
            Duration::from_millis(100),
        );
        assert_eq!(manager.backoff(1), Duration::from_millis(200));
        assert_eq!(manager.backoff(2), Duration::from_millis(400));
        assert_eq!(manager.backoff(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn invalid_connection_is_destroyed() {
        let backend = MemoryBackend::new();
        let manager = ConnectionManager::new(
            Arc::new(backend.connector("p:")),
            0,
            Duration::from_millis(1),
        );
        let mut conn = manager.connect().await.unwrap();

        backend.fail(CacheOp::IsValid);
        assert!(manager.is_valid(&mut conn).await.is_err());
        assert_eq!(backend.destroyed(), 1);
        assert!(manager.has_broken(&mut conn));
    }
}
