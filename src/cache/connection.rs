use std::fmt;

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, RedisResult, aio::MultiplexedConnection};

use crate::cache::keys::account_tokens_key;
use crate::error::CacheError;

/// 单个缓存服务器连接
///
/// 所有方法以 uid 为参数，键前缀由连接自身负责。
/// `watch`/`multi_set`/`unwatch` 是乐观并发写入协议的事务原语，
/// 同一时刻一个连接只会被一个操作持有。
#[async_trait]
pub trait CacheConnection: Send + fmt::Debug {
    async fn get(&mut self, uid: &str) -> Result<Option<String>, CacheError>;

    async fn set(&mut self, uid: &str, value: &str) -> Result<(), CacheError>;

    async fn delete(&mut self, uid: &str) -> Result<(), CacheError>;

    async fn watch(&mut self, uid: &str) -> Result<(), CacheError>;

    /// MULTI / SET / EXEC。返回 `false` 表示事务因 WATCH 失效被放弃
    async fn multi_set(&mut self, uid: &str, value: &str) -> Result<bool, CacheError>;

    async fn unwatch(&mut self) -> Result<(), CacheError>;

    /// 借出前的存活检查
    async fn is_valid(&mut self) -> Result<(), CacheError>;

    /// 连接出现过网络层错误，或仍留有未结束的 WATCH。
    /// 持有者在事务中途被取消时连接会带着 WATCH 归还，这类连接不能再借给别人
    fn has_broken(&self) -> bool;

    /// 关闭连接并等待服务端确认
    async fn destroy(&mut self) -> Result<(), CacheError>;
}

/// 创建原始连接，不包含重试逻辑
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn open(&self) -> Result<Box<dyn CacheConnection>, CacheError>;
}

/// 基于 redis 的连接工厂
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: RedisClient,
    key_prefix: String,
}

impl RedisConnector {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self, CacheError> {
        Ok(Self {
            client: RedisClient::open(redis_url)?,
            key_prefix: key_prefix.to_string(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn open(&self) -> Result<Box<dyn CacheConnection>, CacheError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 握手完成后再确认一次服务端可以响应命令
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Box::new(RedisConnection {
            conn,
            key_prefix: self.key_prefix.clone(),
            broken: false,
            watching: false,
        }))
    }
}

/// 被连接池独占使用的 redis 连接
pub struct RedisConnection {
    conn: MultiplexedConnection,
    key_prefix: String,
    broken: bool,
    watching: bool,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("key_prefix", &self.key_prefix)
            .field("broken", &self.broken)
            .field("watching", &self.watching)
            .finish()
    }
}

impl RedisConnection {
    fn key(&self, uid: &str) -> String {
        account_tokens_key(&self.key_prefix, uid)
    }

    /// 连接生命周期内的错误监听：记录日志，网络层错误标记连接失效，
    /// 由下一次借出时的检查淘汰该连接
    fn observe<T>(&mut self, result: RedisResult<T>) -> Result<T, CacheError> {
        result.map_err(|err| {
            if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
                self.broken = true;
            }
            tracing::error!(op = "cache.error", err = %err, "cache connection error");
            CacheError::from(err)
        })
    }
}

#[async_trait]
impl CacheConnection for RedisConnection {
    async fn get(&mut self, uid: &str) -> Result<Option<String>, CacheError> {
        let key = self.key(uid);
        let result: RedisResult<Option<String>> = self.conn.get(key).await;
        self.observe(result)
    }

    async fn set(&mut self, uid: &str, value: &str) -> Result<(), CacheError> {
        let key = self.key(uid);
        let result: RedisResult<()> = self.conn.set(key, value).await;
        self.observe(result)
    }

    async fn delete(&mut self, uid: &str) -> Result<(), CacheError> {
        let key = self.key(uid);
        let result: RedisResult<()> = self.conn.del(key).await;
        self.observe(result)
    }

    async fn watch(&mut self, uid: &str) -> Result<(), CacheError> {
        let key = self.key(uid);
        // 命令发出前置位：WATCH 是否已在服务端生效无法从错误中判断
        self.watching = true;
        let result: RedisResult<()> = redis::cmd("WATCH").arg(key).query_async(&mut self.conn).await;
        self.observe(result)
    }

    async fn multi_set(&mut self, uid: &str, value: &str) -> Result<bool, CacheError> {
        let key = self.key(uid);
        // EXEC 返回 nil 时结果为 None
        let result: RedisResult<Option<()>> = redis::pipe()
            .atomic()
            .set(key, value)
            .ignore()
            .query_async(&mut self.conn)
            .await;
        let committed = self.observe(result)?;
        // EXEC 无论提交与否都会清除 WATCH
        self.watching = false;
        Ok(committed.is_some())
    }

    async fn unwatch(&mut self) -> Result<(), CacheError> {
        let result: RedisResult<()> = redis::cmd("UNWATCH").query_async(&mut self.conn).await;
        self.observe(result)?;
        self.watching = false;
        Ok(())
    }

    async fn is_valid(&mut self) -> Result<(), CacheError> {
        if self.broken {
            return Err(CacheError::Backend("connection marked broken".to_string()));
        }
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut self.conn).await;
        self.observe(result).map(|_| ())
    }

    fn has_broken(&self) -> bool {
        self.broken || self.watching
    }

    async fn destroy(&mut self) -> Result<(), CacheError> {
        let result: RedisResult<String> = redis::cmd("QUIT").query_async(&mut self.conn).await;
        self.broken = true;
        result.map(|_| ()).map_err(CacheError::from)
    }
}
