use crate::cache::connection::CacheConnection;
use crate::cache::models::session::{AccountTokens, TokenRecord};
use crate::cache::pool::{CacheHandle, CachePool};
use crate::error::CacheError;

/// 账户会话缓存操作
///
/// 每个账户一个缓存条目。写入走 WATCH / GET / MULTI-SET-EXEC 乐观并发协议，
/// 冲突时直接失败，由调用方决定是否重试；读取失败只记录日志并返回空结果。
#[derive(Debug, Clone)]
pub struct AccountSessionCache {
    pool: CachePool,
}

impl AccountSessionCache {
    pub fn new(pool: CachePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &CachePool {
        &self.pool
    }

    /// 读取账户的全部缓存令牌，任何失败都降级为空结果
    pub async fn get_account_tokens(&self, uid: &str, method: &str) -> AccountTokens {
        match self.try_get_account_tokens(uid).await {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::error!(op = "cache.get.error", method, err = %err, "cache read failed");
                AccountTokens::default()
            }
        }
    }

    async fn try_get_account_tokens(&self, uid: &str) -> Result<AccountTokens, CacheError> {
        let mut conn = self.pool.acquire().await?;
        let raw = conn.get(uid).await?;
        Ok(parse_tokens(uid, raw.as_deref()))
    }

    /// 写入或替换一条令牌记录
    pub async fn update_token(&self, record: &TokenRecord, method: &str) -> Result<(), CacheError> {
        self.read_modify_write(&record.uid, method, |tokens| {
            tokens.insert(record.clone());
            true
        })
        .await
    }

    /// 删除一条令牌记录，记录不存在时不写回
    pub async fn delete_token(
        &self,
        uid: &str,
        token_id: &str,
        method: &str,
    ) -> Result<(), CacheError> {
        self.read_modify_write(uid, method, |tokens| tokens.remove(token_id).is_some())
            .await
    }

    /// 删除整个账户的缓存条目，无需 WATCH
    pub async fn delete_account(&self, uid: &str, method: &str) -> Result<(), CacheError> {
        let mut conn = self.acquire(method).await?;
        conn.delete(uid).await.inspect_err(|err| {
            tracing::error!(op = "cache.del.error", method, err = %err, "cache delete failed");
        })
    }

    /// `mutate` 返回 `false` 表示没有需要写回的变化
    async fn read_modify_write<F>(&self, uid: &str, method: &str, mutate: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut AccountTokens) -> bool + Send,
    {
        let mut conn = self.acquire(method).await?;

        if let Err(err) = conn.watch(uid).await {
            unwatch(&mut *conn, method).await;
            tracing::error!(op = "cache.watch.error", method, err = %err, "cache watch failed");
            return Err(err);
        }

        let raw = match conn.get(uid).await {
            Ok(raw) => raw,
            Err(err) => {
                unwatch(&mut *conn, method).await;
                tracing::error!(op = "cache.get.error", method, err = %err, "cache read failed");
                return Err(err);
            }
        };

        let mut tokens = parse_tokens(uid, raw.as_deref());
        if !mutate(&mut tokens) {
            unwatch(&mut *conn, method).await;
            return Ok(());
        }

        let value = match tokens.to_json() {
            Ok(value) => value,
            Err(err) => {
                unwatch(&mut *conn, method).await;
                tracing::error!(op = "cache.serialize.error", method, err = %err, "failed to serialize cache entry");
                return Err(err.into());
            }
        };

        match conn.multi_set(uid, &value).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::error!(op = "cache.watch.error", method, "cache entry changed during transaction");
                Err(CacheError::WriteConflict)
            }
            Err(err) => {
                unwatch(&mut *conn, method).await;
                tracing::error!(op = "cache.multi.error", method, err = %err, "cache transaction failed");
                Err(err)
            }
        }
    }

    async fn acquire(&self, method: &str) -> Result<CacheHandle, CacheError> {
        self.pool.acquire().await.inspect_err(|err| {
            tracing::error!(op = "cache.acquire.error", method, err = %err, "failed to acquire cache connection");
        })
    }
}

async fn unwatch(conn: &mut dyn CacheConnection, method: &str) {
    if let Err(err) = conn.unwatch().await {
        tracing::warn!(op = "cache.unwatch.error", method, err = %err, "cache unwatch failed");
    }
}

/// 空值或无法解析的条目都视为空映射
fn parse_tokens(uid: &str, raw: Option<&str>) -> AccountTokens {
    let Some(raw) = raw else {
        return AccountTokens::default();
    };
    AccountTokens::from_json(raw).unwrap_or_else(|err| {
        tracing::warn!(op = "cache.getAccount.unparseable", uid, err = %err, "discarding unparseable cache entry");
        AccountTokens::default()
    })
}
