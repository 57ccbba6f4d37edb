//! 会话存储门面
//!
//! 组合账户会话缓存与权威存储，调用方只通过这里读写会话和设备。
//! 破坏性写入总是先缓存后存储：缓存一步失败时不会改动存储。

pub mod display;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::models::{DeviceRecord, Location, TokenRecord};
use crate::cache::{AccountSessionCache, CachePool};
use crate::error::{AppError, StoreError};
use crate::store::{AuthServer, paths};
use crate::utils::now_ms;

pub use display::{DeviceView, LastAccessDisplay, SessionPolicy, SessionView};

/// 重置账户时写入存储的新凭据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResetData {
    pub verify_hash: String,
    pub auth_salt: String,
    pub wrap_wrap_kb: String,
    pub verifier_version: u32,
}

fn decode<T: DeserializeOwned + Default>(value: Value) -> Result<T, StoreError> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    cache: Option<AccountSessionCache>,
    store: Arc<dyn AuthServer>,
    policy: SessionPolicy,
}

impl SessionStore {
    /// `pool` 为 `None` 表示缓存被关闭，所有操作只访问权威存储
    pub fn new(pool: Option<CachePool>, store: Arc<dyn AuthServer>, policy: SessionPolicy) -> Self {
        Self {
            cache: pool.map(AccountSessionCache::new),
            store,
            policy,
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// 账户的全部会话令牌：存储结果按令牌 ID 合并缓存中的较新字段
    pub async fn account_tokens(&self, uid: &str) -> Result<Vec<TokenRecord>, AppError> {
        if uid.is_empty() {
            return Err(AppError::UnknownAccount);
        }

        let sessions_path = paths::sessions(uid);
        let stored = self.store.get(&sessions_path);
        let (stored, cached) = match &self.cache {
            Some(cache) => {
                let (stored, cached) = tokio::join!(stored, cache.get_account_tokens(uid, "sessions"));
                (stored, Some(cached))
            }
            None => (stored.await, None),
        };

        let mut records: Vec<TokenRecord> = decode(stored?)?;
        if let Some(cached) = cached {
            for record in &mut records {
                if let Some(newer) = cached.get(&record.id) {
                    record.merge_cached(newer);
                }
            }
        }
        Ok(records)
    }

    /// 对外展示的会话列表，过滤掉过期的无设备会话
    pub async fn sessions(&self, uid: &str) -> Result<Vec<SessionView>, AppError> {
        self.sessions_at(uid, now_ms()).await
    }

    pub(crate) async fn sessions_at(&self, uid: &str, now: i64) -> Result<Vec<SessionView>, AppError> {
        let lifetime = self.policy.token_without_device_ms;
        let records = self.account_tokens(uid).await?;
        Ok(records
            .into_iter()
            .filter(|record| !record.is_expired(lifetime, now))
            .map(|record| SessionView::new(record, &self.policy, now))
            .collect())
    }

    /// 账户的设备列表，按 sessionTokenId 合并缓存中的访问时间
    pub async fn devices(&self, uid: &str) -> Result<Vec<DeviceView>, AppError> {
        if uid.is_empty() {
            return Err(AppError::UnknownAccount);
        }

        let now = now_ms();
        let mut devices: Vec<DeviceRecord> = decode(self.store.get(&paths::devices(uid)).await?)?;
        if let Some(cache) = &self.cache {
            let cached = cache.get_account_tokens(uid, "devices").await;
            for device in &mut devices {
                let token = device
                    .session_token_id
                    .as_deref()
                    .and_then(|id| cached.get(id));
                if let Some(token) = token {
                    device.merge_cached(token);
                }
            }
        }
        Ok(devices
            .into_iter()
            .map(|device| DeviceView::new(device, &self.policy, now))
            .collect())
    }

    /// 读取单个会话令牌，不存在时返回 `None`
    pub async fn session_token(&self, id: &str) -> Result<Option<TokenRecord>, AppError> {
        let value = match self.store.get(&paths::session_token(id)).await {
            Ok(value) => value,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut record: TokenRecord = serde_json::from_value(value).map_err(StoreError::from)?;
        if let Some(cache) = &self.cache {
            let cached = cache.get_account_tokens(&record.uid, "sessionToken").await;
            if let Some(newer) = cached.get(&record.id) {
                record.merge_cached(newer);
            }
        }
        Ok(Some(record))
    }

    /// 新令牌只写入存储，缓存由第一次更新填充
    pub async fn create_session_token(&self, token: &TokenRecord) -> Result<(), AppError> {
        let body = serde_json::to_value(token).map_err(StoreError::from)?;
        self.store.post(&paths::session_token(&token.id), &body).await?;
        Ok(())
    }

    /// 更新令牌：先走缓存的乐观并发写入，成功后再写存储
    pub async fn update_token(
        &self,
        token: &TokenRecord,
        location: Option<Location>,
    ) -> Result<(), AppError> {
        let mut token = token.clone();
        if location.is_some() {
            token.location = location;
        }

        if let Some(cache) = &self.cache {
            cache.update_token(&token, "updateToken").await?;
        }

        let body = serde_json::to_value(&token).map_err(StoreError::from)?;
        let path = format!("{}/update", paths::session_token(&token.id));
        self.store.post(&path, &body).await?;
        Ok(())
    }

    /// 删除令牌：缓存中不存在该令牌时仍会删除存储记录
    pub async fn delete_token(&self, token: &TokenRecord) -> Result<(), AppError> {
        if let Some(cache) = &self.cache {
            cache.delete_token(&token.uid, &token.id, "deleteToken").await?;
        }
        self.store.del(&paths::session_token(&token.id)).await?;
        Ok(())
    }

    pub async fn delete_account(&self, uid: &str) -> Result<(), AppError> {
        if let Some(cache) = &self.cache {
            cache.delete_account(uid, "deleteAccount").await?;
        }
        self.store.del(&paths::account(uid)).await?;
        Ok(())
    }

    /// 重置账户会让所有旧令牌失效，缓存条目整体删除
    pub async fn reset_account(&self, uid: &str, data: &AccountResetData) -> Result<(), AppError> {
        if let Some(cache) = &self.cache {
            cache.delete_account(uid, "resetAccount").await?;
        }
        let body = serde_json::to_value(data).map_err(StoreError::from)?;
        self.store.post(&paths::reset(uid), &body).await?;
        Ok(())
    }

    /// 健康检查：存储可达，且启用缓存时能借出一个有效连接
    pub async fn ping(&self) -> Result<(), AppError> {
        self.store.get(paths::HEARTBEAT).await?;
        if let Some(cache) = &self.cache {
            let mut conn = cache.pool().acquire().await?;
            conn.is_valid().await?;
        }
        Ok(())
    }
}
