//! 进程内缓存后端，实现与 redis 相同的 WATCH/EXEC 语义，
//! 支持按操作注入故障并记录操作日志，供测试使用。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::connection::{CacheConnection, Connector};
use crate::cache::keys::account_tokens_key;
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Get,
    Set,
    Delete,
    Watch,
    MultiSet,
    Unwatch,
    IsValid,
    Destroy,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, String>,
    versions: HashMap<String, u64>,
    failures: HashSet<CacheOp>,
    failures_once: HashSet<CacheOp>,
    log: Vec<CacheOp>,
    connects: u32,
    refuse_connects: u32,
    destroyed: u32,
    /// 下一次 EXEC 之前由"另一个客户端"写入的值
    racing_write: Option<(String, String)>,
}

impl State {
    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

/// 共享的内存数据，可被多个连接同时访问
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, key_prefix: &str) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
            key_prefix: key_prefix.to_string(),
        }
    }

    /// 之后所有该类操作都返回错误
    pub fn fail(&self, op: CacheOp) {
        self.state.lock().failures.insert(op);
    }

    /// 只让下一次该类操作返回错误
    pub fn fail_once(&self, op: CacheOp) {
        self.state.lock().failures_once.insert(op);
    }

    pub fn recover(&self, op: CacheOp) {
        self.state.lock().failures.remove(&op);
    }

    /// 接下来的 n 次建立连接都会被拒绝
    pub fn refuse_connects(&self, n: u32) {
        self.state.lock().refuse_connects = n;
    }

    /// 在下一次 EXEC 前模拟另一个写入者修改该键
    pub fn race_next_exec(&self, key: &str, value: &str) {
        self.state.lock().racing_write = Some((key.to_string(), value.to_string()));
    }

    pub fn insert(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        state.entries.insert(key.to_string(), value.to_string());
        state.bump(key);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn ops(&self) -> Vec<CacheOp> {
        self.state.lock().log.clone()
    }

    pub fn count(&self, op: CacheOp) -> usize {
        self.state.lock().log.iter().filter(|o| **o == op).count()
    }

    pub fn clear_ops(&self) {
        self.state.lock().log.clear();
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn destroyed(&self) -> u32 {
        self.state.lock().destroyed
    }

    fn record(&self, op: CacheOp) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        state.log.push(op);
        if state.failures.contains(&op) || state.failures_once.remove(&op) {
            return Err(CacheError::Backend(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    key_prefix: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Box<dyn CacheConnection>, CacheError> {
        let mut state = self.backend.state.lock();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(CacheError::Backend("connection refused".to_string()));
        }
        Ok(Box::new(MemoryConnection {
            backend: self.backend.clone(),
            key_prefix: self.key_prefix.clone(),
            watched: Vec::new(),
            broken: false,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    backend: MemoryBackend,
    key_prefix: String,
    /// 与 redis 一样，多次 WATCH 会累积，直到 EXEC 或 UNWATCH
    watched: Vec<(String, u64)>,
    broken: bool,
}

impl MemoryConnection {
    fn key(&self, uid: &str) -> String {
        account_tokens_key(&self.key_prefix, uid)
    }
}

#[async_trait]
impl CacheConnection for MemoryConnection {
    async fn get(&mut self, uid: &str) -> Result<Option<String>, CacheError> {
        // 让出执行权，使并发事务能在 WATCH 与 EXEC 之间交错
        tokio::task::yield_now().await;
        self.backend.record(CacheOp::Get)?;
        let key = self.key(uid);
        Ok(self.backend.state.lock().entries.get(&key).cloned())
    }

    async fn set(&mut self, uid: &str, value: &str) -> Result<(), CacheError> {
        self.backend.record(CacheOp::Set)?;
        let key = self.key(uid);
        self.backend.insert(&key, value);
        Ok(())
    }

    async fn delete(&mut self, uid: &str) -> Result<(), CacheError> {
        self.backend.record(CacheOp::Delete)?;
        let key = self.key(uid);
        let mut state = self.backend.state.lock();
        if state.entries.remove(&key).is_some() {
            state.bump(&key);
        }
        Ok(())
    }

    async fn watch(&mut self, uid: &str) -> Result<(), CacheError> {
        self.backend.record(CacheOp::Watch)?;
        let key = self.key(uid);
        let version = self.backend.state.lock().version(&key);
        self.watched.push((key, version));
        Ok(())
    }

    async fn multi_set(&mut self, uid: &str, value: &str) -> Result<bool, CacheError> {
        let watched = std::mem::take(&mut self.watched);
        self.backend.record(CacheOp::MultiSet)?;
        let key = self.key(uid);
        let mut state = self.backend.state.lock();
        if let Some((racing_key, racing_value)) = state.racing_write.take() {
            state.entries.insert(racing_key.clone(), racing_value);
            state.bump(&racing_key);
        }
        if watched
            .iter()
            .any(|(watched_key, version)| state.version(watched_key) != *version)
        {
            return Ok(false);
        }
        state.entries.insert(key.clone(), value.to_string());
        state.bump(&key);
        Ok(true)
    }

    async fn unwatch(&mut self) -> Result<(), CacheError> {
        self.backend.record(CacheOp::Unwatch)?;
        self.watched.clear();
        Ok(())
    }

    async fn is_valid(&mut self) -> Result<(), CacheError> {
        if self.broken {
            return Err(CacheError::Backend("connection marked broken".to_string()));
        }
        self.backend.record(CacheOp::IsValid)
    }

    fn has_broken(&self) -> bool {
        self.broken || !self.watched.is_empty()
    }

    async fn destroy(&mut self) -> Result<(), CacheError> {
        self.broken = true;
        self.backend.record(CacheOp::Destroy)?;
        self.backend.state.lock().destroyed += 1;
        Ok(())
    }
}
