use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 缓存层错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("timed out waiting for a cache connection")]
    AcquireTimeout,

    #[error("too many pending cache connection requests")]
    PoolExhausted,

    #[error("cache pool is closed")]
    PoolClosed,

    #[error("failed to connect to cache after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: Box<CacheError>,
    },

    /// WATCH 被并发写入打断，EXEC 返回空结果
    #[error("unspecified error")]
    WriteConflict,

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<bb8::RunError<CacheError>> for CacheError {
    fn from(err: bb8::RunError<CacheError>) -> Self {
        match err {
            bb8::RunError::User(e) => e,
            bb8::RunError::TimedOut => CacheError::AcquireTimeout,
        }
    }
}

/// 权威存储调用错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store resource not found: {0}")]
    NotFound(String),

    #[error("store returned {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("invalid store record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unknown account")]
    UnknownAccount,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppError {
    pub fn errno(&self) -> i32 {
        match self {
            AppError::UnknownAccount => 102,
            AppError::Store(StoreError::NotFound(_)) => 102,
            _ => 999,
        }
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(self, AppError::Cache(CacheError::WriteConflict))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    errno: i32,
    error_message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::UnknownAccount => (StatusCode::BAD_REQUEST, "未知账户".to_string()),
            AppError::Store(StoreError::NotFound(_)) => {
                (StatusCode::BAD_REQUEST, "未知账户".to_string())
            }
            AppError::Cache(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "缓存服务不可用".to_string(),
            ),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "存储服务不可用".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            code: status.as_u16() as i32,
            errno: self.errno(),
            error_message,
        });

        (status, body).into_response()
    }
}
