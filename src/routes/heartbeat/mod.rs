use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{AppState, error::AppError, result::ApiResult};

/// 心跳响应
#[derive(Debug, Serialize)]
pub struct HeartbeatStatus {
    /// 权威存储状态
    pub store: &'static str,
    /// 缓存状态，关闭时为 "disabled"
    pub cache: &'static str,
    /// 服务器时间
    pub timestamp: i64,
}

/// 负载均衡探活，不检查任何依赖
pub async fn lb_heartbeat() -> Json<Value> {
    Json(json!({}))
}

/// 检查权威存储与缓存连接
pub async fn heartbeat(
    State(state): State<AppState>,
) -> Result<Json<ApiResult<HeartbeatStatus>>, AppError> {
    if let Err(err) = state.sessions.ping().await {
        tracing::warn!(err = %err, "Heartbeat failed");
        return Err(err);
    }

    Ok(Json(ApiResult::success(HeartbeatStatus {
        store: "ok",
        cache: if state.sessions.cache_enabled() {
            "ok"
        } else {
            "disabled"
        },
        timestamp: chrono::Utc::now().timestamp(),
    })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/__lbheartbeat__", get(lb_heartbeat))
        .route("/__heartbeat__", get(heartbeat))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::{CacheConfig, Config};
    use crate::sessions::{SessionPolicy, SessionStore};
    use crate::store::HttpAuthServer;

    fn state(store_url: &str) -> AppState {
        let config = Config {
            server_host: "127.0.0.1".into(),
            server_port: 0,
            store_url: store_url.to_string(),
            cache: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            session_token_without_device_ms: 2_419_200_000,
            earliest_sane_timestamp: 1_507_081_020_000,
        };
        let store = Arc::new(HttpAuthServer::new(store_url).unwrap());
        let sessions = SessionStore::new(None, store, SessionPolicy::from_config(&config));
        AppState { config, sessions }
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 4096).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn reports_healthy_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__heartbeat__"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let app = router().with_state(state(&server.uri()));
        let (status, body) = call(app, "/__heartbeat__").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"]["store"], json!("ok"));
        assert_eq!(body["content"]["cache"], json!("disabled"));
    }

    #[tokio::test]
    async fn reports_failing_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let app = router().with_state(state(&server.uri()));
        let (status, body) = call(app, "/__heartbeat__").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errno"], json!(999));
    }

    #[tokio::test]
    async fn lb_heartbeat_needs_no_dependencies() {
        let app = router().with_state(state("http://127.0.0.1:1"));
        let (status, body) = call(app, "/__lbheartbeat__").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }
}
