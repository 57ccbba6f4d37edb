//! 权威存储客户端
//!
//! 权威存储是一个按路径提供 get/post/del 的 HTTP 服务，这里只负责调用，
//! 不关心其持久化实现。

use std::fmt;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use url::Url;

use crate::error::StoreError;

/// 权威存储的资源路径
pub mod paths {
    pub fn account(uid: &str) -> String {
        format!("/account/{}", uid)
    }

    pub fn sessions(uid: &str) -> String {
        format!("/account/{}/sessions", uid)
    }

    pub fn devices(uid: &str) -> String {
        format!("/account/{}/devices", uid)
    }

    pub fn reset(uid: &str) -> String {
        format!("/account/{}/reset", uid)
    }

    pub fn session_token(id: &str) -> String {
        format!("/sessionToken/{}", id)
    }

    pub const HEARTBEAT: &str = "/__heartbeat__";
}

#[async_trait]
pub trait AuthServer: Send + Sync + fmt::Debug {
    async fn get(&self, path: &str) -> Result<Value, StoreError>;

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError>;

    async fn del(&self, path: &str) -> Result<(), StoreError>;
}

/// 基于 reqwest 的权威存储客户端
#[derive(Debug, Clone)]
pub struct HttpAuthServer {
    client: reqwest::Client,
    base: Url,
}

impl HttpAuthServer {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, StoreError> {
        // join 需要以 / 结尾的基础地址，否则最后一段路径会被替换
        let base = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Value, StoreError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(op = "store.error", path, status = status.as_u16(), "store request failed");
            return Err(StoreError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl AuthServer for HttpAuthServer {
    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let url = self.url(path)?;
        self.send(self.client.get(url), path).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let url = self.url(path)?;
        self.send(self.client.post(url).json(body), path).await
    }

    async fn del(&self, path: &str) -> Result<(), StoreError> {
        let url = self.url(path)?;
        self.send(self.client.delete(url), path).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/abc/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "tokenId": "foo" }])))
            .mount(&server)
            .await;

        let store = HttpAuthServer::new(&server.uri()).unwrap();
        let value = store.get(&paths::sessions("abc")).await.unwrap();
        assert_eq!(value, json!([{ "tokenId": "foo" }]));
    }

    #[tokio::test]
    async fn base_path_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sessionToken/foo"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpAuthServer::new(&format!("{}/v1", server.uri())).unwrap();
        store.del(&paths::session_token("foo")).await.unwrap();
    }

    #[tokio::test]
    async fn post_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/account/abc/reset"))
            .and(body_json(json!({ "verifyHash": "aa" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpAuthServer::new(&server.uri()).unwrap();
        let value = store
            .post(&paths::reset("abc"), &json!({ "verifyHash": "aa" }))
            .await
            .unwrap();
        assert_eq!(value, json!({}));
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = HttpAuthServer::new(&server.uri()).unwrap();
        let err = store.get(&paths::session_token("foo")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(p) if p == "/sessionToken/foo"));
    }

    #[tokio::test]
    async fn server_errors_keep_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = HttpAuthServer::new(&server.uri()).unwrap();
        match store.get(&paths::account("abc")).await.unwrap_err() {
            StoreError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
