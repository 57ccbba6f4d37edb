use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use account_sessions::{
    AppState,
    cache::CachePool,
    config::Config,
    routes,
    sessions::{SessionPolicy, SessionStore},
    store::HttpAuthServer,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    // 缓存关闭时没有连接池，所有请求直接访问权威存储
    let pool = CachePool::from_config(&config.cache).expect("Invalid cache configuration");
    let store = HttpAuthServer::new(&config.store_url).expect("Invalid STORE_URL");

    let sessions = SessionStore::new(
        pool.clone(),
        Arc::new(store),
        SessionPolicy::from_config(&config),
    );

    let state = AppState {
        config: config.clone(),
        sessions,
    };

    let app = routes::heartbeat::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!(
        cache_enabled = pool.is_some(),
        "Server listening on {}",
        addr
    );
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app,
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .expect("Failed to start server");

    // 服务停止后关闭缓存连接池
    if let Some(pool) = pool {
        pool.close();
    }
}
