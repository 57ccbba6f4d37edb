// 缓存模块
// 包含连接、连接池、缓存数据结构和读写协议

pub mod connection;
pub mod keys;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod models;
pub mod operations;
pub mod pool;

// 重新导出常用类型，方便其他模块使用
pub use connection::{CacheConnection, Connector, RedisConnector};
pub use models::{AccountTokens, DeviceRecord, TokenKind, TokenRecord};
pub use operations::AccountSessionCache;
pub use pool::{CacheHandle, CachePool};
