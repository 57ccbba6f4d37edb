/// 缓存操作
/// 账户会话缓存的读写协议
pub mod session;

pub use session::AccountSessionCache;
