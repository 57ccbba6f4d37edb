/// 缓存数据模型
/// 账户缓存条目及其中的令牌记录
pub mod device;
pub mod session;

pub use device::DeviceRecord;
pub use session::*;
