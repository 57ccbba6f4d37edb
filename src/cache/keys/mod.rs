/// 缓存键模块
/// 每个账户只对应一个缓存键

/// 生成账户令牌缓存键：`<prefix><uid>`
pub fn account_tokens_key(prefix: &str, uid: &str) -> String {
    format!("{}{}", prefix, uid)
}
