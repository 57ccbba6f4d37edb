use serde::Serialize;

use crate::cache::models::{DeviceInfo, DeviceRecord, Location, TokenKind, TokenRecord, UserAgent};
use crate::config::Config;
use crate::utils::format_relative;

/// 会话过期与展示策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// 无设备会话的存活时间（毫秒），0 表示永不过期
    pub token_without_device_ms: u64,
    pub earliest_sane_timestamp: i64,
}

impl SessionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_without_device_ms: config.session_token_without_device_ms,
            earliest_sane_timestamp: config.earliest_sane_timestamp,
        }
    }
}

/// 最后访问时间的展示字段
///
/// 早于可信下限的访问时间只给出近似值（即下限本身），真实值保持不变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAccessDisplay {
    pub last_access_time_formatted: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approximate_last_access_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approximate_last_access_time_formatted: Option<String>,
}

impl LastAccessDisplay {
    pub fn new(last_access_time: i64, earliest_sane_timestamp: i64, now: i64) -> Self {
        let approximate = (last_access_time < earliest_sane_timestamp).then_some(earliest_sane_timestamp);
        Self {
            last_access_time_formatted: format_relative(last_access_time, now),
            approximate_last_access_time: approximate,
            approximate_last_access_time_formatted: approximate.map(|t| format_relative(t, now)),
        }
    }
}

/// 返回给调用方的会话，令牌 ID 规范化为 `id`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub uid: String,
    pub is_device: bool,
    #[serde(flatten)]
    pub device: Option<DeviceInfo>,
    pub created_at: i64,
    pub last_access_time: i64,
    #[serde(flatten)]
    pub user_agent: UserAgent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(flatten)]
    pub last_access: LastAccessDisplay,
}

impl SessionView {
    pub fn new(record: TokenRecord, policy: &SessionPolicy, now: i64) -> Self {
        let last_access =
            LastAccessDisplay::new(record.last_access_time, policy.earliest_sane_timestamp, now);
        let device = match record.kind {
            TokenKind::DeviceSession(device) => Some(device),
            TokenKind::BareSession => None,
        };
        Self {
            id: record.id,
            uid: record.uid,
            is_device: device.is_some(),
            device,
            created_at: record.created_at,
            last_access_time: record.last_access_time,
            user_agent: record.user_agent,
            location: record.location,
            last_access,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: DeviceRecord,
    #[serde(flatten)]
    pub last_access: Option<LastAccessDisplay>,
}

impl DeviceView {
    pub fn new(device: DeviceRecord, policy: &SessionPolicy, now: i64) -> Self {
        let last_access = device
            .last_access_time
            .map(|t| LastAccessDisplay::new(t, policy.earliest_sane_timestamp, now));
        Self {
            device,
            last_access,
        }
    }
}
