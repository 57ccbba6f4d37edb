use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::session::{Location, TokenRecord, UserAgent};

/// 存储返回的设备记录，通过 sessionTokenId 关联缓存中的会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_endpoint_expired: Option<bool>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub available_commands: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<i64>,
    #[serde(flatten)]
    pub user_agent: UserAgent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl DeviceRecord {
    /// 用缓存中对应会话的访问时间、UA 和位置补充设备记录
    pub fn merge_cached(&mut self, cached: &TokenRecord) {
        self.last_access_time = Some(
            self.last_access_time
                .map_or(cached.last_access_time, |t| t.max(cached.last_access_time)),
        );
        self.user_agent.overlay(&cached.user_agent);
        if cached.location.is_some() {
            self.location.clone_from(&cached.location);
        }
    }
}
