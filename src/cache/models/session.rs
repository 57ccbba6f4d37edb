use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 用户代理信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_browser_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua_form_factor: Option<String>,
}

impl UserAgent {
    /// 用 other 中已有的字段覆盖当前值
    pub fn overlay(&mut self, other: &UserAgent) {
        fn take(dst: &mut Option<String>, src: &Option<String>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        take(&mut self.ua_browser, &other.ua_browser);
        take(&mut self.ua_browser_version, &other.ua_browser_version);
        take(&mut self.ua_os, &other.ua_os);
        take(&mut self.ua_os_version, &other.ua_os_version);
        take(&mut self.ua_device_type, &other.ua_device_type);
        take(&mut self.ua_form_factor, &other.ua_form_factor);
    }
}

/// 最近一次访问的地理位置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_code: Option<String>,
}

/// 绑定到设备的会话附带的设备信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_callback_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_callback_auth_key: Option<String>,
    #[serde(default)]
    pub device_callback_is_expired: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_available_commands: BTreeMap<String, String>,
}

/// 令牌类型：构造时根据是否携带设备 ID 决定
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    BareSession,
    DeviceSession(DeviceInfo),
}

/// 会话/设备令牌记录，缓存与存储之间的线上格式为扁平的 camelCase JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTokenRecord", into = "RawTokenRecord")]
pub struct TokenRecord {
    pub id: String,
    pub uid: String,
    pub kind: TokenKind,
    pub created_at: i64,
    pub last_access_time: i64,
    pub user_agent: UserAgent,
    pub location: Option<Location>,
    /// 未识别的字段，原样保留
    pub extra: Map<String, Value>,
}

impl TokenRecord {
    pub fn bare(id: impl Into<String>, uid: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            uid: uid.into(),
            kind: TokenKind::BareSession,
            created_at,
            last_access_time: created_at,
            user_agent: UserAgent::default(),
            location: None,
            extra: Map::new(),
        }
    }

    pub fn is_bare(&self) -> bool {
        matches!(self.kind, TokenKind::BareSession)
    }

    /// 无设备会话在 `now - createdAt > lifetime` 时过期；lifetime 为 0 表示永不过期
    pub fn is_expired(&self, lifetime_ms: u64, now: i64) -> bool {
        if lifetime_ms == 0 || !self.is_bare() {
            return false;
        }
        i128::from(now) - i128::from(self.created_at) > i128::from(lifetime_ms)
    }

    /// 合并缓存中的较新数据：访问时间取较大值，缓存中存在的 UA 与位置覆盖存储值
    pub fn merge_cached(&mut self, cached: &TokenRecord) {
        self.last_access_time = self.last_access_time.max(cached.last_access_time);
        self.user_agent.overlay(&cached.user_agent);
        if cached.location.is_some() {
            self.location.clone_from(&cached.location);
        }
        for (key, value) in &cached.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenRecord {
    #[serde(rename = "tokenId", alias = "id")]
    id: String,
    uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_callback_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_callback_auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_callback_is_expired: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_available_commands: Option<BTreeMap<String, String>>,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    last_access_time: i64,
    #[serde(flatten)]
    user_agent: UserAgent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<Location>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<RawTokenRecord> for TokenRecord {
    fn from(raw: RawTokenRecord) -> Self {
        let kind = match raw.device_id {
            Some(device_id) => TokenKind::DeviceSession(DeviceInfo {
                device_id,
                device_name: raw.device_name,
                device_type: raw.device_type,
                device_callback_url: raw.device_callback_url,
                device_callback_public_key: raw.device_callback_public_key,
                device_callback_auth_key: raw.device_callback_auth_key,
                device_callback_is_expired: raw.device_callback_is_expired.unwrap_or(false),
                device_available_commands: raw.device_available_commands.unwrap_or_default(),
            }),
            None => TokenKind::BareSession,
        };
        Self {
            id: raw.id,
            uid: raw.uid,
            kind,
            created_at: raw.created_at,
            last_access_time: raw.last_access_time,
            user_agent: raw.user_agent,
            location: raw.location,
            extra: raw.extra,
        }
    }
}

impl From<TokenRecord> for RawTokenRecord {
    fn from(record: TokenRecord) -> Self {
        let mut raw = RawTokenRecord {
            id: record.id,
            uid: record.uid,
            device_id: None,
            device_name: None,
            device_type: None,
            device_callback_url: None,
            device_callback_public_key: None,
            device_callback_auth_key: None,
            device_callback_is_expired: None,
            device_available_commands: None,
            created_at: record.created_at,
            last_access_time: record.last_access_time,
            user_agent: record.user_agent,
            location: record.location,
            extra: record.extra,
        };
        if let TokenKind::DeviceSession(device) = record.kind {
            raw.device_id = Some(device.device_id);
            raw.device_name = device.device_name;
            raw.device_type = device.device_type;
            raw.device_callback_url = device.device_callback_url;
            raw.device_callback_public_key = device.device_callback_public_key;
            raw.device_callback_auth_key = device.device_callback_auth_key;
            raw.device_callback_is_expired = Some(device.device_callback_is_expired);
            if !device.device_available_commands.is_empty() {
                raw.device_available_commands = Some(device.device_available_commands);
            }
        }
        raw
    }
}

/// 账户缓存条目：令牌 ID 到令牌记录的映射，整体序列化为一个值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountTokens(BTreeMap<String, TokenRecord>);

impl AccountTokens {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn get(&self, token_id: &str) -> Option<&TokenRecord> {
        self.0.get(token_id)
    }

    pub fn insert(&mut self, record: TokenRecord) -> Option<TokenRecord> {
        self.0.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, token_id: &str) -> Option<TokenRecord> {
        self.0.remove(token_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_id_decides_the_kind() {
        let bare: TokenRecord = serde_json::from_value(json!({
            "tokenId": "foo",
            "uid": "abc",
            "createdAt": 1,
            "lastAccessTime": 2,
            "deviceId": null,
        }))
        .unwrap();
        assert!(bare.is_bare());

        let device: TokenRecord = serde_json::from_value(json!({
            "id": "bar",
            "uid": "abc",
            "createdAt": 1,
            "lastAccessTime": 2,
            "deviceId": "d1",
            "deviceName": "phone",
            "deviceAvailableCommands": { "https://identity.mozilla.com/cmd/open-uri": "keys" },
        }))
        .unwrap();
        assert_eq!(device.id, "bar");
        match &device.kind {
            TokenKind::DeviceSession(info) => {
                assert_eq!(info.device_id, "d1");
                assert_eq!(info.device_name.as_deref(), Some("phone"));
                assert_eq!(info.device_available_commands.len(), 1);
            }
            TokenKind::BareSession => panic!("expected device session"),
        }
    }

    #[test]
    fn unknown_fields_survive_serialization() {
        let input = json!({
            "tokenId": "foo",
            "uid": "abc",
            "createdAt": 10,
            "lastAccessTime": 20,
            "uaBrowser": "Firefox",
            "mustVerify": true,
            "tokenVerificationId": "tv",
        });
        let record: TokenRecord = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(record.user_agent.ua_browser.as_deref(), Some("Firefox"));
        assert_eq!(record.extra.get("mustVerify"), Some(&json!(true)));
        assert!(!record.extra.contains_key("uaBrowser"));
        assert_eq!(serde_json::to_value(&record).unwrap(), input);
    }

    #[test]
    fn bare_session_expiry_is_strict() {
        let record = TokenRecord::bare("foo", "abc", 1_000);
        assert!(!record.is_expired(500, 1_500));
        assert!(record.is_expired(500, 1_501));
        assert!(!record.is_expired(0, i64::MAX));
    }

    #[test]
    fn device_sessions_never_expire() {
        let mut record = TokenRecord::bare("foo", "abc", 0);
        record.kind = TokenKind::DeviceSession(DeviceInfo {
            device_id: "d1".into(),
            ..DeviceInfo::default()
        });
        assert!(!record.is_expired(1, 1_000_000));
    }

    #[test]
    fn merge_prefers_newer_access_and_cached_agent() {
        let mut stored = TokenRecord::bare("foo", "abc", 100);
        stored.last_access_time = 500;
        stored.user_agent.ua_os = Some("Linux".into());

        let mut cached = TokenRecord::bare("foo", "abc", 100);
        cached.last_access_time = 900;
        cached.user_agent.ua_browser = Some("Firefox".into());
        cached.location = Some(Location {
            country: Some("Germany".into()),
            ..Location::default()
        });

        stored.merge_cached(&cached);
        assert_eq!(stored.last_access_time, 900);
        assert_eq!(stored.user_agent.ua_browser.as_deref(), Some("Firefox"));
        assert_eq!(stored.user_agent.ua_os.as_deref(), Some("Linux"));
        assert_eq!(
            stored.location.and_then(|l| l.country).as_deref(),
            Some("Germany")
        );
    }

    #[test]
    fn account_tokens_are_keyed_by_token_id() {
        let mut tokens = AccountTokens::default();
        tokens.insert(TokenRecord::bare("foo", "abc", 1));
        tokens.insert(TokenRecord::bare("bar", "abc", 2));
        let json = tokens.to_json().unwrap();
        let parsed = AccountTokens::from_json(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("bar").map(|r| r.created_at), Some(2));
    }
}
