//! EventRecord - パイプラインを流れる最小単位
//!
//! # ライフサイクル
//! 1. Gateway がリクエストを `EventCandidate` に decode
//! 2. `EventCandidate::validate()` で一度だけ検証 → `EventRecord`
//! 3. ProducerService が canonical bytes にして log へ publish
//! 4. ConsumerLoop が `EventRecord::from_bytes()` で復元して保存
//!
//! 検証後の `EventRecord` は不変（フィールドは読み取り専用）。

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use super::errors::{DecodeError, ValidationError, ValidationRule};

/// 検証済みのイベント
///
/// # Canonical encoding
/// - フィールド順は struct の宣言順で固定
/// - metadata は BTreeMap なのでキーはソート済み
///
/// 同じ論理レコードは常に同じ bytes になる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    ip_address: String,
    user_agent: String,
    referring_url: String,
    advertiser_id: String,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl EventRecord {
    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn referring_url(&self) -> &str {
        &self.referring_url
    }

    pub fn advertiser_id(&self) -> &str {
        &self.advertiser_id
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// ストレージ上のキー（advertiser_id、last-write-wins）
    pub fn storage_key(&self) -> &str {
        &self.advertiser_id
    }

    pub fn to_canonical_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Gateway が decode した未検証の入力
///
/// 全フィールドを Option にしているので、欠けたフィールドは decode エラーではなく
/// `required` ルールの検証エラーとして報告できる。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventCandidate {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referring_url: Option<String>,
    pub advertiser_id: Option<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl EventCandidate {
    /// フィールドを宣言順に検証し、最初の失敗で止まる
    pub fn validate(self) -> Result<EventRecord, ValidationError> {
        let ip_address = required("ip_address", self.ip_address)?;
        if !is_ipv4(&ip_address) {
            return Err(ValidationError::new("ip_address", ValidationRule::Ipv4));
        }

        let user_agent = required("user_agent", self.user_agent)?;

        let referring_url = required("referring_url", self.referring_url)?;
        if !is_hierarchical_url(&referring_url) {
            return Err(ValidationError::new("referring_url", ValidationRule::Url));
        }

        let advertiser_id = required("advertiser_id", self.advertiser_id)?;

        let metadata = self
            .metadata
            .ok_or_else(|| ValidationError::new("metadata", ValidationRule::Required))?;

        Ok(EventRecord {
            ip_address,
            user_agent,
            referring_url,
            advertiser_id,
            metadata,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::new(field, ValidationRule::Required)),
    }
}

fn is_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// `scheme://...` 形式の URL だけを通す。`file` 以外は host も必須
fn is_hierarchical_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(url) if url.cannot_be_a_base() => false,
        Ok(url) => url.scheme() == "file" || url.host().is_some(),
        Err(_) => false,
    }
}
