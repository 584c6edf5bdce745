//! Errors - パイプラインのエラー分類
//!
//! # 分類
//! - **ValidationError**: クライアント起因。パイプラインに入る前に拒否（リトライしない）
//! - **PublishError**: submit 時に log へ書けない。呼び出し元へ server fault として返す
//! - **DecodeError**: log から読んだ payload が壊れている。ログに残して捨てる（dead-letter しない）
//! - **StorageError**: 永続化の失敗。dead-letter を発動する唯一のエラー
//! - **DeadLetterError**: dead-letter への書き込み失敗。ログのみ（二段目の退避先はない）

use std::fmt;

use thiserror::Error;

/// ValidationError が指す検証ルール
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    /// フィールドが欠けている、または空文字列
    Required,
    /// ドット区切りの IPv4 アドレスではない
    Ipv4,
    /// 階層を持つ絶対 URL ではない（`mailto:` のような opaque URL も不可）
    Url,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::Required => "required",
            ValidationRule::Ipv4 => "ipv4",
            ValidationRule::Url => "url",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// フィールド単位の検証エラー
///
/// `field` は JSON 上の名前（`ip_address` など）。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field '{field}' failed on the '{rule}' rule")]
pub struct ValidationError {
    pub field: &'static str,
    pub rule: ValidationRule,
}

impl ValidationError {
    pub fn new(field: &'static str, rule: ValidationRule) -> Self {
        Self { field, rule }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("durable log unavailable: {0}")]
    Unavailable(String),

    #[error("durable log rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
#[error("payload decode failed: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// StorageError の種別タグ
///
/// ConsumerLoop はこのタグで分岐しない（どの種別でも dead-letter）。
/// ログと将来の細分化のためだけに持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Unavailable,
    Timeout,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage error (kind: {kind:?}): {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Rejected, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadLetterError {
    #[error("dead-letter publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Subscription 側（fetch / commit）のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("commit failed: {0}")]
    Commit(String),

    /// 永続化された log の読み込み・書き込みに失敗
    #[error("log storage failed: {0}")]
    Storage(String),
}
