//! StorageSink port - キー単位の永続化
//!
//! # 実装
//! - **InMemoryStorage**: テスト用
//! - **FileStorage**: キーごとに 1 ファイル（本番バイナリで使用）

use async_trait::async_trait;

use crate::domain::{EventRecord, StorageError};

/// StorageSink は EventRecord を key で保存する
///
/// # 設計原則
/// - last-write-wins（同じ key・同じ record の二重保存は 1 回と区別できない）
/// - dead-letter からの replay で同じ record が再度来ても壊れないこと
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn save(&self, key: &str, record: &EventRecord) -> Result<(), StorageError>;
}
