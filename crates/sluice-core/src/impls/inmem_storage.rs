//! InMemoryStorage - テスト用の StorageSink
//!
//! `set_failing(true)` でストレージ障害を再現できる。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EventRecord, StorageError};
use crate::ports::StorageSink;

/// InMemoryStorage は key → EventRecord の HashMap
///
/// # 実装詳細
/// - last-write-wins（insert で上書き）
/// - `save_calls()` で呼び出し回数を数える（失敗した呼び出しも含む）
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    records: Arc<Mutex<HashMap<String, EventRecord>>>,
    failing: Arc<AtomicBool>,
    save_calls: Arc<AtomicUsize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// true の間は save が `StorageErrorKind::Unavailable` で失敗する
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, key: &str) -> Option<EventRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl StorageSink for InMemoryStorage {
    async fn save(&self, key: &str, record: &EventRecord) -> Result<(), StorageError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("in-memory storage is marked failing"));
        }
        self.records
            .lock()
            .await
            .insert(key.to_string(), record.clone());
        Ok(())
    }
}
