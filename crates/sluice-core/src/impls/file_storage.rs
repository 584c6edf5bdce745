//! FileStorage - キーごとに 1 ファイルの StorageSink
//!
//! # 実装詳細
//! - `<root>/<blake3(key) の hex>.json` に record の canonical JSON を置く
//! - 一時ファイルに書いて fsync してから rename（途中まで書かれたファイルを残さない）
//! - 同じ key への保存は rename で置き換わる（last-write-wins）
//!
//! ファイル名は key のダイジェストなので、advertiser_id にパス区切りが入っても
//! 長くても root の外に出たり NAME_MAX を超えたりしない。key 自体は record の中にある。

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::disk;
use crate::domain::{EventRecord, StorageError};
use crate::ports::StorageSink;

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", disk::file_stem(key)))
    }

    /// 保存済みの record を読む（無ければ None）
    pub async fn load(&self, key: &str) -> Result<Option<EventRecord>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => EventRecord::from_bytes(&bytes)
                .map(Some)
                .map_err(|e| StorageError::rejected(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::unavailable(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl StorageSink for FileStorage {
    async fn save(&self, key: &str, record: &EventRecord) -> Result<(), StorageError> {
        let bytes = record
            .to_canonical_bytes()
            .map_err(|e| StorageError::rejected(format!("encode record: {e}")))?;

        let path = self.path_for(key);
        disk::write_atomic(&path, &bytes)
            .await
            .map_err(|e| StorageError::unavailable(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventCandidate, StorageErrorKind};
    use serde_json::json;
    use tempfile::tempdir;

    fn record(advertiser_id: &str, clicks: u64) -> EventRecord {
        serde_json::from_value::<EventCandidate>(json!({
            "ip_address": "192.168.1.1",
            "user_agent": "Mozilla/5.0",
            "referring_url": "http://example.com",
            "advertiser_id": advertiser_id,
            "metadata": { "clicks": clicks }
        }))
        .unwrap()
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("records"));

        let r = record("123456", 120);
        storage.save(r.storage_key(), &r).await.unwrap();

        assert_eq!(storage.load("123456").await.unwrap(), Some(r));
        assert_eq!(storage.load("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn replayed_save_leaves_single_file_with_latest_record() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.save("123456", &record("123456", 1)).await.unwrap();
        storage.save("123456", &record("123456", 2)).await.unwrap();
        storage.save("123456", &record("123456", 2)).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let loaded = storage.load("123456").await.unwrap().unwrap();
        assert_eq!(loaded.metadata()["clicks"], json!(2));
    }

    #[tokio::test]
    async fn key_with_path_separators_stays_under_root() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("records"));

        storage
            .save("../escape", &record("../escape", 1))
            .await
            .unwrap();

        assert!(!dir.path().join("escape").exists());
        let names: Vec<_> = std::fs::read_dir(dir.path().join("records"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.json", disk::file_stem("../escape"))]);
        assert_eq!(
            storage.load("../escape").await.unwrap().unwrap().advertiser_id(),
            "../escape"
        );
    }

    #[tokio::test]
    async fn long_advertiser_id_is_persisted() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let key = "a".repeat(400);

        storage.save(&key, &record(&key, 7)).await.unwrap();

        let loaded = storage.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.advertiser_id(), key);
        assert_eq!(loaded.metadata()["clicks"], json!(7));
    }

    #[tokio::test]
    async fn unwritable_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let storage = FileStorage::new(blocker.join("records"));
        let err = storage.save("k", &record("k", 1)).await.unwrap_err();
        assert_eq!(err.kind, StorageErrorKind::Unavailable);
    }
}
