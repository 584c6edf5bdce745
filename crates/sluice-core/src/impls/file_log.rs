//! FileDurableLog - ディスクに追記する durable log
//!
//! # ディレクトリ構成
//! ```text
//! <root>/<stem(topic)>/<base offset 20 桁>.seg     追記専用のセグメント
//! <root>/<stem(topic)>/offsets/<stem(group)>.json  group の watermark
//! ```
//!
//! # 実装詳細
//! - publish は frame を書いて fsync してから ack を返す
//! - commit は group の watermark を一時ファイル + rename で保存する
//! - 配送・cursor・trim は内側の `InMemoryDurableLog` に任せる
//! - 全 group が読み終えたセグメントはファイルごと消す（書き込み中のセグメントは残す）
//! - topic は最初に publish / subscribe された時にディスクから読み戻す
//!
//! # セグメントの形式
//! ```text
//! [magic "SLG1"][frame][frame]...
//! frame = [body_len: u32 LE][key_len: u32 LE (u32::MAX = key なし)][key][payload]
//! ```
//! 書き込み途中で落ちた末尾の frame は、次に開いた時に切り詰める。

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::disk;
use super::inmem_log::{InMemoryDurableLog, StoredMessage};
use crate::domain::{LogError, PublishAck, PublishError, Topic, TransportMessage};
use crate::ports::{DurableLog, Subscription};

const SEGMENT_MAGIC: &[u8; 4] = b"SLG1";
const SEGMENT_EXT: &str = "seg";
const NO_KEY: u32 = u32::MAX;

/// 1 セグメントに入れるメッセージ数の既定値
pub const DEFAULT_SEGMENT_MESSAGES: u64 = 1024;

/// offsets/ に置く group の進捗
#[derive(Debug, Serialize, Deserialize)]
struct GroupOffset {
    group: String,
    next_offset: u64,
}

struct ActiveSegment {
    base: u64,
    count: u64,
    /// 正しく書けたところまでのバイト数
    len: u64,
    file: tokio::fs::File,
}

struct TopicFiles {
    dir: PathBuf,
    /// 書き込みを終えたセグメントの base（古い順）
    sealed: Vec<u64>,
    active: ActiveSegment,
}

struct Disk {
    root: PathBuf,
    segment_messages: u64,
    topics: HashMap<Topic, TopicFiles>,
}

/// FileDurableLog は再起動をまたいで残る durable log
///
/// # 使用例
/// ```ignore
/// let log = FileDurableLog::open("./data/log").await?;
/// log.publish(&topic, None, payload).await?;
/// ```
#[derive(Clone)]
pub struct FileDurableLog {
    memory: InMemoryDurableLog,
    disk: Arc<Mutex<Disk>>,
}

impl FileDurableLog {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::open_with_segment_messages(root, DEFAULT_SEGMENT_MESSAGES).await
    }

    pub async fn open_with_segment_messages(
        root: impl Into<PathBuf>,
        segment_messages: u64,
    ) -> Result<Self, LogError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;

        Ok(Self {
            memory: InMemoryDurableLog::new(),
            disk: Arc::new(Mutex::new(Disk {
                root,
                segment_messages: segment_messages.max(1),
                topics: HashMap::new(),
            })),
        })
    }

    /// topic に残っているメッセージ（未読み込みならディスクから読む）
    pub async fn messages(&self, topic: &Topic) -> Result<Vec<TransportMessage>, LogError> {
        let mut disk = self.disk.lock().await;
        disk.topic(topic, &self.memory).await?;
        Ok(self.memory.messages(topic).await)
    }

    pub async fn committed_offset(&self, topic: &Topic, group: &str) -> Option<u64> {
        self.memory.committed_offset(topic, group).await
    }
}

#[async_trait]
impl DurableLog for FileDurableLog {
    async fn publish(
        &self,
        topic: &Topic,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<PublishAck, PublishError> {
        let frame = encode_frame(key.as_ref(), &payload).map_err(PublishError::Rejected)?;

        // offset の採番順とファイルへの追記順を揃えるため、ack までロックを持つ
        let mut disk = self.disk.lock().await;
        let segment_messages = disk.segment_messages;
        let files = disk
            .topic(topic, &self.memory)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        files
            .append(&frame)
            .await
            .map_err(|e| PublishError::Unavailable(format!("append to topic={topic}: {e}")))?;
        let ack = self.memory.publish(topic, key, payload).await?;

        if let Err(e) = files.roll_if_full(segment_messages).await {
            tracing::warn!(%topic, error = %e, "failed to start a new log segment");
        }
        Ok(ack)
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        group: &str,
    ) -> Result<Box<dyn Subscription>, LogError> {
        let mut disk = self.disk.lock().await;
        let files = disk.topic(topic, &self.memory).await?;
        let inner = self.memory.subscribe(topic, group).await?;

        // 新しい group でも開始位置を残しておく（再起動後の trim がこの group を待つように）
        if let Some(next_offset) = self.memory.next_uncommitted(topic, group).await {
            files.save_offset(group, next_offset).await?;
        }

        Ok(Box::new(FileSubscription {
            inner,
            memory: self.memory.clone(),
            disk: Arc::clone(&self.disk),
            topic: topic.clone(),
            group: group.to_string(),
        }))
    }
}

struct FileSubscription {
    inner: Box<dyn Subscription>,
    memory: InMemoryDurableLog,
    disk: Arc<Mutex<Disk>>,
    topic: Topic,
    group: String,
}

#[async_trait]
impl Subscription for FileSubscription {
    async fn fetch(&mut self) -> Result<TransportMessage, LogError> {
        self.inner.fetch().await
    }

    async fn commit(&mut self, message: &TransportMessage) -> Result<(), LogError> {
        self.inner.commit(message).await?;

        // 同じ group のメンバー同士で古い watermark を上書きしないよう、ロック内で読み直す
        let mut disk = self.disk.lock().await;
        let Some(next_offset) = self.memory.next_uncommitted(&self.topic, &self.group).await
        else {
            return Ok(());
        };
        let files = disk.topic(&self.topic, &self.memory).await?;
        files
            .save_offset(&self.group, next_offset)
            .await
            .map_err(|e| LogError::Commit(e.to_string()))?;

        let retained = self.memory.first_retained_offset(&self.topic).await;
        files.prune(retained).await;
        Ok(())
    }
}

impl Disk {
    /// topic のファイル群（初回はディスクから読み戻して memory に載せる）
    async fn topic(
        &mut self,
        topic: &Topic,
        memory: &InMemoryDurableLog,
    ) -> Result<&mut TopicFiles, LogError> {
        if !self.topics.contains_key(topic) {
            let files = load_topic(&self.root, topic, memory).await?;
            self.topics.insert(topic.clone(), files);
        }
        self.topics
            .get_mut(topic)
            .ok_or_else(|| LogError::Storage(format!("topic={topic} was not loaded")))
    }
}

impl TopicFiles {
    fn offsets_dir(&self) -> PathBuf {
        self.dir.join("offsets")
    }

    async fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        let active = &mut self.active;
        let written = async {
            active.file.write_all(frame).await?;
            active.file.flush().await?;
            active.file.sync_all().await
        }
        .await;

        match written {
            Ok(()) => {
                active.len += frame.len() as u64;
                active.count += 1;
                Ok(())
            }
            Err(e) => {
                // 書きかけの frame を残すと後続の frame が読めなくなる
                let _ = active.file.set_len(active.len).await;
                Err(e)
            }
        }
    }

    async fn roll_if_full(&mut self, segment_messages: u64) -> io::Result<()> {
        if self.active.count < segment_messages {
            return Ok(());
        }
        let next_base = self.active.base + self.active.count;
        let next = create_segment(&self.dir, next_base).await?;
        let sealed = std::mem::replace(&mut self.active, next);
        self.sealed.push(sealed.base);
        Ok(())
    }

    async fn save_offset(&self, group: &str, next_offset: u64) -> Result<(), LogError> {
        let path = self
            .offsets_dir()
            .join(format!("{}.json", disk::file_stem(group)));
        let bytes = serde_json::to_vec(&GroupOffset {
            group: group.to_string(),
            next_offset,
        })
        .map_err(|e| LogError::Storage(format!("encode offset for group '{group}': {e}")))?;
        disk::write_atomic(&path, &bytes)
            .await
            .map_err(|e| io_error(&path, e))
    }

    /// `retained_from` より前しか含まないセグメントを消す
    async fn prune(&mut self, retained_from: u64) {
        let mut removed = false;
        while let Some(&oldest) = self.sealed.first() {
            let end = self.sealed.get(1).copied().unwrap_or(self.active.base);
            if end > retained_from {
                break;
            }
            let path = segment_path(&self.dir, oldest);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove log segment");
                break;
            }
            tracing::debug!(path = %path.display(), "log segment released");
            self.sealed.remove(0);
            removed = true;
        }

        if removed {
            if let Err(e) = disk::sync_dir(&self.dir).await {
                tracing::warn!(dir = %self.dir.display(), error = %e, "failed to sync log directory");
            }
        }
    }
}

async fn load_topic(
    root: &Path,
    topic: &Topic,
    memory: &InMemoryDurableLog,
) -> Result<TopicFiles, LogError> {
    let dir = root.join(disk::file_stem(topic.as_str()));
    let offsets_dir = dir.join("offsets");
    tokio::fs::create_dir_all(&offsets_dir)
        .await
        .map_err(|e| io_error(&offsets_dir, e))?;

    let bases = list_segments(&dir).await?;
    let mut entries = Vec::new();
    let mut first_base = None;
    let mut expected = None;
    let mut active = None;

    for (i, &base) in bases.iter().enumerate() {
        let path = segment_path(&dir, base);
        let is_last = i + 1 == bases.len();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let (frames, valid_len) =
            decode_segment(&bytes).map_err(|e| LogError::Storage(format!("{}: {e}", path.display())))?;

        if expected.is_some_and(|expected| expected != base) {
            return Err(LogError::Storage(format!(
                "{}: segment starts at {base}, expected {expected:?}",
                path.display()
            )));
        }
        if valid_len < bytes.len() {
            if !is_last {
                return Err(LogError::Storage(format!(
                    "{}: corrupt frame in a sealed segment",
                    path.display()
                )));
            }
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() - valid_len,
                "truncating incomplete frame at the end of the log"
            );
        }

        let count = frames.len() as u64;
        if first_base.is_none() {
            first_base = Some(base);
        }
        expected = Some(base + count);
        entries.extend(frames);

        if is_last {
            let file = reopen_active(&path, valid_len, bytes.len())
                .await
                .map_err(|e| io_error(&path, e))?;
            active = Some(ActiveSegment {
                base,
                count,
                len: valid_len.max(SEGMENT_MAGIC.len()) as u64,
                file,
            });
        }
    }

    let active = match active {
        Some(active) => active,
        None => create_segment(&dir, 0)
            .await
            .map_err(|e| io_error(&dir, e))?,
    };
    let sealed = bases
        .iter()
        .copied()
        .filter(|&base| base != active.base)
        .collect();
    let groups = load_offsets(&offsets_dir).await?;

    memory
        .restore_topic(topic, first_base.unwrap_or(0), entries, groups)
        .await;

    let retained_from = memory.first_retained_offset(topic).await;
    let mut files = TopicFiles { dir, sealed, active };
    files.prune(retained_from).await;
    tracing::debug!(%topic, retained_from, "log topic loaded");
    Ok(files)
}

async fn list_segments(dir: &Path) -> Result<Vec<u64>, LogError> {
    let mut bases = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error(dir, e))?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        match path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            Some(base) => bases.push(base),
            None => tracing::warn!(path = %path.display(), "ignoring unrecognised segment file"),
        }
    }
    bases.sort_unstable();
    Ok(bases)
}

async fn load_offsets(dir: &Path) -> Result<Vec<(String, u64)>, LogError> {
    let mut groups = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error(dir, e))?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let offset: GroupOffset = serde_json::from_slice(&bytes)
            .map_err(|e| LogError::Storage(format!("{}: {e}", path.display())))?;
        groups.push((offset.group, offset.next_offset));
    }
    Ok(groups)
}

fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{base:020}.{SEGMENT_EXT}"))
}

async fn create_segment(dir: &Path, base: u64) -> io::Result<ActiveSegment> {
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(segment_path(dir, base))
        .await?;
    file.write_all(SEGMENT_MAGIC).await?;
    file.flush().await?;
    file.sync_all().await?;
    disk::sync_dir(dir).await?;

    Ok(ActiveSegment {
        base,
        count: 0,
        len: SEGMENT_MAGIC.len() as u64,
        file,
    })
}

/// 書き込み中だったセグメントを追記用に開き直す（壊れた末尾は切り詰める）
async fn reopen_active(path: &Path, valid_len: usize, file_len: usize) -> io::Result<tokio::fs::File> {
    let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
    if valid_len < SEGMENT_MAGIC.len() {
        file.set_len(0).await?;
        file.write_all(SEGMENT_MAGIC).await?;
        file.flush().await?;
        file.sync_all().await?;
    } else if valid_len < file_len {
        file.set_len(valid_len as u64).await?;
        file.sync_all().await?;
    }
    Ok(file)
}

fn encode_frame(key: Option<&Bytes>, payload: &Bytes) -> Result<Vec<u8>, String> {
    let key_len = match key {
        Some(key) => u32::try_from(key.len())
            .ok()
            .filter(|&len| len != NO_KEY)
            .ok_or_else(|| format!("key of {} bytes is too large", key.len()))?,
        None => NO_KEY,
    };
    let key_bytes = key.map(|key| key.len()).unwrap_or(0);
    let body_len = u32::try_from(4 + key_bytes + payload.len())
        .map_err(|_| format!("payload of {} bytes is too large", payload.len()))?;

    let mut frame = Vec::with_capacity(4 + body_len as usize);
    frame.extend_from_slice(&body_len.to_le_bytes());
    frame.extend_from_slice(&key_len.to_le_bytes());
    if let Some(key) = key {
        frame.extend_from_slice(key);
    }
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// 完全な frame だけを読み、読めたバイト数と一緒に返す
fn decode_segment(bytes: &[u8]) -> Result<(Vec<StoredMessage>, usize), String> {
    if bytes.len() < SEGMENT_MAGIC.len() {
        return Ok((Vec::new(), 0));
    }
    if &bytes[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
        return Err("not a log segment (bad magic)".to_string());
    }

    let mut pos = SEGMENT_MAGIC.len();
    let mut messages = Vec::new();
    while let Some((message, used)) = decode_frame(&bytes[pos..]) {
        messages.push(message);
        pos += used;
    }
    Ok((messages, pos))
}

fn decode_frame(buf: &[u8]) -> Option<(StoredMessage, usize)> {
    let body_len = read_u32(buf)? as usize;
    let body = buf.get(4..4 + body_len)?;
    let key_len = read_u32(body)?;
    let rest = body.get(4..)?;

    let (key, payload) = if key_len == NO_KEY {
        (None, rest)
    } else {
        let key_len = key_len as usize;
        (
            Some(Bytes::copy_from_slice(rest.get(..key_len)?)),
            rest.get(key_len..)?,
        )
    };

    Some((
        StoredMessage {
            key,
            payload: Bytes::copy_from_slice(payload),
        },
        4 + body_len,
    ))
}

fn read_u32(buf: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn io_error(path: &Path, e: io::Error) -> LogError {
    LogError::Storage(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn topic() -> Topic {
        Topic::new("events")
    }

    fn segment_files(root: &Path, topic: &Topic) -> Vec<String> {
        let dir = root.join(disk::file_stem(topic.as_str()));
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".seg"))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_messages_survive_reopen_and_uncommitted_are_redelivered() {
        let dir = tempdir().unwrap();
        {
            let log = FileDurableLog::open(dir.path()).await.unwrap();
            for p in [b"a", b"b", b"c"] {
                log.publish(&topic(), Some(Bytes::from_static(b"k")), Bytes::from_static(p))
                    .await
                    .unwrap();
            }
            log.publish(&Topic::new("dlt"), None, Bytes::from_static(b"dead"))
                .await
                .unwrap();

            let mut sub = log.subscribe(&topic(), "g").await.unwrap();
            let first = sub.fetch().await.unwrap();
            sub.commit(&first).await.unwrap();
            // offset 1 は取り出したが commit していない
            assert_eq!(sub.fetch().await.unwrap().offset, 1);
        }

        let log = FileDurableLog::open(dir.path()).await.unwrap();
        let mut sub = log.subscribe(&topic(), "g").await.unwrap();
        let redelivered = sub.fetch().await.unwrap();
        assert_eq!(redelivered.offset, 1);
        assert_eq!(redelivered.payload, Bytes::from_static(b"b"));
        assert_eq!(redelivered.key, Some(Bytes::from_static(b"k")));
        assert_eq!(log.committed_offset(&topic(), "g").await, Some(0));

        let dlt = log.messages(&Topic::new("dlt")).await.unwrap();
        assert_eq!(dlt.len(), 1);
        assert_eq!(dlt[0].payload, Bytes::from_static(b"dead"));
        assert_eq!(dlt[0].key, None);

        let ack = log.publish(&topic(), None, Bytes::from_static(b"d")).await.unwrap();
        assert_eq!(ack.offset, 3);
    }

    #[tokio::test]
    async fn test_consumed_segments_are_deleted() {
        let dir = tempdir().unwrap();
        let log = FileDurableLog::open_with_segment_messages(dir.path(), 2)
            .await
            .unwrap();
        let mut sub = log.subscribe(&topic(), "g").await.unwrap();
        for i in 0..5u8 {
            log.publish(&topic(), None, Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(segment_files(dir.path(), &topic()).len(), 3);

        for _ in 0..4 {
            let msg = sub.fetch().await.unwrap();
            sub.commit(&msg).await.unwrap();
        }

        assert_eq!(
            segment_files(dir.path(), &topic()),
            vec![format!("{:020}.seg", 4)]
        );
        let remaining = log.messages(&topic()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].offset, 4);

        // 読み終えた分は再起動後も配られない
        drop(sub);
        drop(log);
        let log = FileDurableLog::open_with_segment_messages(dir.path(), 2)
            .await
            .unwrap();
        let mut sub = log.subscribe(&topic(), "g").await.unwrap();
        assert_eq!(sub.fetch().await.unwrap().offset, 4);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = FileDurableLog::open(dir.path()).await.unwrap();
            log.publish(&topic(), None, Bytes::from_static(b"whole"))
                .await
                .unwrap();
        }

        let segment = dir
            .path()
            .join(disk::file_stem(topic().as_str()))
            .join(format!("{:020}.seg", 0));
        let mut file = std::fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        {
            let log = FileDurableLog::open(dir.path()).await.unwrap();
            let messages = log.messages(&topic()).await.unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].payload, Bytes::from_static(b"whole"));

            let ack = log.publish(&topic(), None, Bytes::from_static(b"after"))
                .await
                .unwrap();
            assert_eq!(ack.offset, 1);
        }

        let log = FileDurableLog::open(dir.path()).await.unwrap();
        let payloads: Vec<_> = log
            .messages(&topic())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"whole"), Bytes::from_static(b"after")]
        );
    }

    #[tokio::test]
    async fn test_corrupt_segment_header_fails_to_load() {
        let dir = tempdir().unwrap();
        let topic_dir = dir.path().join(disk::file_stem(topic().as_str()));
        std::fs::create_dir_all(&topic_dir).unwrap();
        std::fs::write(topic_dir.join(format!("{:020}.seg", 0)), b"nope").unwrap();

        let log = FileDurableLog::open(dir.path()).await.unwrap();
        let err = log
            .publish(&topic(), None, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
    }

    #[test]
    fn frame_layout_keeps_key_and_payload() {
        let key = Bytes::from_static(b"123456");
        let payload = Bytes::from_static(b"{\"a\":1}");
        let frame = encode_frame(Some(&key), &payload).unwrap();

        let (message, used) = decode_frame(&frame).unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(message.key, Some(key));
        assert_eq!(message.payload, payload);

        // 途中で切れた frame は読まない
        assert!(decode_frame(&frame[..frame.len() - 1]).is_none());
    }
}
