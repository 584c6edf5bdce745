//! InMemoryDurableLog - プロセス内の durable log
//!
//! # 実装詳細
//! - topic ごとに append-only の列（パーティションは 0 のみ）。先頭の offset を `base` で持つ
//! - consumer group ごとに共有 cursor を 1 つ持つ（同じ group のメンバーで取り合う）
//! - commit は group ごとに「ここより前は全部 commit 済み」の watermark にまとめる
//! - topic の全 group の watermark より前のエントリは捨てる（購読 group の無い topic は捨てない）
//! - `tokio::sync::Notify` で publish 時に待機中の fetch を起こす
//!
//! プロセスが落ちれば中身は消える。再起動をまたぐ場合は `FileDurableLog` を使う。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::domain::{LogError, PublishAck, PublishError, Topic, TransportMessage};
use crate::ports::{DurableLog, Subscription};

const PARTITION: u32 = 0;

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub(crate) key: Option<Bytes>,
    pub(crate) payload: Bytes,
}

#[derive(Debug, Default)]
struct TopicLog {
    /// entries[0] の offset
    base: u64,
    entries: VecDeque<StoredMessage>,
}

impl TopicLog {
    fn end(&self) -> u64 {
        self.base + self.entries.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&StoredMessage> {
        let index = usize::try_from(offset.checked_sub(self.base)?).ok()?;
        self.entries.get(index)
    }

    fn trim_to(&mut self, offset: u64) {
        while self.base < offset && self.entries.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Debug)]
struct GroupCursor {
    /// 次に配る offset
    next: u64,
    /// これより前の offset は全部 commit 済み
    watermark: u64,
    /// watermark より後ろで commit 済みの offset（メンバー間で順不同に commit されるため）
    done: BTreeSet<u64>,
}

impl GroupCursor {
    fn starting_at(offset: u64) -> Self {
        Self {
            next: offset,
            watermark: offset,
            done: BTreeSet::new(),
        }
    }

    fn commit(&mut self, offset: u64) {
        if offset < self.watermark {
            return;
        }
        self.done.insert(offset);
        while self.done.remove(&self.watermark) {
            self.watermark += 1;
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    topics: HashMap<Topic, TopicLog>,
    groups: HashMap<(Topic, String), GroupCursor>,
}

impl LogState {
    /// topic を購読している全 group の watermark の最小値
    fn low_watermark(&self, topic: &Topic) -> Option<u64> {
        self.groups
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, cursor)| cursor.watermark)
            .min()
    }

    fn trim(&mut self, topic: &Topic) {
        if let Some(low) = self.low_watermark(topic) {
            if let Some(log) = self.topics.get_mut(topic) {
                log.trim_to(low);
            }
        }
    }
}

struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
    available: AtomicBool,
}

/// InMemoryDurableLog は開発・テスト用の durable log
///
/// # 使用例
/// ```ignore
/// let log = InMemoryDurableLog::new();
/// log.publish(&topic, None, payload).await?;
/// let mut sub = log.subscribe(&topic, "group").await?;
/// let msg = sub.fetch().await?;
/// sub.commit(&msg).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryDurableLog {
    shared: Arc<Shared>,
}

impl InMemoryDurableLog {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// 障害注入用: false の間は publish が `PublishError::Unavailable` になる
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// topic に残っているメッセージ（trim 済みのものは含まない）
    pub async fn messages(&self, topic: &Topic) -> Vec<TransportMessage> {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.entries
                    .iter()
                    .zip(log.base..)
                    .map(|(m, offset)| to_transport(topic, offset, m))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// group の commit 済み offset（連続して commit された最後の offset。未 commit なら None）
    pub async fn committed_offset(&self, topic: &Topic, group: &str) -> Option<u64> {
        self.next_uncommitted(topic, group)
            .await
            .and_then(|watermark| watermark.checked_sub(1))
    }

    /// まだ保持している最初の offset（それより前は trim 済み）
    pub async fn first_retained_offset(&self, topic: &Topic) -> u64 {
        let state = self.shared.state.lock().await;
        state.topics.get(topic).map(|log| log.base).unwrap_or(0)
    }

    /// group の watermark（再起動時にここから配り直す）
    pub(crate) async fn next_uncommitted(&self, topic: &Topic, group: &str) -> Option<u64> {
        let state = self.shared.state.lock().await;
        state
            .groups
            .get(&(topic.clone(), group.to_string()))
            .map(|cursor| cursor.watermark)
    }

    /// ディスクから読み戻した topic を載せる
    ///
    /// `groups` は (group, watermark)。各 group は watermark から配り直しになる。
    pub(crate) async fn restore_topic(
        &self,
        topic: &Topic,
        base: u64,
        entries: Vec<StoredMessage>,
        groups: Vec<(String, u64)>,
    ) {
        let mut state = self.shared.state.lock().await;
        let log = TopicLog {
            base,
            entries: entries.into(),
        };
        let end = log.end();
        state.topics.insert(topic.clone(), log);
        for (group, watermark) in groups {
            let start = watermark.clamp(base, end);
            state
                .groups
                .insert((topic.clone(), group), GroupCursor::starting_at(start));
        }
        state.trim(topic);
    }
}

impl Default for InMemoryDurableLog {
    fn default() -> Self {
        Self::new()
    }
}

fn to_transport(topic: &Topic, offset: u64, m: &StoredMessage) -> TransportMessage {
    TransportMessage {
        topic: topic.clone(),
        partition: PARTITION,
        offset,
        key: m.key.clone(),
        payload: m.payload.clone(),
    }
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn publish(
        &self,
        topic: &Topic,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<PublishAck, PublishError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable(format!(
                "in-memory log is marked unavailable (topic={topic})"
            )));
        }

        let offset = {
            let mut state = self.shared.state.lock().await;
            let log = state.topics.entry(topic.clone()).or_default();
            let offset = log.end();
            log.entries.push_back(StoredMessage { key, payload });
            offset
        };

        // 待機中の fetch を全部起こす（取り合いは cursor のロックで決まる）
        self.shared.notify.notify_waiters();

        Ok(PublishAck {
            topic: topic.clone(),
            partition: PARTITION,
            offset,
            published_at: Utc::now(),
        })
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        group: &str,
    ) -> Result<Box<dyn Subscription>, LogError> {
        let mut state = self.shared.state.lock().await;
        let start = state.topics.get(topic).map(|log| log.base).unwrap_or(0);
        state
            .groups
            .entry((topic.clone(), group.to_string()))
            .or_insert_with(|| GroupCursor::starting_at(start));

        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.clone(),
            group: group.to_string(),
        }))
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    topic: Topic,
    group: String,
}

impl InMemorySubscription {
    fn cursor_key(&self) -> (Topic, String) {
        (self.topic.clone(), self.group.clone())
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn fetch(&mut self) -> Result<TransportMessage, LogError> {
        let key = self.cursor_key();
        loop {
            // ロックを取る前に通知を予約しておく（publish との取りこぼし防止）
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                let state = &mut *state;
                let cursor = state.groups.get_mut(&key).ok_or_else(|| {
                    LogError::Fetch(format!(
                        "group '{}' is not subscribed to topic={}",
                        self.group, self.topic
                    ))
                })?;
                let found = state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.get(cursor.next))
                    .map(|m| to_transport(&self.topic, cursor.next, m));

                // cursor 更新から return まで await を挟まない（キャンセル安全）
                if let Some(message) = found {
                    cursor.next += 1;
                    return Ok(message);
                }
            }

            notified.await;
        }
    }

    async fn commit(&mut self, message: &TransportMessage) -> Result<(), LogError> {
        if message.topic != self.topic {
            return Err(LogError::Commit(format!(
                "message from topic={} committed on subscription for topic={}",
                message.topic, self.topic
            )));
        }

        let mut state = self.shared.state.lock().await;
        let cursor = state.groups.get_mut(&self.cursor_key()).ok_or_else(|| {
            LogError::Commit(format!(
                "group '{}' is not subscribed to topic={}",
                self.group, self.topic
            ))
        })?;
        cursor.commit(message.offset);
        state.trim(&self.topic);
        Ok(())
    }
}
