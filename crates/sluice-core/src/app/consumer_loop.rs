//! ConsumerLoop - primary topic を読み続けてストレージへ保存するループ
//!
//! # フロー（1 メッセージごと）
//! 1. Fetch: `Subscription::fetch()` と shutdown を select で競合させる
//! 2. Decode+Persist: payload を EventRecord に decode して `StorageSink::save()`
//! 3. Route-on-Failure: save 失敗時は元の TransportMessage を `DeadLetterSink::forward()`
//! 4. Commit: 結果にかかわらず offset を commit
//!
//! # エラー方針
//! - fetch 失敗: ログに残して次へ（backoff は log client の責務）
//! - decode 失敗: ログに残して捨てる（replay しても直らないので dead-letter しない）
//! - save 失敗: dead-letter へ
//! - dead-letter 失敗: ログのみ（二段目の退避先はない）
//!
//! 1 メッセージの失敗がループを止めたり次のメッセージに影響したりしないこと。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use ulid::Ulid;

use crate::domain::{EventRecord, StorageError, TransportMessage};
use crate::ports::{DeadLetterSink, StorageSink, Subscription};

/// 1 メッセージの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 保存できた
    Persisted,
    /// decode できず捨てた
    Dropped,
    /// 保存に失敗し、dead-letter へ退避した
    DeadLettered,
    /// 保存にも dead-letter にも失敗した
    Lost,
}

/// ConsumerLoop は 1 consumer インスタンス
///
/// # 使用例
/// ```ignore
/// let sub = log.subscribe(&topic, "group").await?;
/// let consumer = ConsumerLoop::new(sub, storage, dead_letter);
/// tokio::spawn(consumer.run(shutdown_rx));
/// ```
pub struct ConsumerLoop {
    id: Ulid,
    subscription: Box<dyn Subscription>,
    storage: Arc<dyn StorageSink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    save_timeout: Option<Duration>,
}

impl ConsumerLoop {
    pub fn new(
        subscription: Box<dyn Subscription>,
        storage: Arc<dyn StorageSink>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            subscription,
            storage,
            dead_letter,
            save_timeout: None,
        }
    }

    /// save の上限時間を設定（None なら sink 任せ）
    ///
    /// 上限を超えた save は `StorageErrorKind::Timeout` として dead-letter へ回る。
    pub fn with_save_timeout(mut self, save_timeout: Option<Duration>) -> Self {
        self.save_timeout = save_timeout;
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    /// shutdown が来るまでメッセージを処理し続ける
    ///
    /// shutdown を見るのは fetch 待ちの間だけ。保存中のメッセージは最後まで処理してから抜ける。
    /// Sender が drop された場合も停止する。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %self.id, "consumer loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // 変更が入ったら次のループで判定
                    continue;
                }
                fetched = self.subscription.fetch() => fetched,
            };

            let message = match fetched {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(consumer = %self.id, error = %e, "error reading message");
                    continue;
                }
            };

            let disposition = self.process(&message).await;
            tracing::debug!(
                consumer = %self.id,
                topic = %message.topic,
                offset = message.offset,
                ?disposition,
                "message processed"
            );

            if let Err(e) = self.subscription.commit(&message).await {
                tracing::warn!(
                    consumer = %self.id,
                    offset = message.offset,
                    error = %e,
                    "offset commit failed"
                );
            }
        }

        tracing::info!(consumer = %self.id, "consumer loop stopped");
    }

    /// 1 メッセージを decode → save → (失敗時) dead-letter する
    pub async fn process(&self, message: &TransportMessage) -> Disposition {
        let record = match EventRecord::from_bytes(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    consumer = %self.id,
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "dropping undecodable message"
                );
                return Disposition::Dropped;
            }
        };

        let Err(save_err) = self.save(&record).await else {
            return Disposition::Persisted;
        };

        tracing::warn!(
            consumer = %self.id,
            offset = message.offset,
            advertiser_id = record.advertiser_id(),
            error = %save_err,
            "error saving record, forwarding to dead-letter topic"
        );

        // 元のメッセージをそのまま送る（record を encode し直さない）
        match self.dead_letter.forward(message).await {
            Ok(()) => Disposition::DeadLettered,
            Err(e) => {
                tracing::error!(
                    consumer = %self.id,
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "error writing message to dead-letter topic; message lost"
                );
                Disposition::Lost
            }
        }
    }

    async fn save(&self, record: &EventRecord) -> Result<(), StorageError> {
        let save = self.storage.save(record.storage_key(), record);
        match self.save_timeout {
            None => save.await,
            Some(limit) => match tokio::time::timeout(limit, save).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::timeout(format!("save exceeded {limit:?}"))),
            },
        }
    }
}
