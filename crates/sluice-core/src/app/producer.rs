//! ProducerService - 検証済み EventRecord を primary topic へ publish

use std::sync::Arc;

use bytes::Bytes;

use crate::domain::{EventRecord, PublishAck, PublishError, Topic};
use crate::ports::DurableLog;

/// ProducerService は EventRecord を canonical bytes にして log へ append する
///
/// # 設計原則
/// - 再検証しない（Gateway で検証済みのものだけが来る）
/// - バッファもリトライもしない（log client の責務）
/// - 失敗はそのまま `PublishError` で返す
pub struct ProducerService {
    log: Arc<dyn DurableLog>,
    topic: Topic,
}

impl ProducerService {
    pub fn new(log: Arc<dyn DurableLog>, topic: Topic) -> Self {
        Self { log, topic }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// record を primary topic に publish し、log の ack を返す
    ///
    /// message key は advertiser_id（同じ advertiser は同じパーティションへ）。
    pub async fn submit(&self, record: EventRecord) -> Result<PublishAck, PublishError> {
        let payload = record
            .to_canonical_bytes()
            .map_err(|e| PublishError::Rejected(format!("encode record: {e}")))?;
        let key = Bytes::copy_from_slice(record.storage_key().as_bytes());

        let ack = self.log.publish(&self.topic, Some(key), payload).await?;
        tracing::debug!(
            topic = %ack.topic,
            offset = ack.offset,
            advertiser_id = record.advertiser_id(),
            "event published"
        );
        Ok(ack)
    }
}
