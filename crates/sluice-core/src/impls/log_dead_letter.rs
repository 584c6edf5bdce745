//! LogDeadLetter - dead-letter topic への再 publish

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{DeadLetterError, Topic, TransportMessage};
use crate::ports::{DeadLetterSink, DurableLog};

/// LogDeadLetter は元メッセージの key と payload をそのまま dead-letter topic へ送る
pub struct LogDeadLetter {
    log: Arc<dyn DurableLog>,
    topic: Topic,
}

impl LogDeadLetter {
    pub fn new(log: Arc<dyn DurableLog>, topic: Topic) -> Self {
        Self { log, topic }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn forward(&self, message: &TransportMessage) -> Result<(), DeadLetterError> {
        // Bytes の clone は参照カウントのみ（中身はコピーも再 encode もしない）
        self.log
            .publish(&self.topic, message.key.clone(), message.payload.clone())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryDurableLog;
    use bytes::Bytes;

    fn message() -> TransportMessage {
        TransportMessage {
            topic: Topic::new("primary"),
            partition: 0,
            offset: 7,
            key: Some(Bytes::from_static(b"123456")),
            // 意図的に canonical でない並び・空白を含める
            payload: Bytes::from_static(br#"{ "advertiser_id" : "123456" }"#),
        }
    }

    #[tokio::test]
    async fn forwards_exact_bytes() {
        let log = InMemoryDurableLog::new();
        let dlt = LogDeadLetter::new(Arc::new(log.clone()), Topic::new("dlt"));

        dlt.forward(&message()).await.unwrap();

        let stored = log.messages(&Topic::new("dlt")).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, message().payload);
        assert_eq!(stored[0].key, message().key);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_as_dead_letter_error() {
        let log = InMemoryDurableLog::new();
        log.set_available(false);
        let dlt = LogDeadLetter::new(Arc::new(log.clone()), Topic::new("dlt"));

        let err = dlt.forward(&message()).await.unwrap_err();
        assert!(matches!(err, DeadLetterError::Publish(_)));
    }
}
