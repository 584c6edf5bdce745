//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - log と storage が揃っていなければ build() が BuildError を返す
//! - primary と dead-letter が同じ topic なら BuildError（失敗したメッセージが自分に戻ってくるため）
//! - consumer 数 0 も BuildError
//!
//! 依存はここで一度だけ注入し、以後差し替えない。

use std::sync::Arc;
use std::time::Duration;

use super::consumer_group::ConsumerGroup;
use super::producer::ProducerService;
use crate::domain::{LogError, Topic};
use crate::impls::LogDeadLetter;
use crate::ports::{DeadLetterSink, DurableLog, StorageSink};

/// パイプラインの設定値（`Config` から作る）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub primary_topic: Topic,
    pub dead_letter_topic: Topic,
    pub consumer_group: String,
    pub consumers: usize,
    pub save_timeout: Option<Duration>,
}

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no durable log configured")]
    MissingLog,

    #[error("no storage sink configured")]
    MissingStorage,

    #[error("dead-letter topic must differ from the primary topic (both are '{0}')")]
    SameTopics(Topic),

    #[error("at least one consumer instance is required")]
    NoConsumers,
}

/// PipelineBuilder は Pipeline を構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new(settings)
///     .log(Arc::new(InMemoryDurableLog::new()))
///     .storage(Arc::new(FileStorage::new("./data")))
///     .build()?;
/// let consumers = pipeline.start_consumers().await?;
/// ```
///
/// dead_letter を指定しなければ、同じ log の dead-letter topic へ送る LogDeadLetter を使う。
pub struct PipelineBuilder {
    settings: PipelineSettings,
    log: Option<Arc<dyn DurableLog>>,
    storage: Option<Arc<dyn StorageSink>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl PipelineBuilder {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            log: None,
            storage: None,
            dead_letter: None,
        }
    }

    pub fn log(mut self, log: Arc<dyn DurableLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageSink>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn dead_letter(mut self, dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        let log = self.log.ok_or(BuildError::MissingLog)?;
        let storage = self.storage.ok_or(BuildError::MissingStorage)?;
        if self.settings.primary_topic == self.settings.dead_letter_topic {
            return Err(BuildError::SameTopics(self.settings.primary_topic));
        }
        if self.settings.consumers == 0 {
            return Err(BuildError::NoConsumers);
        }

        let dead_letter: Arc<dyn DeadLetterSink> = match self.dead_letter {
            Some(dead_letter) => dead_letter,
            None => Arc::new(LogDeadLetter::new(
                Arc::clone(&log),
                self.settings.dead_letter_topic.clone(),
            )),
        };
        let producer = Arc::new(ProducerService::new(
            Arc::clone(&log),
            self.settings.primary_topic.clone(),
        ));

        Ok(Pipeline {
            settings: self.settings,
            log,
            storage,
            dead_letter,
            producer,
        })
    }
}

/// Pipeline は構築済みの producer と、consumer を起動するための依存一式
pub struct Pipeline {
    settings: PipelineSettings,
    log: Arc<dyn DurableLog>,
    storage: Arc<dyn StorageSink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    producer: Arc<ProducerService>,
}

impl Pipeline {
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Gateway に渡す producer
    pub fn producer(&self) -> Arc<ProducerService> {
        Arc::clone(&self.producer)
    }

    /// 設定された数の ConsumerLoop を起動
    pub async fn start_consumers(&self) -> Result<ConsumerGroup, LogError> {
        ConsumerGroup::spawn(
            self.settings.consumers,
            Arc::clone(&self.log),
            &self.settings.primary_topic,
            &self.settings.consumer_group,
            Arc::clone(&self.storage),
            Arc::clone(&self.dead_letter),
            self.settings.save_timeout,
        )
        .await
    }
}
