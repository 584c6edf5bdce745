//! ConsumerGroup - 同じ group の ConsumerLoop を N 個動かす
//!
//! 全メンバーの subscribe が済んでから spawn する（途中で失敗したら 1 つも起動しない）。
//! 停止は watch channel 1 本で全メンバーに伝える。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::consumer_loop::ConsumerLoop;
use crate::domain::{LogError, Topic};
use crate::ports::{DeadLetterSink, DurableLog, StorageSink};

/// Consumer group handle.
/// - `shutdown_tx` を drop すると全 consumer が止まる
/// - `shutdown_and_join()` で全 consumer の終了を待てる
///
/// パーティション割り当てと排他は DurableLog 側の責務。ここではロックも調整もしない。
pub struct ConsumerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// Subscribe `n` members to `topic` under `group`, then spawn one loop each.
    ///
    /// All subscriptions are opened before any task is spawned, so a subscribe
    /// error leaves nothing running.
    pub async fn spawn(
        n: usize,
        log: Arc<dyn DurableLog>,
        topic: &Topic,
        group: &str,
        storage: Arc<dyn StorageSink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        save_timeout: Option<Duration>,
    ) -> Result<Self, LogError> {
        let mut consumers = Vec::with_capacity(n);
        for _ in 0..n {
            let subscription = log.subscribe(topic, group).await?;
            consumers.push(
                ConsumerLoop::new(subscription, Arc::clone(&storage), Arc::clone(&dead_letter))
                    .with_save_timeout(save_timeout),
            );
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = consumers
            .into_iter()
            .map(|consumer| tokio::spawn(consumer.run(shutdown_rx.clone())))
            .collect();

        tracing::info!(%topic, group, instances = n, "consumer group started");
        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all consumers.
    /// In-flight saves are not cancelled; each loop stops at its next fetch.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all consumers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            if let Err(e) = j.await {
                tracing::error!(error = %e, "consumer task ended abnormally");
            }
        }
    }
}
