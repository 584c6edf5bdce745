//! DurableLog port - append-only の publish/subscribe
//!
//! # 実装
//! - **InMemoryDurableLog**: 開発・テスト用（プロセス内）
//! - **FileDurableLog**: セグメントファイルに追記（再起動をまたいで残る）
//!
//! wire format やパーティション割り当ての詳細は実装側の責務。

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{LogError, PublishAck, PublishError, Topic, TransportMessage};

/// DurableLog は topic への append と consumer group 単位の購読を提供
///
/// # 契約
/// - `publish` が Ok を返した時点で append は ack 済み
/// - 同じ group の Subscription 同士では、1 メッセージは 1 メンバーにだけ配送される
/// - group が違えば cursor は独立
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn publish(
        &self,
        topic: &Topic,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<PublishAck, PublishError>;

    async fn subscribe(
        &self,
        topic: &Topic,
        group: &str,
    ) -> Result<Box<dyn Subscription>, LogError>;
}

/// Subscription は 1 consumer が持つ読み取りハンドル
///
/// ConsumerLoop が spawn されたタスクの中で `&self` 越しに保持するので `Sync` も要求する。
#[async_trait]
pub trait Subscription: Send + Sync {
    /// 次のメッセージが来るまで待つ
    ///
    /// キャンセル安全であること（select! で落とされてもメッセージを失わない）。
    async fn fetch(&mut self) -> Result<TransportMessage, LogError>;

    /// 処理を終えたメッセージの offset を確定
    async fn commit(&mut self, message: &TransportMessage) -> Result<(), LogError>;
}
