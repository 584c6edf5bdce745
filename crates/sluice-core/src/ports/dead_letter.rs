//! DeadLetterSink port - 保存に失敗したメッセージの退避先
//!
//! # 実装
//! - **LogDeadLetter**: DurableLog の dead-letter topic へ再 publish

use async_trait::async_trait;

use crate::domain::{DeadLetterError, TransportMessage};

/// DeadLetterSink は元の TransportMessage をそのまま退避する
///
/// record を encode し直さず、payload の bytes を変えずに転送すること。
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn forward(&self, message: &TransportMessage) -> Result<(), DeadLetterError>;
}
