//! Ports - 抽象化レイヤー
//!
//! パイプラインが外部システム（durable log, ストレージ）に求める契約を定義します。
//! 実装の詳細は `impls` に置き、app 層は trait object 越しにしか触らない。
//!
//! # 設計原則
//! - 依存はコンストラクタで注入（実行中に差し替えない）
//! - すべて `Send + Sync`（HTTP ハンドラと consumer タスクから同時に使う）

pub mod durable_log;
pub mod storage_sink;
pub mod dead_letter;

// 主要な trait を再エクスポート
pub use self::durable_log::{DurableLog, Subscription};
pub use self::storage_sink::StorageSink;
pub use self::dead_letter::DeadLetterSink;
