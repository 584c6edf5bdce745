//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてパイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: 依存の注入と起動時検証
//! - **ProducerService**: EventRecord → primary topic
//! - **ConsumerLoop**: primary topic → StorageSink（失敗時は DeadLetterSink）
//! - **ConsumerGroup**: ConsumerLoop の起動・停止

pub mod builder;
pub mod producer;
pub mod consumer_loop;
pub mod consumer_group;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Pipeline, PipelineBuilder, PipelineSettings};
pub use self::producer::ProducerService;
pub use self::consumer_loop::{ConsumerLoop, Disposition};
pub use self::consumer_group::ConsumerGroup;
