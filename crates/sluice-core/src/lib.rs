//! sluice-core
//!
//! HTTP で受け付けたイベントを durable log 経由でストレージへ流すパイプラインの中核。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（EventRecord, TransportMessage, errors）
//! - **ports**: 抽象化レイヤー（DurableLog, StorageSink, DeadLetterSink）
//! - **impls**: ports の実装（InMemoryDurableLog, InMemoryStorage, FileStorage, LogDeadLetter）
//! - **app**: アプリケーションロジック（ProducerService, ConsumerLoop, ConsumerGroup）
//! - **gateway**: HTTP の入口（POST /submit）
//! - **config**: 環境変数からの設定読み込み
//! - **telemetry**: tracing の初期化

pub mod domain;
pub mod ports;
pub mod impls;
pub mod app;
pub mod gateway;
pub mod config;
pub mod telemetry;
