//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryDurableLog**: プロセス内の durable log（開発・テスト用）
//! - **FileDurableLog**: ディスクに追記する durable log（本番バイナリで使用）
//! - **InMemoryStorage**: テスト用の StorageSink
//! - **FileStorage**: キーごとに 1 ファイルの StorageSink（本番バイナリで使用）
//! - **LogDeadLetter**: dead-letter topic への再 publish

mod disk;
pub mod inmem_log;
pub mod file_log;
pub mod inmem_storage;
pub mod file_storage;
pub mod log_dead_letter;

// 主要な型を再エクスポート
pub use self::inmem_log::InMemoryDurableLog;
pub use self::file_log::FileDurableLog;
pub use self::inmem_storage::InMemoryStorage;
pub use self::file_storage::FileStorage;
pub use self::log_dead_letter::LogDeadLetter;
