//! Config - 環境変数からの設定読み込み
//!
//! 全項目にローカル開発用のデフォルトがある。値が読めなければ起動時に ConfigError。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::app::PipelineSettings;
use crate::domain::Topic;

pub const ENV_SERVER_ADDR: &str = "SERVER_ADDR";
pub const ENV_TOPIC: &str = "SLUICE_TOPIC";
pub const ENV_DLT_TOPIC: &str = "SLUICE_DLT_TOPIC";
pub const ENV_CONSUMER_GROUP: &str = "SLUICE_CONSUMER_GROUP";
pub const ENV_STORAGE_DIR: &str = "SLUICE_STORAGE_DIR";
pub const ENV_LOG_DIR: &str = "SLUICE_LOG_DIR";
pub const ENV_CONSUMERS: &str = "SLUICE_CONSUMERS";
pub const ENV_SAVE_TIMEOUT_MS: &str = "SLUICE_SAVE_TIMEOUT_MS";
pub const ENV_APP_ENV: &str = "APP_ENV";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server_addr: SocketAddr,
    pub topic: Topic,
    pub dead_letter_topic: Topic,
    pub consumer_group: String,
    pub storage_dir: PathBuf,
    pub log_dir: PathBuf,
    pub consumers: usize,
    pub save_timeout: Option<Duration>,
    pub app_env: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` から設定を組み立てる（テストでは HashMap を渡す）
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let server_addr = parse(ENV_SERVER_ADDR, get(ENV_SERVER_ADDR, "0.0.0.0:8080"))?;
        let topic = Topic::new(non_empty(ENV_TOPIC, get(ENV_TOPIC, "data-pipeline-topic"))?);
        let dead_letter_topic = Topic::new(non_empty(
            ENV_DLT_TOPIC,
            get(ENV_DLT_TOPIC, "data-pipeline-dlt-topic"),
        )?);
        if dead_letter_topic == topic {
            return Err(ConfigError::Invalid {
                key: ENV_DLT_TOPIC,
                value: dead_letter_topic.to_string(),
                reason: format!("must differ from {ENV_TOPIC}"),
            });
        }
        let consumer_group = non_empty(
            ENV_CONSUMER_GROUP,
            get(ENV_CONSUMER_GROUP, "example-consumer-group"),
        )?;
        let storage_dir = PathBuf::from(non_empty(
            ENV_STORAGE_DIR,
            get(ENV_STORAGE_DIR, "./data/records"),
        )?);
        let log_dir = PathBuf::from(non_empty(ENV_LOG_DIR, get(ENV_LOG_DIR, "./data/log"))?);

        let consumers: usize = parse(ENV_CONSUMERS, get(ENV_CONSUMERS, "1"))?;
        if consumers == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_CONSUMERS,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let save_timeout = match lookup(ENV_SAVE_TIMEOUT_MS) {
            None => None,
            Some(raw) => Some(Duration::from_millis(parse(ENV_SAVE_TIMEOUT_MS, raw)?)),
        };

        Ok(Self {
            server_addr,
            topic,
            dead_letter_topic,
            consumer_group,
            storage_dir,
            log_dir,
            consumers,
            save_timeout,
            app_env: get(ENV_APP_ENV, "development"),
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            primary_topic: self.topic.clone(),
            dead_letter_topic: self.dead_letter_topic.clone(),
            consumer_group: self.consumer_group.clone(),
            consumers: self.consumers,
            save_timeout: self.save_timeout,
        }
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn non_empty(key: &'static str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            key,
            value,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(value)
}
