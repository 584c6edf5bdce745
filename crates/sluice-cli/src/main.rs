use std::sync::Arc;

use anyhow::Context;
use sluice_core::app::PipelineBuilder;
use sluice_core::config::Config;
use sluice_core::gateway;
use sluice_core::impls::{FileDurableLog, FileStorage};
use sluice_core::telemetry;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    // (A) 設定を環境変数から読む
    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(?config, "starting sluice");

    // (B) log と storage を用意してパイプラインを組み立てる
    let log = FileDurableLog::open(config.log_dir.clone())
        .await
        .with_context(|| format!("opening log at {}", config.log_dir.display()))?;
    let log = Arc::new(log);
    let storage = Arc::new(FileStorage::new(config.storage_dir.clone()));
    let pipeline = PipelineBuilder::new(config.pipeline_settings())
        .log(log)
        .storage(storage)
        .build()
        .context("building pipeline")?;

    // (C) consumer を起動（HTTP と並行して動く）
    let consumers = pipeline
        .start_consumers()
        .await
        .context("starting consumers")?;

    // (D) HTTP サーバー。Ctrl-C で新規受付を止める
    let app = gateway::router(pipeline.producer());
    let listener = TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("binding {}", config.server_addr))?;
    tracing::info!(addr = %config.server_addr, env = %config.app_env, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // (E) サーバーが止まったら consumer も止める（保存中のメッセージは完了を待つ）
    consumers.shutdown_and_join().await;
    tracing::info!("sluice stopped");

    served.context("http server")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        // シグナルを待てないなら、即停止せずサーバーを動かし続ける
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
