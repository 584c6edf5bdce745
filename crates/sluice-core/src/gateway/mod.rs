//! Gateway - HTTP の入口
//!
//! `POST /submit` で JSON を受け取り、検証して ProducerService に渡すだけの薄い層。
//!
//! | 状況 | status | body |
//! |---|---|---|
//! | JSON として読めない / 型が違う | 400 | `{"error":"Invalid JSON"}` |
//! | フィールド検証失敗 | 400 | `{"error":"field '<name>' failed on the '<rule>' rule"}` |
//! | publish 失敗 | 500 | `{"error":"Internal Server Error"}` |
//! | 成功 | 204 | 空 |

mod error;

pub use self::error::GatewayError;

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::app::ProducerService;
use crate::domain::EventCandidate;

pub fn router(producer: Arc<ProducerService>) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(producer)
}

async fn submit(
    State(producer): State<Arc<ProducerService>>,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    let candidate: EventCandidate =
        serde_json::from_slice(&body).map_err(GatewayError::InvalidJson)?;
    let record = candidate.validate()?;

    producer.submit(record).await?;
    Ok(StatusCode::NO_CONTENT)
}
