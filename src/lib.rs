use std::sync::Arc;

use axum::{middleware, routing::get, Router};

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod systemd_client;

use audit::{AuditError, AuditSink, FanoutSink, JsonLinesSink, LogLineSink, StatusBoard};
use config::MonitorConfig;

#[derive(Clone)]
pub struct AppState {
    pub board: Arc<StatusBoard>,
}

impl AppState {
    pub fn new(board: Arc<StatusBoard>) -> Self {
        Self { board }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/targets", get(http::handlers::list_targets))
        .route("/targets/{name}", get(http::handlers::get_target))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Log lines always; JSON records when `audit_path` is set; the status board
/// when one is supplied.
pub async fn build_audit_sink(
    config: &MonitorConfig,
    board: Option<Arc<StatusBoard>>,
) -> Result<Arc<dyn AuditSink>, AuditError> {
    let mut sink = FanoutSink::new().with(Arc::new(LogLineSink::new()));

    if let Some(path) = config.audit_path.as_ref() {
        sink = sink.with(Arc::new(JsonLinesSink::open(path).await?));
    }

    if let Some(board) = board {
        sink = sink.with(board);
    }

    Ok(Arc::new(sink))
}
