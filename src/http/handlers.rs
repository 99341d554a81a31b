//! Axum handlers for the read-only status endpoint

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::{audit::TargetSnapshot, errors::AppError, AppState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TargetsResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub targets: Vec<TargetSnapshot>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn list_targets(State(state): State<AppState>) -> Result<Json<TargetsResponse>, AppError> {
    let targets = state
        .board
        .snapshot()
        .map_err(|err| AppError::internal(err.to_string()))?;

    Ok(Json(TargetsResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        targets,
    }))
}

pub async fn get_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TargetSnapshot>, AppError> {
    state
        .board
        .get(&name)
        .map_err(|err| AppError::internal(err.to_string()))?
        .map(Json)
        .ok_or_else(|| AppError::not_found("unknown_target", format!("no observation for target '{name}'")))
}
