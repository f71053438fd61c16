use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};
use validator::Validate;

use crate::api::dto::{HealthDto, ReportQuery};
use crate::app_state::AppState;
use crate::domain::stats_service::{self, AggregatedReport};
use crate::errors::AppError;

/// GET /api/v1/super-mega-stats
pub async fn super_mega_stats(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<AggregatedReport>, AppError> {
    params
        .validate()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    let report = stats_service::build_report(
        state.tickets.as_ref(),
        state.metrics.as_ref(),
        params.start,
        params.end,
        Duration::from_secs(params.step),
    )
    .await?;

    Ok(Json(report))
}

/// GET /health — must stay available during backend outages, so the probe
/// result is downgraded to a boolean and never propagated as an error.
pub async fn health(State(state): State<AppState>) -> Json<HealthDto> {
    let database = state.tickets.is_healthy().await;
    Json(HealthDto {
        ok: database,
        database,
    })
}

/// GET / — static service metadata.
pub async fn root() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
